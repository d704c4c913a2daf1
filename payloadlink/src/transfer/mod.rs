//! Transfer events and the sinks that consume them.
//!
//! The payload core pushes a file to the host as a sequence of events:
//!
//! ```text
//! START ──> TRANSFER* ──> END
//!   │           │
//!   └───────────┴──────> ABORT
//!
//! START_TRANSFER_END   (single-shot, small files)
//! ```
//!
//! Every event carries the file it belongs to, an authoritative byte
//! offset and a chunk of data. [`TransferSink`] is the Rust form of the
//! core's download callback.

mod dispatcher;
mod queue;

pub use dispatcher::{DownloadDispatcher, DownloadSession, TransferStats};
pub use queue::{QueuedSink, TransferWriter, spawn_transfer_writer};

use crate::error::{Error, Result};
use crate::media::{MediaFileType, SubFileType};

/// Largest chunk a single event may carry (the core's `uint16_t` length).
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferEventKind {
    /// First chunk; opens the destination.
    Start,
    /// Intermediate chunk.
    Transfer,
    /// Final chunk; closes and syncs the destination.
    End,
    /// Remote side gave up; the destination is closed as-is.
    Abort,
    /// Whole file in one event.
    StartTransferEnd,
}

/// Metadata attached to every transfer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEventInfo {
    /// Event phase.
    pub kind: TransferEventKind,
    /// Index of the file in the session's file list.
    pub file_index: u32,
    /// Sub-file being transferred, for composite entries.
    pub sub_type: Option<SubFileType>,
    /// Total size of the file being transferred.
    pub file_size: u64,
    /// Progress as reported by the core. Display only.
    pub progress_percent: u8,
    /// Type of the file being transferred.
    pub file_type: MediaFileType,
}

impl TransferEventInfo {
    /// Event info for a top-level file.
    pub fn new(
        kind: TransferEventKind,
        file_index: u32,
        file_size: u64,
        file_type: MediaFileType,
    ) -> Self {
        Self {
            kind,
            file_index,
            sub_type: None,
            file_size,
            progress_percent: 0,
            file_type,
        }
    }

    /// Attach a sub-file type.
    #[must_use]
    pub fn with_sub_type(mut self, sub_type: Option<SubFileType>) -> Self {
        self.sub_type = sub_type;
        self
    }

    /// Attach the reported progress.
    #[must_use]
    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress_percent = percent.min(100);
        self
    }

    /// Same file, different phase.
    #[must_use]
    pub fn with_kind(mut self, kind: TransferEventKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Consumer of transfer events.
///
/// Implementations must treat `offset` as authoritative: a chunk replayed at
/// the same offset overwrites, it never appends.
pub trait TransferSink {
    /// Handle one event.
    fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()>;
}

impl<S: TransferSink + ?Sized> TransferSink for &mut S {
    fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
        (**self).on_event(info, offset, data)
    }
}

impl<S: TransferSink + ?Sized> TransferSink for Box<S> {
    fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
        (**self).on_event(info, offset, data)
    }
}

pub(crate) fn check_chunk_len(data: &[u8]) -> Result<()> {
    if data.len() > MAX_CHUNK_LEN {
        Err(Error::InvalidParameter(format!(
            "chunk of {} bytes exceeds the {MAX_CHUNK_LEN}-byte limit",
            data.len()
        )))
    } else {
        Ok(())
    }
}
