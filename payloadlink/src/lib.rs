//! # payloadlink
//!
//! Client-side plumbing for a companion computer attached to a drone payload
//! port.
//!
//! The payload core (link layer, command codec, MOP transport) is an opaque
//! dependency reached through the traits in this crate. What lives here is
//! everything on the caller's side of that boundary:
//!
//! - Media file list model and its fixed-width wire layout
//! - Transfer event dispatch (START / TRANSFER / END / ABORT) onto files
//! - Index-driven batch downloads with bounded retry and downloader rights
//! - Point-cloud channel reading with reconnects, clamped frame parsing and
//!   `.ldrt` / PCD output
//! - Widget state, speaker upload state machine and H.264 liveview dumps
//!
//! ## Features
//!
//! - `native` (default): serial links via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use payloadlink::{
//!     DirectoryMediaSource, DirectorySourceConfig, DownloadDispatcher, DownloadDriver,
//!     DownloadSession, MediaSource, MountPosition, RetryPolicy,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mount = MountPosition::Payload1;
//!     let mut source = DirectoryMediaSource::open(DirectorySourceConfig::new("/media/card"))?;
//!     let files = source.download_file_list(mount)?;
//!
//!     let session = DownloadSession::new("downloads", mount, files.clone());
//!     let mut dispatcher = DownloadDispatcher::new(session);
//!
//!     let driver = DownloadDriver::new(RetryPolicy::default());
//!     let report = driver.download_all(&mut source, mount, &files, &mut dispatcher, |done, total, _| {
//!         println!("{done}/{total}");
//!     })?;
//!     println!("{} files downloaded", report.succeeded());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod download;
pub mod error;
pub mod link;
pub mod liveview;
pub mod media;
pub mod mop;
pub mod mount;
pub mod pointcloud;
pub mod retry;
pub mod source;
pub mod speaker;
pub mod transfer;
pub mod widget;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Every
/// [`CancelToken`] consults it in addition to its own flag.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use link::{SerialConnector, SerialLink};
pub use {
    download::{
        DownloadDriver, DownloadReport, DownloadTarget, DownloaderRights, FileOutcome, MediaSource,
    },
    error::{Error, Result, ReturnCode},
    link::{
        Connector, DetectedPort, Link, PortKind, SerialConfig, TcpConfig, TcpConnector, TcpLink,
        list_serial_ports,
    },
    liveview::{CameraSource, H264Recorder},
    media::{
        CreateTime, MediaFileAttribute, MediaFileList, MediaFileListEntry, MediaFileType,
        NameWidth, SubFileEntry, SubFileType,
    },
    mop::{FramedMopChannel, MopChannel, RecordControl},
    mount::MountPosition,
    pointcloud::{
        ConvertSummary, PointCloudFrame, PointCloudHeader, PointCloudReader,
        PointCloudReaderConfig, PointCloudStream, PointXyzRgb, ReaderState, ReaderSummary,
        StreamEvent, convert_ldrt_to_pcd,
        ldrt::LdrtReader,
        pcd::{PcdHeader, PcdPoint, PcdWriter},
    },
    retry::{CancelToken, RetryPolicy},
    source::{DirectoryMediaSource, DirectorySourceConfig},
    speaker::{
        PlayingFile, Speaker, SpeakerBackend, SpeakerPlayMode, SpeakerState, SpeakerSystemState,
        SpeakerUpload, SpeakerWorkMode, UploadKind,
    },
    transfer::{
        DownloadDispatcher, DownloadSession, MAX_CHUNK_LEN, QueuedSink, TransferEventInfo,
        TransferEventKind, TransferSink, TransferStats, TransferWriter, spawn_transfer_writer,
    },
    widget::{WidgetState, WidgetStore, WidgetType},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_cancel_token_without_checker_follows_own_flag() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
