//! Background point-cloud reader.
//!
//! [`PointCloudStream`] moves a [`PointCloudReader`] onto a named thread and
//! reports progress over a bounded event queue. The last slot of the queue
//! is kept for the terminal `Finished`/`Failed` event.

use super::{PointCloudReader, ReaderSummary};
use crate::error::{Error, Result};
use crate::mop::{MopChannel, RecordControl};
use crate::retry::CancelToken;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, trace, warn};
use std::io::Write;
use std::thread::JoinHandle;
use std::time::Duration;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Progress reported by a background reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Channel opened after `attempts` tries.
    Connected {
        /// Connect attempts used.
        attempts: u32,
    },
    /// One datagram written.
    Batch {
        /// Sender's packet counter.
        packet_index: u32,
        /// Capture time in microseconds.
        timestamp_us: u64,
        /// Points written from this datagram.
        points: usize,
    },
    /// Remote end dropped; reconnecting.
    Reconnecting {
        /// Reconnects so far.
        reconnects: u32,
    },
    /// Reader finished normally.
    Finished(ReaderSummary),
    /// Reader stopped on an error.
    Failed(String),
}

type ThreadResult = (ReaderSummary, Result<()>);

/// A [`PointCloudReader`] running on its own thread.
///
/// Events arrive on a bounded queue. When the consumer falls behind, batch
/// events are dropped; the recorded data is not affected.
pub struct PointCloudStream {
    receiver: Receiver<StreamEvent>,
    cancel: CancelToken,
    thread: Option<JoinHandle<ThreadResult>>,
}

impl PointCloudStream {
    /// Start `reader` writing to `out`.
    pub fn spawn<C, W, R>(mut reader: PointCloudReader<C>, mut out: W, mut control: R) -> Result<Self>
    where
        C: MopChannel + 'static,
        W: Write + Send + 'static,
        R: RecordControl + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY);
        let cancel = reader.cancel_token();

        let events = sender.clone();
        reader.set_observer(Box::new(move |event| {
            // The reader thread is the only producer, so this keeps one slot free.
            if events.len() + 1 >= EVENT_QUEUE_CAPACITY {
                trace!("Point-cloud event queue full, dropping event");
                return;
            }
            let _ = events.try_send(event);
        }));

        let thread = std::thread::Builder::new()
            .name("payloadlink-pointcloud".into())
            .spawn(move || {
                info!("Point-cloud reader started");
                let result = reader
                    .run(&mut out, &mut control)
                    .map(|_| ());
                let summary = reader.summary();
                let last = match &result {
                    Ok(()) => StreamEvent::Finished(summary),
                    Err(e) => StreamEvent::Failed(e.to_string()),
                };
                if sender.send(last).is_err() {
                    warn!("Point-cloud stream consumer is gone, terminal event not delivered");
                }
                info!("Point-cloud reader stopped");
                (summary, result)
            })
            .map_err(|e| Error::System(format!("Failed to spawn point-cloud thread: {e}")))?;

        Ok(Self {
            receiver,
            cancel,
            thread: Some(thread),
        })
    }

    /// Next event, blocking. `None` once the reader is gone and the queue
    /// is drained.
    pub fn recv(&self) -> Option<StreamEvent> {
        self.receiver.recv().ok()
    }

    /// Next event if one is queued.
    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }

    /// Next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<StreamEvent>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout("no point-cloud event".into())),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Whether the reader thread is still running.
    pub fn is_active(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Ask the reader to stop, wait for it and return its counters.
    ///
    /// A stop requested here is not an error.
    pub fn stop(mut self) -> Result<ReaderSummary> {
        self.cancel.cancel();
        match self.join()? {
            (summary, Ok(()) | Err(Error::Cancelled)) => Ok(summary),
            (_, Err(e)) => Err(e),
        }
    }

    /// Wait for the reader to finish on its own.
    pub fn wait(mut self) -> Result<ReaderSummary> {
        let (summary, result) = self.join()?;
        result.map(|()| summary)
    }

    fn join(&mut self) -> Result<ThreadResult> {
        self.thread
            .take()
            .ok_or_else(|| Error::InvalidState("point-cloud stream already joined".into()))?
            .join()
            .map_err(|_| Error::System("point-cloud thread panicked".into()))
    }
}

impl Drop for PointCloudStream {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel.cancel();
            let _ = thread.join();
        }
    }
}
