//! Bounded queue between the event producer and a writer thread.
//!
//! The producer side only copies chunks into the queue; all filesystem work
//! happens on the writer thread. A full queue blocks the producer.

use super::{TransferEventInfo, TransferSink, check_chunk_len};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};
use std::thread::JoinHandle;

struct QueuedEvent {
    info: TransferEventInfo,
    offset: u64,
    data: Vec<u8>,
}

/// Producer half: a [`TransferSink`] that enqueues events.
#[derive(Clone)]
pub struct QueuedSink {
    sender: Sender<QueuedEvent>,
}

impl TransferSink for QueuedSink {
    fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
        check_chunk_len(data)?;
        self.sender
            .send(QueuedEvent {
                info: info.clone(),
                offset,
                data: data.to_vec(),
            })
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Consumer half: owns the writer thread.
pub struct TransferWriter<S> {
    thread: Option<JoinHandle<Result<S>>>,
}

impl<S> TransferWriter<S> {
    /// Wait for the writer to drain the queue and return the sink.
    ///
    /// Every [`QueuedSink`] clone must be dropped first, otherwise the queue
    /// never closes. Returns the first error the sink reported.
    pub fn finish(mut self) -> Result<S> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::System("transfer writer thread panicked".into()))?,
            None => Err(Error::InvalidState("transfer writer already finished".into())),
        }
    }
}

/// Move `sink` onto a writer thread fed by a queue of `capacity` events.
pub fn spawn_transfer_writer<S>(sink: S, capacity: usize) -> Result<(QueuedSink, TransferWriter<S>)>
where
    S: TransferSink + Send + 'static,
{
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));

    let thread = std::thread::Builder::new()
        .name("payloadlink-transfer".into())
        .spawn(move || writer_loop(sink, receiver))
        .map_err(|e| Error::System(format!("Failed to spawn transfer writer: {e}")))?;

    Ok((
        QueuedSink { sender },
        TransferWriter {
            thread: Some(thread),
        },
    ))
}

fn writer_loop<S: TransferSink>(mut sink: S, receiver: Receiver<QueuedEvent>) -> Result<S> {
    debug!("Transfer writer started");
    for event in &receiver {
        if let Err(e) = sink.on_event(&event.info, event.offset, &event.data) {
            error!(
                "Transfer writer stopping on {:?} for file {}: {e}",
                event.info.kind, event.info.file_index
            );
            // Dropping the receiver makes further sends fail.
            return Err(e);
        }
    }
    debug!("Transfer writer drained");
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaFileType;
    use crate::transfer::TransferEventKind;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(TransferEventKind, u64, usize)>,
        fail_on: Option<TransferEventKind>,
    }

    impl TransferSink for Recorder {
        fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
            if self.fail_on == Some(info.kind) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.events.push((info.kind, offset, data.len()));
            Ok(())
        }
    }

    fn info(kind: TransferEventKind) -> TransferEventInfo {
        TransferEventInfo::new(kind, 3, 8, MediaFileType::Mp4)
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (mut sink, writer) = spawn_transfer_writer(Recorder::default(), 2).unwrap();
        sink.on_event(&info(TransferEventKind::Start), 0, b"abcd")
            .unwrap();
        sink.on_event(&info(TransferEventKind::Transfer), 4, b"ef")
            .unwrap();
        sink.on_event(&info(TransferEventKind::End), 6, b"gh")
            .unwrap();
        drop(sink);

        let recorder = writer.finish().unwrap();
        assert_eq!(
            recorder.events,
            vec![
                (TransferEventKind::Start, 0, 4),
                (TransferEventKind::Transfer, 4, 2),
                (TransferEventKind::End, 6, 2),
            ]
        );
    }

    #[test]
    fn test_sink_error_stops_writer() {
        let recorder = Recorder {
            fail_on: Some(TransferEventKind::Transfer),
            ..Recorder::default()
        };
        let (mut sink, writer) = spawn_transfer_writer(recorder, 1).unwrap();
        sink.on_event(&info(TransferEventKind::Start), 0, b"ab")
            .unwrap();

        // Keep sending until the writer has gone away.
        let mut closed = false;
        for i in 0..1000u64 {
            if let Err(e) = sink.on_event(&info(TransferEventKind::Transfer), i, b"x") {
                assert!(matches!(e, Error::ConnectionClosed));
                closed = true;
                break;
            }
        }
        assert!(closed);
        drop(sink);

        assert!(matches!(writer.finish(), Err(Error::Io(_))));
    }
}
