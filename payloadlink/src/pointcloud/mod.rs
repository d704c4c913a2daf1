//! Point-cloud channel reading.
//!
//! Each datagram on the point-cloud channel is a 16-byte header followed by
//! packed 15-byte XYZRGB records:
//!
//! ```text
//! +--------------+---------------+-------------+----------------------+
//! | packet_index | timestamp_us  | data_byte   | records ...          |
//! |   u32 LE     |   u64 LE      |   u32 LE    | x y z f32, r g b u8  |
//! +--------------+---------------+-------------+----------------------+
//! ```
//!
//! [`PointCloudReader`] drives a [`MopChannel`] through
//! `Disconnected -> Connecting -> Streaming -> Stopped`, reconnecting after
//! the remote end drops, and appends the valid records of every datagram to
//! an output stream (the `.ldrt` format).

pub mod ldrt;
pub mod pcd;
mod stream;

pub use stream::{PointCloudStream, StreamEvent};

use crate::error::{Error, Result};
use crate::mop::{MopChannel, RecordControl};
use crate::retry::{CancelToken, RetryPolicy};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::io::{Read, Seek, Write};
use std::time::Duration;

/// Size of the datagram header.
pub const HEADER_LEN: usize = 16;

/// One point as carried on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointXyzRgb {
    /// X in metres.
    pub x: f32,
    /// Y in metres.
    pub y: f32,
    /// Z in metres.
    pub z: f32,
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
}

impl PointXyzRgb {
    /// Packed record size.
    pub const SIZE: usize = 15;

    /// Decode one record. `bytes` must hold at least [`Self::SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            x: LittleEndian::read_f32(&bytes[0..4]),
            y: LittleEndian::read_f32(&bytes[4..8]),
            z: LittleEndian::read_f32(&bytes[8..12]),
            r: bytes[12],
            g: bytes[13],
            b: bytes[14],
        }
    }

    /// Encode to the packed record layout.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        LittleEndian::write_f32(&mut out[0..4], self.x);
        LittleEndian::write_f32(&mut out[4..8], self.y);
        LittleEndian::write_f32(&mut out[8..12], self.z);
        out[12] = self.r;
        out[13] = self.g;
        out[14] = self.b;
        out
    }
}

/// Datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointCloudHeader {
    /// Sender's packet counter.
    pub packet_index: u32,
    /// Capture time in microseconds.
    pub timestamp_us: u64,
    /// Record bytes the sender claims follow the header.
    pub data_byte: u32,
}

impl PointCloudHeader {
    /// Encode the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.packet_index);
        LittleEndian::write_u64(&mut out[4..12], self.timestamp_us);
        LittleEndian::write_u32(&mut out[12..16], self.data_byte);
        out
    }
}

/// A parsed datagram, borrowing its record bytes.
#[derive(Debug, Clone, Copy)]
pub struct PointCloudFrame<'a> {
    /// Header as received.
    pub header: PointCloudHeader,
    records: &'a [u8],
    /// Whether `data_byte` claimed more than could be used.
    pub clamped: bool,
}

impl<'a> PointCloudFrame<'a> {
    /// Parse a datagram.
    ///
    /// Only whole records that are both claimed by `data_byte`, actually
    /// present and within `capacity_bytes` are kept.
    pub fn parse(buf: &'a [u8], capacity_bytes: usize) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "datagram of {} bytes is shorter than the {HEADER_LEN}-byte header",
                buf.len()
            )));
        }
        let header = PointCloudHeader {
            packet_index: LittleEndian::read_u32(&buf[0..4]),
            timestamp_us: LittleEndian::read_u64(&buf[4..12]),
            data_byte: LittleEndian::read_u32(&buf[12..16]),
        };

        let claimed = header.data_byte as usize;
        let usable = (buf.len() - HEADER_LEN).min(capacity_bytes);
        let valid = claimed.min(usable);
        let count = valid / PointXyzRgb::SIZE;

        Ok(Self {
            header,
            records: &buf[HEADER_LEN..HEADER_LEN + count * PointXyzRgb::SIZE],
            clamped: claimed > usable,
        })
    }

    /// Number of valid records.
    pub fn point_count(&self) -> usize {
        self.records.len() / PointXyzRgb::SIZE
    }

    /// Valid record bytes.
    pub fn records(&self) -> &'a [u8] {
        self.records
    }

    /// Decoded points.
    pub fn points(&self) -> impl Iterator<Item = PointXyzRgb> + 'a {
        self.records
            .chunks_exact(PointXyzRgb::SIZE)
            .map(PointXyzRgb::decode)
    }
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct PointCloudReaderConfig {
    /// Receive buffer size per datagram.
    pub receive_buffer_size: usize,
    /// Largest record payload kept per datagram.
    pub staging_capacity: usize,
    /// Stop after this many datagrams. `None` runs until cancelled.
    pub packet_target: Option<u64>,
    /// Connect/reconnect policy, applied per outage.
    pub reconnect: RetryPolicy,
}

impl Default for PointCloudReaderConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: 512 * 1024,
            staging_capacity: 512 * 1024,
            packet_target: None,
            reconnect: RetryPolicy::fixed(Duration::from_secs(3), 10),
        }
    }
}

impl PointCloudReaderConfig {
    /// Stop after `packets` datagrams.
    #[must_use]
    pub fn with_packet_target(mut self, packets: u64) -> Self {
        self.packet_target = Some(packets);
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set both buffer sizes.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.receive_buffer_size = bytes.max(HEADER_LEN);
        self.staging_capacity = bytes;
        self
    }
}

/// Reader lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No channel open.
    Disconnected,
    /// Opening the channel.
    Connecting,
    /// Receiving datagrams.
    Streaming,
    /// Finished; recording stopped.
    Stopped,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    /// Datagrams written.
    pub packets: u64,
    /// Points written.
    pub points: u64,
    /// Record bytes written.
    pub bytes: u64,
    /// Reconnects after the remote end dropped.
    pub reconnects: u32,
    /// Datagrams whose `data_byte` had to be clamped.
    pub clamped: u64,
}

type Observer = Box<dyn FnMut(StreamEvent) + Send>;

/// Drives a [`MopChannel`] and writes point records to an output stream.
pub struct PointCloudReader<C: MopChannel> {
    channel: C,
    config: PointCloudReaderConfig,
    cancel: CancelToken,
    state: ReaderState,
    summary: ReaderSummary,
    recv_buf: Vec<u8>,
    staging: Vec<u8>,
    observer: Option<Observer>,
}

impl<C: MopChannel> PointCloudReader<C> {
    /// Create a reader. Buffers are allocated here.
    pub fn new(channel: C, config: PointCloudReaderConfig) -> Self {
        let recv_buf = vec![0u8; config.receive_buffer_size.max(HEADER_LEN)];
        let staging = Vec::with_capacity(config.staging_capacity);
        Self {
            channel,
            config,
            cancel: CancelToken::new(),
            state: ReaderState::Disconnected,
            summary: ReaderSummary::default(),
            recv_buf,
            staging,
            observer: None,
        }
    }

    /// Use an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops [`run`](Self::run).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn set_observer(&mut self, observer: Observer) {
        self.observer = Some(observer);
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Counters of the current or last run.
    pub fn summary(&self) -> ReaderSummary {
        self.summary
    }

    /// Configuration in use.
    pub fn config(&self) -> &PointCloudReaderConfig {
        &self.config
    }

    /// Give the channel back.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Stream until the packet target, cancellation or a fatal error.
    ///
    /// Whatever ends the run, the channel is closed and `stop_record` is
    /// issued before returning.
    pub fn run<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        control: &mut dyn RecordControl,
    ) -> Result<ReaderSummary> {
        self.summary = ReaderSummary::default();
        let result = self.stream(out);

        if let Err(e) = self.channel.close() {
            warn!("Failed to close point-cloud channel: {e}");
        }
        let stopped = control.stop_record();

        match result {
            Ok(()) => {
                self.state = ReaderState::Stopped;
                stopped?;
                info!(
                    "Point-cloud recording finished: {} packets, {} points",
                    self.summary.packets, self.summary.points
                );
                Ok(self.summary)
            },
            Err(e) => {
                if let Err(stop_err) = stopped {
                    warn!("stop_record failed after '{e}': {stop_err}");
                }
                self.state = if matches!(e, Error::Cancelled) {
                    ReaderState::Stopped
                } else {
                    ReaderState::Disconnected
                };
                Err(e)
            },
        }
    }

    fn target_reached(&self) -> bool {
        self.config
            .packet_target
            .is_some_and(|target| self.summary.packets >= target)
    }

    fn stream<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        // Consecutive drops with no datagram in between.
        let mut idle_drops = 0u32;
        loop {
            self.cancel.check()?;
            if self.target_reached() {
                return Ok(());
            }
            if !self.channel.is_connected() {
                self.connect()?;
            }

            match self.channel.recv(&mut self.recv_buf) {
                Ok(len) => {
                    self.handle_datagram(len, out)?;
                    idle_drops = 0;
                },
                Err(Error::Timeout(_)) => {},
                Err(Error::ConnectionClosed) => {
                    self.summary.reconnects += 1;
                    self.state = ReaderState::Disconnected;
                    warn!(
                        "Point-cloud channel closed by remote (reconnect #{})",
                        self.summary.reconnects
                    );
                    self.emit(StreamEvent::Reconnecting {
                        reconnects: self.summary.reconnects,
                    });
                    if let Err(e) = self.channel.close() {
                        warn!("Failed to close dropped point-cloud channel: {e}");
                    }
                    idle_drops += 1;
                    let budget = self.config.reconnect.max_attempts.max(1);
                    if idle_drops >= budget {
                        warn!("Point-cloud channel dropped {idle_drops} times without data, giving up");
                        return Err(Error::RetriesExhausted {
                            what: "point-cloud channel reconnect".into(),
                            attempts: idle_drops,
                            last: Box::new(Error::ConnectionClosed),
                        });
                    }
                    self.cancel
                        .sleep(self.config.reconnect.delay_for(idle_drops))?;
                },
                Err(e) => {
                    warn!("Point-cloud receive failed: {e}");
                    return Err(e);
                },
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.state = ReaderState::Connecting;
        let channel = &mut self.channel;
        let attempts = self
            .config
            .reconnect
            .run(&self.cancel, "point-cloud channel connect", |attempt| {
                channel.connect().map(|()| attempt)
            })?;
        self.state = ReaderState::Streaming;
        debug!("Point-cloud channel connected (attempt {attempts})");
        self.emit(StreamEvent::Connected { attempts });
        Ok(())
    }

    fn handle_datagram<W: Write + ?Sized>(&mut self, len: usize, out: &mut W) -> Result<()> {
        let frame = match PointCloudFrame::parse(&self.recv_buf[..len], self.config.staging_capacity) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping datagram: {e}");
                return Ok(());
            },
        };
        let header = frame.header;
        let points = frame.point_count();
        if frame.clamped {
            warn!(
                "Packet {} claims {} bytes, keeping {} points",
                header.packet_index, header.data_byte, points
            );
            self.summary.clamped += 1;
        }

        self.staging.clear();
        self.staging
            .extend_from_slice(frame.records());
        out.write_all(&self.staging)?;
        out.flush()?;

        self.summary.packets += 1;
        self.summary.points += points as u64;
        self.summary.bytes += self.staging.len() as u64;
        self.emit(StreamEvent::Batch {
            packet_index: header.packet_index,
            timestamp_us: header.timestamp_us,
            points,
        });
        Ok(())
    }

    fn emit(&mut self, event: StreamEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }
}

/// Counters from an `.ldrt` to PCD conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    /// Points converted.
    pub points: u64,
    /// Bytes of an incomplete trailing record that were ignored.
    pub trailing_bytes: usize,
}

/// Convert an `.ldrt` record stream to a binary PCD file.
pub fn convert_ldrt_to_pcd<R: Read, W: Write + Seek>(input: R, output: W) -> Result<ConvertSummary> {
    let mut reader = ldrt::LdrtReader::new(input);
    let mut writer = pcd::PcdWriter::new(output)?;
    for point in reader.by_ref() {
        writer.write_point(&pcd::PcdPoint::from(point?))?;
    }
    let points = writer.points();
    writer.finish()?;
    Ok(ConvertSummary {
        points,
        trailing_bytes: reader.trailing_bytes(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    pub(crate) fn datagram(packet_index: u32, points: &[PointXyzRgb], data_byte: Option<u32>) -> Vec<u8> {
        let records: Vec<u8> = points.iter().flat_map(PointXyzRgb::encode).collect();
        let header = PointCloudHeader {
            packet_index,
            timestamp_us: u64::from(packet_index) * 100,
            data_byte: data_byte.unwrap_or(records.len() as u32),
        };
        let mut out = header.encode().to_vec();
        out.extend(records);
        out
    }

    pub(crate) fn point(i: u8) -> PointXyzRgb {
        PointXyzRgb {
            x: f32::from(i),
            y: -f32::from(i),
            z: 0.5,
            r: i,
            g: 0,
            b: 255,
        }
    }

    /// Scripted channel: each connect loads the next session of recv results.
    #[derive(Default)]
    pub(crate) struct MockChannel {
        pub sessions: VecDeque<VecDeque<Result<Vec<u8>>>>,
        pub current: Option<VecDeque<Result<Vec<u8>>>>,
        pub connects: u32,
        pub closes: u32,
        pub failing_connects: u32,
    }

    impl MopChannel for MockChannel {
        fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            if self.failing_connects > 0 {
                self.failing_connects -= 1;
                return Err(Error::ConnectionClosed);
            }
            self.current = Some(self.sessions.pop_front().unwrap_or_default());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let session = self.current.as_mut().ok_or(Error::ConnectionClosed)?;
            match session.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                },
                Some(Err(e)) => Err(e),
                None => {
                    self.current = None;
                    Err(Error::ConnectionClosed)
                },
            }
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            self.current = None;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.current.is_some()
        }
    }

    #[derive(Default)]
    pub(crate) struct StopCounter {
        pub stops: u32,
    }

    impl RecordControl for StopCounter {
        fn stop_record(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }
    }

    fn config(target: u64) -> PointCloudReaderConfig {
        PointCloudReaderConfig::default()
            .with_packet_target(target)
            .with_reconnect(RetryPolicy::fixed(Duration::ZERO, 3))
    }

    fn session(datagrams: Vec<Vec<u8>>) -> VecDeque<Result<Vec<u8>>> {
        datagrams.into_iter().map(Ok).collect()
    }

    #[test]
    fn test_frame_parse_counts() {
        let buf = datagram(1, &[point(1), point(2), point(3)], None);
        let frame = PointCloudFrame::parse(&buf, 1024).unwrap();
        assert_eq!(frame.header.packet_index, 1);
        assert_eq!(frame.point_count(), 3);
        assert!(!frame.clamped);
        assert_eq!(frame.points().nth(1), Some(point(2)));
    }

    #[test]
    fn test_frame_clamps_oversized_data_byte() {
        let buf = datagram(2, &[point(1), point(2)], Some(10_000));
        let frame = PointCloudFrame::parse(&buf, 1024).unwrap();
        assert_eq!(frame.point_count(), 2);
        assert!(frame.clamped);

        // Capacity is the tighter bound.
        let frame = PointCloudFrame::parse(&buf, 20).unwrap();
        assert_eq!(frame.point_count(), 1);

        // Partial trailing record is dropped.
        let frame = PointCloudFrame::parse(&buf[..buf.len() - 1], 1024).unwrap();
        assert_eq!(frame.point_count(), 1);

        // data_byte smaller than what arrived wins.
        let buf = datagram(3, &[point(1), point(2)], Some(15));
        assert_eq!(PointCloudFrame::parse(&buf, 1024).unwrap().point_count(), 1);
    }

    #[test]
    fn test_frame_too_short() {
        assert!(matches!(
            PointCloudFrame::parse(&[0u8; 10], 1024),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_reader_stops_at_packet_target() {
        let mut channel = MockChannel::default();
        channel.sessions.push_back(session(vec![
            datagram(0, &[point(1)], None),
            datagram(1, &[point(2), point(3)], None),
            datagram(2, &[point(4)], None),
            datagram(3, &[point(5)], None),
        ]));
        let mut reader = PointCloudReader::new(channel, config(3));
        let mut out = Vec::new();
        let mut control = StopCounter::default();

        let summary = reader.run(&mut out, &mut control).unwrap();

        assert_eq!(summary.packets, 3);
        assert_eq!(summary.points, 4);
        assert_eq!(out.len(), 4 * PointXyzRgb::SIZE);
        assert_eq!(PointXyzRgb::decode(&out[15..30]), point(2));
        assert_eq!(control.stops, 1);
        assert_eq!(reader.state(), ReaderState::Stopped);
        assert!(!reader.into_channel().is_connected());
    }

    #[test]
    fn test_reader_reconnects_after_close() {
        let mut channel = MockChannel::default();
        channel.sessions.push_back(session(vec![datagram(0, &[point(1)], None)]));
        channel.sessions.push_back(session(vec![datagram(1, &[point(2)], None)]));
        let mut reader = PointCloudReader::new(channel, config(2));
        let mut out = Vec::new();

        let summary = reader.run(&mut out, &mut StopCounter::default()).unwrap();

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.reconnects, 1);
        assert_eq!(reader.into_channel().connects, 2);
    }

    #[test]
    fn test_reader_other_errors_are_fatal() {
        let mut channel = MockChannel::default();
        let mut s = session(vec![datagram(0, &[point(1)], None)]);
        s.push_back(Err(Error::Protocol("garbage".into())));
        channel.sessions.push_back(s);
        let mut reader = PointCloudReader::new(channel, config(10));
        let mut control = StopCounter::default();

        let result = reader.run(&mut Vec::new(), &mut control);

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(control.stops, 1);
        assert_eq!(reader.summary().packets, 1);
        assert_eq!(reader.state(), ReaderState::Disconnected);
    }

    #[test]
    fn test_reader_gives_up_after_connect_budget() {
        let channel = MockChannel {
            failing_connects: 100,
            ..MockChannel::default()
        };
        let mut reader = PointCloudReader::new(channel, config(1));
        let result = reader.run(&mut Vec::new(), &mut StopCounter::default());
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(reader.into_channel().connects, 3);
    }

    #[test]
    fn test_reader_gives_up_on_links_that_never_deliver() {
        // Every connect succeeds but every session is empty.
        let mut reader = PointCloudReader::new(MockChannel::default(), config(1));
        let mut control = StopCounter::default();

        let result = reader.run(&mut Vec::new(), &mut control);

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 3, ref last, .. })
                if matches!(**last, Error::ConnectionClosed)
        ));
        assert_eq!(control.stops, 1);
        assert_eq!(reader.summary().reconnects, 3);
        assert_eq!(reader.into_channel().connects, 3);
    }

    #[test]
    fn test_reader_drop_budget_resets_after_data() {
        let mut channel = MockChannel::default();
        // Two empty sessions, one with data, two more empty, then data again.
        channel.sessions.push_back(VecDeque::new());
        channel.sessions.push_back(VecDeque::new());
        channel.sessions.push_back(session(vec![datagram(0, &[point(1)], None)]));
        channel.sessions.push_back(VecDeque::new());
        channel.sessions.push_back(session(vec![datagram(1, &[point(2)], None)]));
        let mut reader = PointCloudReader::new(channel, config(2));

        let summary = reader.run(&mut Vec::new(), &mut StopCounter::default()).unwrap();

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.reconnects, 4);
    }

    #[test]
    fn test_reader_cancelled() {
        let mut channel = MockChannel::default();
        channel.sessions.push_back(session(vec![datagram(0, &[point(1)], None)]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut reader = PointCloudReader::new(channel, config(5)).with_cancel(cancel);
        let mut control = StopCounter::default();

        assert!(matches!(
            reader.run(&mut Vec::new(), &mut control),
            Err(Error::Cancelled)
        ));
        assert_eq!(control.stops, 1);
        assert_eq!(reader.state(), ReaderState::Stopped);
    }

    #[test]
    fn test_reader_skips_short_datagrams_and_timeouts() {
        let mut channel = MockChannel::default();
        let mut s = VecDeque::new();
        s.push_back(Ok(vec![1, 2, 3]));
        s.push_back(Err(Error::Timeout("idle".into())));
        s.push_back(Ok(datagram(0, &[point(9)], Some(999))));
        channel.sessions.push_back(s);
        let mut reader = PointCloudReader::new(channel, config(1));

        let summary = reader.run(&mut Vec::new(), &mut StopCounter::default()).unwrap();
        assert_eq!(summary.packets, 1);
        assert_eq!(summary.clamped, 1);
        assert_eq!(summary.reconnects, 0);
    }

    #[test]
    fn test_convert_ldrt_to_pcd() {
        let mut ldrt: Vec<u8> = [point(1), point(2)]
            .iter()
            .flat_map(PointXyzRgb::encode)
            .collect();
        ldrt.extend_from_slice(&[0xAB; 4]);

        let mut out = std::io::Cursor::new(Vec::new());
        let summary = convert_ldrt_to_pcd(ldrt.as_slice(), &mut out).unwrap();
        assert_eq!(summary.points, 2);
        assert_eq!(summary.trailing_bytes, 4);

        out.set_position(0);
        let header = pcd::PcdHeader::read_from(&mut out).unwrap();
        assert_eq!(header.points, 2);
        assert_eq!(header.width, 2);
    }
}
