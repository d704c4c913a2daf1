//! MOP channels: the datagram pipe point-cloud data arrives on.
//!
//! [`MopChannel`] is the surface the reader drives. [`FramedMopChannel`] is
//! a local implementation over any [`Connector`], using this frame layout:
//!
//! ```text
//! +------+------+----------+------------+-----------+
//! | "MP" | kind | reserved | length u32 | payload   |
//! +------+------+----------+------------+-----------+
//!   2      1      1          4 (LE)       length
//! ```
//!
//! Kinds: `0x00` data, `0x01` open (payload: channel id u16 LE),
//! `0x02` stop record (no payload).

use crate::error::{Error, Result};
use crate::link::{Connector, Link};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, trace, warn};
use std::io::{self, Read, Write};

/// Frame magic.
pub const FRAME_MAGIC: [u8; 2] = *b"MP";

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// A datagram channel to the payload.
pub trait MopChannel: Send {
    /// Open (or reopen) the channel.
    fn connect(&mut self) -> Result<()>;

    /// Receive one datagram into `buf`, returning its length.
    ///
    /// [`Error::ConnectionClosed`] means the remote end went away and a
    /// reconnect may help. [`Error::Timeout`] means nothing arrived yet.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the channel.
    fn close(&mut self) -> Result<()>;

    /// Whether the channel is open.
    fn is_connected(&self) -> bool;
}

/// Recording control on the payload side.
pub trait RecordControl {
    /// Tell the payload to stop recording.
    fn stop_record(&mut self) -> Result<()>;
}

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Datagram payload.
    Data,
    /// Channel open request.
    Open,
    /// Stop recording.
    StopRecord,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Open => 0x01,
            Self::StopRecord => 0x02,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::Open),
            0x02 => Some(Self::StopRecord),
            _ => None,
        }
    }
}

/// Write one frame.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidParameter(format!(
            "frame payload of {} bytes exceeds {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(kind.as_u8());
    frame.push(0);
    frame.write_u32::<LittleEndian>(payload.len() as u32)?;
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// [`MopChannel`] over a framed byte link.
pub struct FramedMopChannel<C: Connector> {
    connector: C,
    channel_id: u16,
    link: Option<C::Link>,
}

impl<C: Connector> FramedMopChannel<C> {
    /// Channel `channel_id` reached through `connector`. Not connected yet.
    pub fn new(connector: C, channel_id: u16) -> Self {
        Self {
            connector,
            channel_id,
            link: None,
        }
    }

    /// Channel id sent in the open frame.
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    fn read_frame(link: &mut C::Link, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut header = [0u8; HEADER_LEN];
        read_first(link, &mut header[..1])?;
        read_rest(link, &mut header[1..])?;

        if header[..2] != FRAME_MAGIC {
            return Err(Error::Protocol(format!(
                "bad frame magic {:02X} {:02X}",
                header[0], header[1]
            )));
        }
        let kind = header[2];
        let len = (&header[4..8]).read_u32::<LittleEndian>()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("frame length {len} exceeds {MAX_FRAME_LEN}")));
        }

        if FrameKind::from_u8(kind) != Some(FrameKind::Data) {
            trace!("Skipping frame kind {kind:#04x} ({len} bytes)");
            drain(link, len)?;
            return Ok(None);
        }
        if len > buf.len() {
            drain(link, len)?;
            return Err(Error::Protocol(format!(
                "datagram of {len} bytes does not fit the {}-byte receive buffer",
                buf.len()
            )));
        }
        read_rest(link, &mut buf[..len])?;
        Ok(Some(len))
    }
}

impl<C: Connector> MopChannel for FramedMopChannel<C> {
    fn connect(&mut self) -> Result<()> {
        self.close()?;
        let mut link = self.connector.connect()?;
        let mut payload = Vec::with_capacity(2);
        payload.write_u16::<LittleEndian>(self.channel_id)?;
        write_frame(&mut link, FrameKind::Open, &payload)?;
        info!(
            "Opened MOP channel {} on {}",
            self.channel_id,
            self.connector.describe()
        );
        self.link = Some(link);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let link = self
            .link
            .as_mut()
            .ok_or(Error::ConnectionClosed)?;
        loop {
            match Self::read_frame(link, buf) {
                Ok(Some(len)) => return Ok(len),
                Ok(None) => {},
                Err(Error::ConnectionClosed) => {
                    // Drop the dead link so is_connected() reflects it.
                    self.link = None;
                    return Err(Error::ConnectionClosed);
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            debug!("Closing MOP channel on {}", link.name());
            link.close()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

impl<C: Connector> RecordControl for FramedMopChannel<C> {
    /// Sends a stop frame on the open link, or on a short-lived one when the
    /// channel is closed.
    fn stop_record(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            return write_frame(link, FrameKind::StopRecord, &[]);
        }
        let mut link = self.connector.connect()?;
        let result = write_frame(&mut link, FrameKind::StopRecord, &[]);
        link.close()?;
        if result.is_ok() {
            info!("Sent stop-record to {}", self.connector.describe());
        }
        result
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// First byte of a frame: a timeout here just means the line is idle.
fn read_first<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) if is_timeout(&e) => return Err(Error::Timeout("no datagram".into())),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Err(Error::ConnectionClosed),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Remainder of a frame: EOF or a stall mid-frame loses sync with the peer.
fn read_rest<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected => {
            Error::ConnectionClosed
        },
        _ if is_timeout(&e) => {
            warn!("Link stalled mid-frame");
            Error::ConnectionClosed
        },
        _ => Error::Io(e),
    })
}

fn drain<R: Read>(reader: &mut R, len: usize) -> Result<()> {
    let copied = io::copy(&mut reader.take(len as u64), &mut io::sink())?;
    if copied < len as u64 {
        return Err(Error::ConnectionClosed);
    }
    Ok(())
}
