//! Byte links between the companion computer and a payload.
//!
//! A [`Link`] is a bidirectional byte stream (a serial UART or a TCP socket).
//! A [`Connector`] knows how to open a fresh link, so channel code can
//! reconnect after the remote end drops without knowing the transport.
//!
//! ```text
//! +------------------+
//! | FramedMopChannel |
//! +--------+---------+
//!          |  Connector::connect()
//!          v
//! +--------+---------+     +------------------+
//! |   SerialLink     |     |     TcpLink      |
//! |   (serialport)   |     |  (std::net)      |
//! +------------------+     +------------------+
//! ```

#[cfg(feature = "native")]
mod native;
mod tcp;

#[cfg(feature = "native")]
pub use native::{SerialConnector, SerialLink};
pub use tcp::{TcpConfig, TcpConnector, TcpLink};

use crate::error::Result;
use std::io::{Read, Write};
use std::time::Duration;

/// Default baud rate of a payload UART.
pub const DEFAULT_BAUD: u32 = 921_600;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(500),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set flow control.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// RTS/CTS.
    Hardware,
    /// XON/XOFF.
    Software,
}

/// An open byte link.
pub trait Link: Read + Write + Send {
    /// Human-readable endpoint name.
    fn name(&self) -> &str;

    /// Set the read timeout. A read that times out returns
    /// `io::ErrorKind::TimedOut` or `WouldBlock`.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Close the link. Further I/O fails with `NotConnected`.
    fn close(&mut self) -> Result<()>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Opens links on demand.
pub trait Connector: Send {
    /// Link type produced.
    type Link: Link;

    /// Open a fresh link.
    fn connect(&mut self) -> Result<Self::Link>;

    /// Endpoint description for log messages.
    fn describe(&self) -> String;
}

/// USB-to-UART bridge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303.
    Pl2303,
    /// Anything else.
    Unknown,
}

const KNOWN_BRIDGES: &[(u16, &[u16], PortKind)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4], PortKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], PortKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], PortKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], PortKind::Pl2303),
];

impl PortKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(v, pids, _)| *v == vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Pl2303 => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port found on the system.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path.
    pub name: String,
    /// Bridge classification.
    pub kind: PortKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// Serial number.
    pub serial: Option<String>,
}

/// List serial ports, recognised USB bridges first.
#[cfg(feature = "native")]
pub fn list_serial_ports() -> Vec<DetectedPort> {
    let mut ports: Vec<DetectedPort> = match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let mut port = DetectedPort {
                    name: info.port_name,
                    kind: PortKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };
                if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                    port.kind = PortKind::from_vid_pid(usb.vid, usb.pid);
                    log::trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, {})",
                        port.name,
                        usb.vid,
                        usb.pid,
                        port.kind.name()
                    );
                    port.vid = Some(usb.vid);
                    port.pid = Some(usb.pid);
                    port.manufacturer = usb.manufacturer;
                    port.product = usb.product;
                    port.serial = usb.serial_number;
                }
                port
            })
            .collect(),
        Err(e) => {
            log::debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    };
    sort_ports(&mut ports);
    ports
}

/// List serial ports. Always empty without the `native` feature.
#[cfg(not(feature = "native"))]
pub fn list_serial_ports() -> Vec<DetectedPort> {
    Vec::new()
}

fn sort_ports(ports: &mut [DetectedPort]) {
    ports.sort_by(|a, b| {
        b.kind
            .is_known()
            .cmp(&a.kind.is_known())
            .then_with(|| a.name.cmp(&b.name))
    });
}
