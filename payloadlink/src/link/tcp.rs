//! TCP links.

use super::{Connector, Link};
use crate::error::{Error, Result};
use log::{debug, trace};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// TCP endpoint configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// `host:port` to connect to.
    pub addr: String,
    /// Connect timeout per resolved address.
    pub connect_timeout: Duration,
    /// Read timeout on the open socket.
    pub read_timeout: Duration,
}

impl TcpConfig {
    /// Configuration with default timeouts (3 s connect, 500 ms read).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_millis(500),
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// An open TCP connection.
pub struct TcpLink {
    stream: Option<TcpStream>,
    name: String,
}

impl TcpLink {
    /// Connect to the first reachable resolved address.
    pub fn connect(config: &TcpConfig) -> Result<Self> {
        let addrs: Vec<_> = config.addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "{} did not resolve to any address",
                config.addr
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            trace!("Connecting to {addr}");
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(config.read_timeout))?;
                    debug!("Connected to {addr}");
                    return Ok(Self::from_stream(stream, config.addr.clone()));
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map_or_else(|| Error::ConnectionClosed, Error::Io))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, name: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            name: name.into(),
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link closed"))
    }
}

impl Link for TcpLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

/// Opens a [`TcpLink`] per connect attempt.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    /// Connector for the given endpoint.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    type Link = TcpLink;

    fn connect(&mut self) -> Result<TcpLink> {
        TcpLink::connect(&self.config)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.config.addr)
    }
}
