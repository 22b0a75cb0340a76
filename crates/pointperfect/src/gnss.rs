//! Byte-stream link to the GNSS receiver.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

/// Receiver endpoint used when nothing else is configured.
pub const DEFAULT_GNSS_ENDPOINT: &str = "tcp://127.0.0.1:2101";

/// Environment override for the receiver endpoint.
pub const GNSS_ENDPOINT_ENV: &str = "GNSS_ENDPOINT";

/// u-blox UART default.
pub const DEFAULT_BAUD_RATE: u32 = 38_400;

/// Where the receiver can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GnssEndpoint {
    /// `tcp://host:port`, e.g. a serial-to-network bridge
    Tcp(String),
    /// Serial port, `path` or `path@baudrate`
    Device { path: PathBuf, baud_rate: u32 },
}

impl GnssEndpoint {
    pub fn device(path: impl Into<PathBuf>) -> Self {
        GnssEndpoint::Device {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl FromStr for GnssEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("GNSS endpoint must not be empty".to_string());
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.rsplit_once(':').map_or(true, |(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(format!("Invalid GNSS endpoint '{}'. Expected 'tcp://host:port'", s));
            }
            return Ok(GnssEndpoint::Tcp(addr.to_string()));
        }
        if s.contains("://") {
            return Err(format!("Unsupported GNSS endpoint scheme in '{}'", s));
        }

        match s.rsplit_once('@') {
            Some((path, baud)) => {
                let baud_rate = baud
                    .parse::<u32>()
                    .ok()
                    .filter(|&rate| rate > 0)
                    .ok_or_else(|| format!("Invalid baud rate '{}' in '{}'", baud, s))?;
                if path.is_empty() {
                    return Err(format!("Missing serial port in '{}'", s));
                }
                Ok(GnssEndpoint::Device {
                    path: PathBuf::from(path),
                    baud_rate,
                })
            }
            None => Ok(GnssEndpoint::device(s)),
        }
    }
}

impl fmt::Display for GnssEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GnssEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            GnssEndpoint::Device { path, baud_rate } => {
                write!(f, "{}@{}", path.display(), baud_rate)
            }
        }
    }
}

/// Connected receiver: raw output in, correction data out.
pub struct GnssLink {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl GnssLink {
    /// Open the endpoint. Serial ports are put in raw mode (no CR/NL
    /// translation, no echo) so NMEA terminators and binary data pass through.
    pub async fn connect(endpoint: &GnssEndpoint) -> std::io::Result<Self> {
        match endpoint {
            GnssEndpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Self::from_stream(stream))
            }
            GnssEndpoint::Device { path, baud_rate } => {
                let port = tokio_serial::new(path.to_string_lossy(), *baud_rate)
                    .open_native_async()
                    .map_err(std::io::Error::from)?;
                Ok(Self::from_stream(port))
            }
        }
    }

    /// Wrap any bidirectional stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}
