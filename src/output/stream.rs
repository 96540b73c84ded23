//! Downstream endpoints
//!
//! Endpoints are named by descriptors:
//!
//! - `tcp:host:port` connects to a TCP listener
//! - `file:path` creates (or truncates) a file
//! - `null:` discards everything
//!
//! A [`Connector`] opens the stream lazily on the output thread, so that a
//! slow or unreachable receiver never blocks the producers.

use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parsed endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDescriptor {
    /// TCP connection to `host:port`
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
    /// Local file
    File(PathBuf),
    /// Discard all output
    Null,
}

impl FromStr for StreamDescriptor {
    type Err = PipelineError;

    fn from_str(descriptor: &str) -> Result<Self> {
        let invalid = |reason: &str| PipelineError::InvalidDescriptor(format!("{}: {}", descriptor, reason));

        let (scheme, rest) = descriptor
            .split_once(':')
            .ok_or_else(|| invalid("missing scheme"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("expected tcp:host:port"))?;
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                Ok(StreamDescriptor::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "file" => {
                if rest.is_empty() {
                    return Err(invalid("empty path"));
                }
                Ok(StreamDescriptor::File(PathBuf::from(rest)))
            }
            "null" => Ok(StreamDescriptor::Null),
            _ => Err(invalid("unknown scheme")),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDescriptor::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            StreamDescriptor::File(path) => write!(f, "file:{}", path.display()),
            StreamDescriptor::Null => write!(f, "null:"),
        }
    }
}

/// An open downstream stream
pub type OutputStream = Box<dyn Write + Send>;

/// Opens the stream for an output thread
pub trait Connector: Send + Sync {
    /// Open the stream, blocking until connected or failed
    fn connect(&self) -> io::Result<OutputStream>;

    /// Unblock a pending connect or write from another thread
    fn interrupt(&self) {}

    /// Human-readable endpoint name for log output
    fn description(&self) -> String;
}

/// Overall connect timeout of a [`TcpConnector`] unless configured otherwise
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest single connect attempt; an interrupt is noticed between attempts
const CONNECT_ATTEMPT: Duration = Duration::from_millis(200);

/// TCP client connector
///
/// Connects in short attempts until the connect timeout expires, so that
/// [`Connector::interrupt`] cancels a connect to an unresponsive host
/// promptly. Once interrupted the connector refuses to connect again.
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    interrupted: AtomicBool,
    active: Arc<Mutex<Option<TcpStream>>>,
}

impl TcpConnector {
    /// Connector for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            interrupted: AtomicBool::new(false),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Give up connecting after `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn interrupted_error() -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, "connect interrupted")
    }

    fn open(&self) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.host),
            ));
        }

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let mut last_error = None;
            let mut timed_out = false;

            for addr in &addrs {
                if self.interrupted.load(Ordering::SeqCst) {
                    return Err(Self::interrupted_error());
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection to {}:{} within {:?}", self.host, self.port, self.connect_timeout),
                    ));
                }

                match TcpStream::connect_timeout(addr, remaining.min(CONNECT_ATTEMPT)) {
                    Ok(stream) => return Ok(stream),
                    Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                        timed_out = true;
                    }
                    Err(err) => last_error = Some(err),
                }
            }

            // every address answered with a hard error
            if !timed_out {
                return Err(last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "no address accepted the connection")
                }));
            }
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> io::Result<OutputStream> {
        let stream = self.open()?;
        stream.set_nodelay(true)?;
        *self.active.lock() = Some(stream.try_clone()?);

        // an interrupt may have raced with the connect
        if self.interrupted.load(Ordering::SeqCst) {
            self.active.lock().take();
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Self::interrupted_error());
        }

        Ok(Box::new(TcpOutput {
            stream,
            active: self.active.clone(),
        }))
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(stream) = self.active.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn description(&self) -> String {
        format!("tcp:{}:{}", self.host, self.port)
    }
}

/// Connected TCP stream; closing it also releases the connector's handle,
/// so the receiver sees the end of the stream
struct TcpOutput {
    stream: TcpStream,
    active: Arc<Mutex<Option<TcpStream>>>,
}

impl Write for TcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for TcpOutput {
    fn drop(&mut self) {
        self.active.lock().take();
    }
}

/// Local file connector
pub struct FileConnector {
    path: PathBuf,
}

impl FileConnector {
    /// Connector creating the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for FileConnector {
    fn connect(&self) -> io::Result<OutputStream> {
        Ok(Box::new(File::create(&self.path)?))
    }

    fn description(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Connector whose stream discards everything
pub struct NullConnector;

impl Connector for NullConnector {
    fn connect(&self) -> io::Result<OutputStream> {
        Ok(Box::new(io::sink()))
    }

    fn description(&self) -> String {
        "null:".to_string()
    }
}

/// Build the connector for a parsed descriptor
pub fn connector_for(descriptor: &StreamDescriptor) -> Box<dyn Connector> {
    match descriptor {
        StreamDescriptor::Tcp { host, port } => Box::new(TcpConnector::new(host.clone(), *port)),
        StreamDescriptor::File(path) => Box::new(FileConnector::new(path.clone())),
        StreamDescriptor::Null => Box::new(NullConnector),
    }
}

/// Parse `descriptor` and build its connector
pub fn connector_from_descriptor(descriptor: &str) -> Result<Box<dyn Connector>> {
    Ok(connector_for(&descriptor.parse()?))
}
