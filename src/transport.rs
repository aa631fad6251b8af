//! Connection endpoints, options and the stream abstraction shared by the
//! blocking and event-driven connections.

use crate::error::Error;
use crate::reader::ReaderConfig;
use socket2::{SockRef, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// TCP keepalive probe interval applied when keepalive is enabled.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

/// How to connect. Retained by connections so that a reconnect can redo the
/// original dial with the same settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    /// Applied to the dial and, for blocking connections, as the socket
    /// read/write timeout.
    pub timeout: Option<Duration>,
    /// Enable TCP keepalive probes at [`KEEPALIVE_INTERVAL`].
    pub keepalive: bool,
    pub reader: ReaderConfig,
}

impl ConnectOptions {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Endpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(Endpoint::Unix { path: path.into() })
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: None,
            keepalive: false,
            reader: ReaderConfig::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    pub fn reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader = config;
        self
    }
}

/// A connected TCP or Unix-domain stream.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub(crate) fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    /// Pending asynchronous socket error, consumed on read. Used to learn
    /// the outcome of a nonblocking connect.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            Stream::Unix(s) => s.take_error(),
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Dial the endpoint synchronously, applying the dial timeout and socket
/// options from `options`.
pub(crate) fn open_blocking(options: &ConnectOptions) -> Result<Stream, Error> {
    let stream = match &options.endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = connect_tcp_blocking(host, *port, options.timeout)?;
            stream.set_nodelay(true).map_err(Error::from)?;
            if options.keepalive {
                enable_keepalive(&stream)?;
            }
            Stream::Tcp(stream)
        }
        Endpoint::Unix { path } => Stream::Unix(UnixStream::connect(path).map_err(Error::from)?),
    };
    stream.set_timeouts(options.timeout).map_err(Error::from)?;
    debug!(endpoint = %options.endpoint, "connected");
    Ok(stream)
}

fn connect_tcp_blocking(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream, Error> {
    let addrs = (host, port).to_socket_addrs().map_err(Error::from)?;
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => Error::from(e),
        None => Error::Other(format!("no addresses resolved for {host}:{port}")),
    })
}

fn enable_keepalive(stream: &TcpStream) -> Result<(), Error> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(Error::from)
}

/// Begin a nonblocking dial of the endpoint. The returned stream may still
/// be mid-connect for TCP; completion is signalled by write readiness, at
/// which point [`Stream::take_error`] reports the outcome.
pub(crate) fn connect_start(options: &ConnectOptions) -> Result<Stream, Error> {
    let stream = match &options.endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = connect_tcp_start(host, *port)?;
            stream.set_nodelay(true).map_err(Error::from)?;
            if options.keepalive {
                enable_keepalive(&stream)?;
            }
            Stream::Tcp(stream)
        }
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path).map_err(Error::from)?;
            stream.set_nonblocking(true).map_err(Error::from)?;
            Stream::Unix(stream)
        }
    };
    debug!(endpoint = %options.endpoint, "connect started");
    Ok(stream)
}

fn connect_tcp_start(host: &str, port: u16) -> Result<TcpStream, Error> {
    let addrs = (host, port).to_socket_addrs().map_err(Error::from)?;
    let mut last_err = None;
    for addr in addrs {
        let socket = match socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        ) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            last_err = Some(e);
            continue;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => return Ok(socket.into()),
            Err(e) if in_progress(&e) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => Error::from(e),
        None => Error::Other(format!("no addresses resolved for {host}:{port}")),
    })
}

/// A nonblocking connect that could not finish immediately reports
/// EINPROGRESS, which the standard library surfaces as WouldBlock.
fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let tcp = Endpoint::Tcp {
            host: "cache.example".to_string(),
            port: 6379,
        };
        assert_eq!(tcp.to_string(), "cache.example:6379");

        let unix = Endpoint::Unix {
            path: PathBuf::from("/tmp/cache.sock"),
        };
        assert_eq!(unix.to_string(), "/tmp/cache.sock");
    }

    #[test]
    fn test_options_builder() {
        let options = ConnectOptions::tcp("localhost", 6379)
            .timeout(Duration::from_millis(250))
            .keepalive(true);
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert!(options.keepalive);
        assert_eq!(
            options.endpoint,
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 6379,
            }
        );
    }

    #[test]
    fn test_blocking_dial_over_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = ConnectOptions::tcp("127.0.0.1", port)
            .timeout(Duration::from_secs(1))
            .keepalive(true);
        let stream = open_blocking(&options).unwrap();
        assert!(matches!(stream, Stream::Tcp(_)));
    }

    #[test]
    fn test_connect_refused_is_io_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = ConnectOptions::tcp("127.0.0.1", port).timeout(Duration::from_secs(1));
        match open_blocking(&options) {
            Err(Error::Io { .. }) | Err(Error::Timeout) => {}
            other => panic!("expected connect failure, got {other:?}"),
        }
    }
}
