//! Blocking request/reply connection.
//!
//! Commands are appended to an output buffer and flushed lazily: a call to
//! [`Connection::get_reply`] first drains any buffered replies, then writes
//! the pending output and blocks reading until a full reply arrives. This
//! lets callers pipeline by appending several commands before collecting
//! their replies in order.

use crate::error::Error;
use crate::reader::Reader;
use crate::reply::Reply;
use crate::transport::{open_blocking, ConnectOptions, Stream};
use bytes::BytesMut;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

/// A blocking connection to a RESP server.
///
/// I/O and protocol failures are sticky: once a call fails, the connection
/// is unusable until [`reconnect`](Connection::reconnect).
pub struct Connection {
    stream: Stream,
    reader: Reader,
    obuf: BytesMut,
    /// Present when we dialed ourselves; a caller-supplied stream cannot be
    /// reconnected.
    options: Option<ConnectOptions>,
    err: Option<Error>,
}

impl Connection {
    /// Dial the endpoint described by `options` and wrap it.
    pub fn connect(options: ConnectOptions) -> Result<Self, Error> {
        let stream = open_blocking(&options)?;
        Ok(Self {
            stream,
            reader: Reader::with_config(options.reader, crate::reply::ReplyTreeBuilder),
            obuf: BytesMut::new(),
            options: Some(options),
            err: None,
        })
    }

    /// Shorthand for a TCP dial with default options.
    pub fn connect_tcp(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        Self::connect(ConnectOptions::tcp(host, port))
    }

    /// Shorthand for a Unix-domain dial with default options.
    pub fn connect_unix(path: impl Into<std::path::PathBuf>) -> Result<Self, Error> {
        Self::connect(ConnectOptions::unix(path))
    }

    /// Wrap an already-connected TCP stream. The connection cannot be
    /// reconnected.
    pub fn from_tcp_stream(stream: TcpStream) -> Self {
        Self::from_stream(Stream::Tcp(stream))
    }

    /// Wrap an already-connected Unix-domain stream. The connection cannot
    /// be reconnected.
    pub fn from_unix_stream(stream: UnixStream) -> Self {
        Self::from_stream(Stream::Unix(stream))
    }

    fn from_stream(stream: Stream) -> Self {
        Self {
            stream,
            reader: Reader::new(),
            obuf: BytesMut::new(),
            options: None,
            err: None,
        }
    }

    /// The sticky error, if the connection has failed.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Queue an already-encoded command for the next flush.
    pub fn append_command(&mut self, command: &[u8]) -> Result<(), Error> {
        self.check()?;
        self.obuf.extend_from_slice(command);
        Ok(())
    }

    /// Write all buffered output to the socket.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.check()?;
        while !self.obuf.is_empty() {
            match self.stream.write(&self.obuf) {
                Ok(0) => {
                    return Err(self.fail(Error::from(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    ))))
                }
                Ok(n) => {
                    let _ = self.obuf.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(Error::from(e))),
            }
        }
        Ok(())
    }

    /// Flush pending output, then block until one reply is available.
    pub fn get_reply(&mut self) -> Result<Reply, Error> {
        self.check()?;
        // Replies already buffered from an earlier read come first.
        if let Some(reply) = self.try_parse()? {
            return Ok(reply);
        }
        self.flush()?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.fail(Error::Eof)),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(Error::from(e))),
            };
            match self.reader.feed(&chunk[..n]) {
                Ok(()) => {}
                Err(e) => return Err(self.fail(e)),
            }
            if let Some(reply) = self.try_parse()? {
                return Ok(reply);
            }
        }
    }

    /// Parse a reply from bytes already buffered, without touching the
    /// socket. Never blocks.
    pub fn try_get_reply(&mut self) -> Result<Option<Reply>, Error> {
        self.check()?;
        self.try_parse()
    }

    /// Tear down the socket and dial again with the original options. Any
    /// buffered input, pending output and sticky error are discarded.
    pub fn reconnect(&mut self) -> Result<(), Error> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| Error::Other("cannot reconnect a caller-supplied stream".to_string()))?;
        debug!(endpoint = %options.endpoint, "reconnecting");
        self.stream.shutdown();
        self.stream = open_blocking(&options)?;
        self.reader.reset();
        self.obuf.clear();
        self.err = None;
        Ok(())
    }

    /// Change the socket read/write timeout on the live connection.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.check()?;
        self.stream.set_timeouts(timeout).map_err(Error::from)?;
        if let Some(options) = &mut self.options {
            options.timeout = timeout;
        }
        Ok(())
    }

    fn try_parse(&mut self) -> Result<Option<Reply>, Error> {
        match self.reader.get_reply() {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn check(&self) -> Result<(), Error> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.err = Some(e.clone());
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one accepted connection: read at least `expect_bytes` bytes of
    /// request data, then write `replies` and keep the socket open until the
    /// peer goes away.
    fn serve_once(replies: &'static [u8], expect_bytes: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut seen = 0;
            while seen < expect_bytes {
                match sock.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => seen += n,
                    Err(_) => return,
                }
            }
            sock.write_all(replies).unwrap();
            // Hold the socket open until the client closes.
            let _ = sock.read(&mut buf);
        });
        port
    }

    #[test]
    fn test_round_trip() {
        let port = serve_once(b"+PONG\r\n", 1);
        let mut conn = Connection::connect_tcp("127.0.0.1", port).unwrap();
        conn.append_command(b"PING\r\n").unwrap();
        let reply = conn.get_reply().unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"PONG"[..]));
    }

    #[test]
    fn test_pipelined_replies_in_order() {
        let port = serve_once(b"+one\r\n:2\r\n$5\r\nthree\r\n", 1);
        let mut conn = Connection::connect_tcp("127.0.0.1", port).unwrap();
        conn.append_command(b"A\r\nB\r\nC\r\n").unwrap();
        assert_eq!(conn.get_reply().unwrap().as_bytes(), Some(&b"one"[..]));
        assert_eq!(conn.get_reply().unwrap().as_integer(), Some(2));
        assert_eq!(conn.get_reply().unwrap().as_bytes(), Some(&b"three"[..]));
    }

    #[test]
    fn test_try_get_reply_never_blocks() {
        let port = serve_once(b"+later\r\n", 1);
        let mut conn = Connection::connect_tcp("127.0.0.1", port).unwrap();
        // Nothing buffered and nothing sent: no reply, no blocking.
        assert_eq!(conn.try_get_reply().unwrap(), None);
        conn.append_command(b"GO\r\n").unwrap();
        assert_eq!(conn.get_reply().unwrap().as_bytes(), Some(&b"later"[..]));
    }

    #[test]
    fn test_eof_is_sticky() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
        });
        let mut conn = Connection::connect_tcp("127.0.0.1", port).unwrap();
        conn.append_command(b"PING\r\n").unwrap();
        // The write may or may not fail depending on timing; the read must
        // surface a connection error either way.
        let err = conn.get_reply().unwrap_err();
        assert!(matches!(err, Error::Eof | Error::Io { .. }));
        assert!(conn.error().is_some());
        // Every later call fails with the stored error.
        assert!(conn.append_command(b"PING\r\n").is_err());
        assert!(conn.get_reply().is_err());
    }

    #[test]
    fn test_reconnect_clears_state() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            // First accept: close immediately. Second accept: behave.
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(b"+OK\r\n").unwrap();
            let _ = sock.read(&mut buf);
        });

        let mut conn = Connection::connect_tcp("127.0.0.1", port).unwrap();
        conn.append_command(b"PING\r\n").unwrap();
        assert!(conn.get_reply().is_err());

        conn.reconnect().unwrap();
        assert!(conn.error().is_none());
        conn.append_command(b"PING\r\n").unwrap();
        assert_eq!(conn.get_reply().unwrap().as_bytes(), Some(&b"OK"[..]));
    }

    #[test]
    fn test_caller_supplied_stream_cannot_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _guard = thread::spawn(move || listener.accept());
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mut conn = Connection::from_tcp_stream(stream);
        assert!(matches!(conn.reconnect(), Err(Error::Other(_))));
    }

    #[test]
    fn test_read_timeout_maps_to_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Never reply; just keep the socket open for a while.
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf);
            thread::sleep(Duration::from_millis(500));
        });
        let options =
            ConnectOptions::tcp("127.0.0.1", port).timeout(Duration::from_millis(50));
        let mut conn = Connection::connect(options).unwrap();
        conn.append_command(b"PING\r\n").unwrap();
        assert_eq!(conn.get_reply().unwrap_err(), Error::Timeout);
    }
}
