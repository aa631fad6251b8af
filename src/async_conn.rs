//! Event-loop-driven connection with reply correlation.
//!
//! The connection owns no event loop. It registers interest through an
//! [`EventHooks`] implementation, and the owning loop calls
//! [`on_read_ready`], [`on_write_ready`] and [`on_timeout`] when the socket
//! or timer fires. Replies are correlated to submitted commands in FIFO
//! order, except for subscription traffic, which is routed by channel or
//! pattern name to the callback registered at subscribe time.
//!
//! Callbacks receive `&mut AsyncConnection` and may submit further commands
//! or tear the connection down from inside the callback. Teardown requested
//! mid-callback is deferred until the callback returns.
//!
//! [`on_read_ready`]: AsyncConnection::on_read_ready
//! [`on_write_ready`]: AsyncConnection::on_write_ready
//! [`on_timeout`]: AsyncConnection::on_timeout

use crate::error::Error;
use crate::event::EventHooks;
use crate::reader::{Reader, ReaderConfig};
use crate::reply::{Reply, ReplyTreeBuilder};
use crate::transport::{connect_start, ConnectOptions, Stream};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Per-reply callback. Shared so that one subscribe callback can serve
/// several channels and still sit in the confirmation queue.
pub type ReplyCallback<H> =
    Rc<RefCell<dyn FnMut(&mut AsyncConnection<H>, Result<Reply, Error>)>>;

type ConnectCallback<H> = Box<dyn FnOnce(&mut AsyncConnection<H>, Result<(), Error>)>;
type DisconnectCallback<H> = Box<dyn FnOnce(&mut AsyncConnection<H>, Result<(), Error>)>;

/// Wrap a closure as a [`ReplyCallback`].
pub fn reply_callback<H, F>(f: F) -> ReplyCallback<H>
where
    H: EventHooks,
    F: FnMut(&mut AsyncConnection<H>, Result<Reply, Error>) + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nonblocking dial in flight; completion arrives as write readiness.
    Connecting,
    Connected,
    /// Shutting down gracefully; existing commands still drain.
    Disconnecting,
    Disconnected,
}

/// One command awaiting its reply.
///
/// `remaining` is 1 for ordinary commands and N for a subscribe or
/// unsubscribe covering N names, whose confirmations arrive one per name.
struct PendingReply<H: EventHooks> {
    callback: Option<ReplyCallback<H>>,
    remaining: usize,
}

/// Where an incoming reply should be delivered.
enum Route {
    Channel(Bytes),
    Pattern(Bytes),
    Confirm {
        pattern: bool,
        unsubscribe: bool,
        name: Option<Bytes>,
    },
    Fifo,
}

/// An event-loop-driven RESP connection.
pub struct AsyncConnection<H: EventHooks> {
    stream: Stream,
    reader: Reader,
    obuf: BytesMut,
    hooks: H,
    timeout: Option<Duration>,
    state: ConnState,
    /// True while control is inside a user callback.
    in_callback: bool,
    /// A free was requested from inside a callback; honor it on return.
    free_pending: bool,
    /// Re-entrancy guard for teardown.
    freeing: bool,
    /// Gates the disconnect callback: a dial that never completed fires the
    /// connect callback with the failure instead.
    was_connected: bool,
    subscribed: bool,
    pending: VecDeque<PendingReply<H>>,
    channels: HashMap<Bytes, ReplyCallback<H>>,
    patterns: HashMap<Bytes, ReplyCallback<H>>,
    on_connect: Option<ConnectCallback<H>>,
    on_disconnect: Option<DisconnectCallback<H>>,
    err: Option<Error>,
}

impl<H: EventHooks> AsyncConnection<H> {
    /// Begin a nonblocking dial. `make_hooks` receives the socket's file
    /// descriptor so the adapter can register it with the event loop; the
    /// connection immediately requests write interest to learn the dial's
    /// outcome.
    pub fn connect<F>(options: ConnectOptions, make_hooks: F) -> Result<Self, Error>
    where
        F: FnOnce(RawFd) -> io::Result<H>,
    {
        let stream = connect_start(&options)?;
        let hooks = make_hooks(stream.as_raw_fd()).map_err(Error::from)?;
        let mut conn = Self::from_parts(
            stream,
            hooks,
            options.reader,
            options.timeout,
            ConnState::Connecting,
        );
        conn.hooks.add_write();
        conn.refresh_timeout();
        Ok(conn)
    }

    /// Wrap an already-connected TCP stream.
    pub fn from_tcp_stream(stream: TcpStream, hooks: H) -> Result<Self, Error> {
        stream.set_nonblocking(true).map_err(Error::from)?;
        Ok(Self::adopt(Stream::Tcp(stream), hooks))
    }

    /// Wrap an already-connected Unix-domain stream.
    pub fn from_unix_stream(stream: UnixStream, hooks: H) -> Result<Self, Error> {
        stream.set_nonblocking(true).map_err(Error::from)?;
        Ok(Self::adopt(Stream::Unix(stream), hooks))
    }

    fn adopt(stream: Stream, hooks: H) -> Self {
        let mut conn = Self::from_parts(
            stream,
            hooks,
            ReaderConfig::default(),
            None,
            ConnState::Connected,
        );
        conn.was_connected = true;
        conn.hooks.add_read();
        conn
    }

    fn from_parts(
        stream: Stream,
        hooks: H,
        reader: ReaderConfig,
        timeout: Option<Duration>,
        state: ConnState,
    ) -> Self {
        Self {
            stream,
            reader: Reader::with_config(reader, ReplyTreeBuilder),
            obuf: BytesMut::new(),
            hooks,
            timeout,
            state,
            in_callback: false,
            free_pending: false,
            freeing: false,
            was_connected: false,
            subscribed: false,
            pending: VecDeque::new(),
            channels: HashMap::new(),
            patterns: HashMap::new(),
            on_connect: None,
            on_disconnect: None,
            err: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// The adapter behind this connection.
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Invoked once when the dial completes or fails.
    pub fn set_connect_callback<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self, Result<(), Error>) + 'static,
    {
        self.on_connect = Some(Box::new(f));
    }

    /// Invoked once when an established connection goes away. `Ok(())` for
    /// a requested disconnect, `Err` for a failure.
    pub fn set_disconnect_callback<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self, Result<(), Error>) + 'static,
    {
        self.on_disconnect = Some(Box::new(f));
    }

    /// Command timeout armed on every submit.
    pub fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Queue an already-encoded command. The reply (or the connection's
    /// failure) is delivered to `callback`; with no callback the reply is
    /// discarded.
    ///
    /// SUBSCRIBE-family commands are recognized by inspecting the encoded
    /// command: their callbacks are additionally registered under each
    /// channel or pattern name so later published messages reach them.
    pub fn submit(
        &mut self,
        command: &[u8],
        callback: Option<ReplyCallback<H>>,
    ) -> Result<(), Error> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if !matches!(self.state, ConnState::Connecting | ConnState::Connected) {
            return Err(Error::Other("connection is shutting down".to_string()));
        }

        let mut remaining = 1;
        if let Some(args) = command_args(command) {
            if let Some(verb) = args.first() {
                if verb.eq_ignore_ascii_case(b"subscribe")
                    || verb.eq_ignore_ascii_case(b"psubscribe")
                {
                    let pattern = verb.eq_ignore_ascii_case(b"psubscribe");
                    let names = &args[1..];
                    if !names.is_empty() {
                        remaining = names.len();
                        if let Some(cb) = &callback {
                            for name in names {
                                let key = Bytes::copy_from_slice(name);
                                if pattern {
                                    self.patterns.insert(key, Rc::clone(cb));
                                } else {
                                    self.channels.insert(key, Rc::clone(cb));
                                }
                            }
                        }
                        self.subscribed = true;
                    }
                } else if verb.eq_ignore_ascii_case(b"unsubscribe")
                    || verb.eq_ignore_ascii_case(b"punsubscribe")
                {
                    let pattern = verb.eq_ignore_ascii_case(b"punsubscribe");
                    let names = &args[1..];
                    // A bare unsubscribe retires every current registration,
                    // one confirmation each. The server still confirms once
                    // when nothing was subscribed.
                    remaining = if names.is_empty() {
                        let n = if pattern {
                            self.patterns.len()
                        } else {
                            self.channels.len()
                        };
                        n.max(1)
                    } else {
                        names.len()
                    };
                }
            }
        }

        self.pending.push_back(PendingReply { callback, remaining });
        self.obuf.extend_from_slice(command);
        self.hooks.add_write();
        self.refresh_timeout();
        Ok(())
    }

    /// Stop accepting commands and tear down once every queued command has
    /// been written and answered.
    pub fn disconnect(&mut self) {
        if matches!(self.state, ConnState::Disconnected) {
            return;
        }
        self.state = ConnState::Disconnecting;
        self.maybe_finish_disconnect();
    }

    /// Tear down immediately. Pending callbacks are each invoked once with
    /// an error. Safe to call from inside a callback; the teardown then
    /// happens when the callback returns.
    pub fn free(&mut self) {
        if self.in_callback {
            self.free_pending = true;
            return;
        }
        self.teardown(None);
    }

    /// The event loop observed write readiness on the socket.
    pub fn on_write_ready(&mut self) {
        if matches!(self.state, ConnState::Connecting) {
            match self.stream.take_error() {
                Ok(None) => {
                    self.state = ConnState::Connected;
                    self.was_connected = true;
                    self.hooks.add_read();
                    // Commands may have been queued while connecting; their
                    // deadline starts now that replies can arrive.
                    self.refresh_timeout();
                    self.fire_connect(Ok(()));
                    if matches!(self.state, ConnState::Disconnected) {
                        return;
                    }
                }
                Ok(Some(e)) | Err(e) => {
                    let err = Error::from(e);
                    debug!(error = %err, "connect failed");
                    self.err = Some(err.clone());
                    self.fire_connect(Err(err.clone()));
                    self.teardown(Some(err));
                    return;
                }
            }
        }
        self.flush_obuf();
    }

    /// The event loop observed read readiness on the socket.
    pub fn on_read_ready(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.handle_fatal(Error::Eof);
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    if let Err(e) = self.reader.feed(&chunk[..n]) {
                        self.handle_fatal(e);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.handle_fatal(Error::from(e));
                    return;
                }
            }
        }
        self.process_replies();
    }

    /// The command timeout elapsed before the socket produced replies.
    ///
    /// A fire with nothing outstanding is stale (the reply the timer was
    /// armed for already arrived); it disarms the timer and leaves the
    /// connection alone.
    pub fn on_timeout(&mut self) {
        if matches!(self.state, ConnState::Connected)
            && self.pending.is_empty()
            && self.obuf.is_empty()
        {
            self.hooks.cancel_timer();
            return;
        }
        self.handle_fatal(Error::Timeout);
    }

    fn flush_obuf(&mut self) {
        while !self.obuf.is_empty() {
            match self.stream.write(&self.obuf) {
                Ok(0) => {
                    self.handle_fatal(Error::from(io::Error::from(io::ErrorKind::WriteZero)));
                    return;
                }
                Ok(n) => {
                    let _ = self.obuf.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.handle_fatal(Error::from(e));
                    return;
                }
            }
        }
        self.hooks.del_write();
        self.maybe_finish_disconnect();
    }

    fn process_replies(&mut self) {
        loop {
            if matches!(self.state, ConnState::Disconnected) {
                return;
            }
            let reply = match self.reader.get_reply() {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    self.handle_fatal(e);
                    return;
                }
            };
            self.dispatch(reply);
        }
        self.maybe_finish_disconnect();
    }

    fn dispatch(&mut self, reply: Reply) {
        match self.routing_for(&reply) {
            Route::Channel(name) => {
                let cb = self.channels.get(&name).cloned();
                match cb {
                    Some(cb) => self.invoke(&cb, Ok(reply)),
                    None => warn!(channel = ?name, "dropping message for unknown channel"),
                }
            }
            Route::Pattern(name) => {
                let cb = self.patterns.get(&name).cloned();
                match cb {
                    Some(cb) => self.invoke(&cb, Ok(reply)),
                    None => warn!(pattern = ?name, "dropping message for unknown pattern"),
                }
            }
            Route::Confirm {
                pattern,
                unsubscribe,
                name,
            } => {
                if unsubscribe {
                    if let Some(name) = &name {
                        if pattern {
                            self.patterns.remove(name);
                        } else {
                            self.channels.remove(name);
                        }
                    }
                    if self.channels.is_empty() && self.patterns.is_empty() {
                        self.subscribed = false;
                    }
                }
                self.deliver_fifo(reply);
            }
            Route::Fifo => self.deliver_fifo(reply),
        }
    }

    /// Deliver a reply to the command at the head of the queue, retiring
    /// the entry once its last confirmation arrives.
    fn deliver_fifo(&mut self, reply: Reply) {
        let retire = match self.pending.front_mut() {
            Some(front) => {
                front.remaining = front.remaining.saturating_sub(1);
                front.remaining == 0
            }
            None => {
                self.handle_fatal(Error::Protocol(
                    "reply without a pending command".to_string(),
                ));
                return;
            }
        };
        if retire {
            if let Some(mut entry) = self.pending.pop_front() {
                if let Some(cb) = entry.callback.take() {
                    self.invoke(&cb, Ok(reply));
                }
            }
        } else {
            let cb = self.pending.front().and_then(|e| e.callback.clone());
            if let Some(cb) = cb {
                self.invoke(&cb, Ok(reply));
            }
        }
    }

    /// Decide delivery for one reply. Push frames always carry subscription
    /// traffic; plain arrays do only while subscribed (RESP2 servers
    /// deliver subscription traffic as arrays).
    fn routing_for(&self, reply: &Reply) -> Route {
        let items = match reply {
            Reply::Push(items) => items,
            Reply::Array(items) if self.subscribed => items,
            _ => return Route::Fifo,
        };
        let verb = match items.first().and_then(payload_bytes) {
            Some(v) => v,
            None => return Route::Fifo,
        };
        let name = items.get(1).and_then(payload_bytes);
        if verb.eq_ignore_ascii_case(b"message") && items.len() == 3 {
            match name {
                Some(name) => Route::Channel(name),
                None => Route::Fifo,
            }
        } else if verb.eq_ignore_ascii_case(b"pmessage") && items.len() == 4 {
            match name {
                Some(name) => Route::Pattern(name),
                None => Route::Fifo,
            }
        } else if verb.eq_ignore_ascii_case(b"subscribe") {
            Route::Confirm {
                pattern: false,
                unsubscribe: false,
                name,
            }
        } else if verb.eq_ignore_ascii_case(b"unsubscribe") {
            Route::Confirm {
                pattern: false,
                unsubscribe: true,
                name,
            }
        } else if verb.eq_ignore_ascii_case(b"psubscribe") {
            Route::Confirm {
                pattern: true,
                unsubscribe: false,
                name,
            }
        } else if verb.eq_ignore_ascii_case(b"punsubscribe") {
            Route::Confirm {
                pattern: true,
                unsubscribe: true,
                name,
            }
        } else {
            Route::Fifo
        }
    }

    fn invoke(&mut self, cb: &ReplyCallback<H>, result: Result<Reply, Error>) {
        let prev = self.in_callback;
        self.in_callback = true;
        (cb.borrow_mut())(self, result);
        self.in_callback = prev;
        self.check_deferred_free();
    }

    fn fire_connect(&mut self, result: Result<(), Error>) {
        if let Some(cb) = self.on_connect.take() {
            let prev = self.in_callback;
            self.in_callback = true;
            cb(self, result);
            self.in_callback = prev;
            self.check_deferred_free();
        }
    }

    fn check_deferred_free(&mut self) {
        if self.free_pending && !self.in_callback {
            self.free_pending = false;
            self.teardown(None);
        }
    }

    fn handle_fatal(&mut self, e: Error) {
        debug!(error = %e, "connection failed");
        self.err = Some(e.clone());
        self.teardown(Some(e));
    }

    fn maybe_finish_disconnect(&mut self) {
        if matches!(self.state, ConnState::Disconnecting)
            && self.obuf.is_empty()
            && self.pending.is_empty()
        {
            self.teardown(None);
        }
    }

    /// Tear everything down. Every pending callback is invoked exactly
    /// once, in submit order, with the failure (or a generic error for a
    /// requested free). Subscription callbacks are dropped without being
    /// invoked. The disconnect callback fires last, and only if the
    /// connection had actually been established.
    fn teardown(&mut self, error: Option<Error>) {
        if self.freeing || matches!(self.state, ConnState::Disconnected) {
            return;
        }
        self.freeing = true;
        self.state = ConnState::Disconnecting;

        let pending_err = error
            .clone()
            .unwrap_or_else(|| Error::Other("connection is being freed".to_string()));
        while let Some(mut entry) = self.pending.pop_front() {
            if let Some(cb) = entry.callback.take() {
                self.invoke(&cb, Err(pending_err.clone()));
            }
        }
        self.channels.clear();
        self.patterns.clear();
        self.subscribed = false;
        self.obuf.clear();

        self.hooks.del_read();
        self.hooks.del_write();
        self.state = ConnState::Disconnected;

        if self.was_connected {
            if let Some(cb) = self.on_disconnect.take() {
                let status = match &error {
                    None => Ok(()),
                    Some(e) => Err(e.clone()),
                };
                cb(self, status);
            }
        }
        self.hooks.cleanup();
        self.stream.shutdown();
    }

    fn refresh_timeout(&mut self) {
        if let Some(timeout) = self.timeout {
            self.hooks.schedule_timer(timeout);
        }
    }
}

impl<H: EventHooks> Drop for AsyncConnection<H> {
    fn drop(&mut self) {
        if !matches!(self.state, ConnState::Disconnected) {
            self.teardown(None);
        }
    }
}

fn payload_bytes(reply: &Reply) -> Option<Bytes> {
    match reply {
        Reply::Status(b) | Reply::Error(b) | Reply::String(b) | Reply::BigNumber(b) => {
            Some(b.clone())
        }
        Reply::Verbatim { data, .. } => Some(data.clone()),
        _ => None,
    }
}

/// Decode an encoded command (an array of bulk strings) back into its
/// arguments. Returns `None` for anything else, including inline commands,
/// which are then treated as ordinary single-reply commands.
fn command_args(command: &[u8]) -> Option<Vec<&[u8]>> {
    let mut rest = command;
    let header = split_line(&mut rest)?;
    if header.first() != Some(&b'*') {
        return None;
    }
    let count: usize = std::str::from_utf8(&header[1..]).ok()?.parse().ok()?;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let len_line = split_line(&mut rest)?;
        if len_line.first() != Some(&b'$') {
            return None;
        }
        let len: usize = std::str::from_utf8(&len_line[1..]).ok()?.parse().ok()?;
        if rest.len() < len + 2 {
            return None;
        }
        let (arg, tail) = rest.split_at(len);
        if &tail[..2] != b"\r\n" {
            return None;
        }
        args.push(arg);
        rest = &tail[2..];
    }
    Some(args)
}

fn split_line<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let pos = rest.windows(2).position(|w| w == b"\r\n")?;
    let line = &rest[..pos];
    *rest = &rest[pos + 2..];
    Some(line)
}
