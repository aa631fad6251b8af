//! Incremental RESP reply reader.
//!
//! The reader consumes byte chunks in whatever sizes the transport delivers
//! them and yields complete reply values. Parsing is a depth-first descent
//! driven by an explicit stack of parse tasks rather than recursion: input
//! may be fragmented at any byte boundary, so a call must be able to suspend
//! at any nesting depth and resume from the same point on the next call.
//!
//! Tasks live in a vector and refer to their parent by index, so completing
//! a child attaches it into the right aggregate without any pointer chasing.
//! The nesting depth is bounded; a stream that exceeds the bound is treated
//! as a protocol error rather than allowed to grow the stack without limit.

use crate::error::Error;
use crate::reply::{ReplyBuilder, ReplyKind, ReplyTreeBuilder};
use bytes::{Buf, BytesMut};
use std::ops::Range;
use tracing::trace;

/// Maximum parse-task stack depth. RESP payloads never nest anywhere near
/// this deep in practice; the bound keeps a corrupt or malicious stream from
/// growing the stack without limit.
pub const MAX_DEPTH: usize = 9;

/// Default high-water mark for the input buffer: once this many consumed
/// bytes accumulate in front of the cursor they are discarded.
pub const DEFAULT_HIGH_WATER: usize = 16 * 1024;

/// Largest accepted bulk payload (512 MiB, the server-side limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest accepted aggregate element count.
const MAX_AGGREGATE_ELEMENTS: i64 = 1024 * 1024;

/// A reply line (type marker plus payload) longer than this without a CRLF
/// terminator is treated as malformed rather than buffered forever.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Child vectors start no larger than this, whatever the declared element
/// count claims.
const INITIAL_CHILD_CAPACITY: usize = 1024;

/// Buffer tuning for a [`Reader`].
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    /// Consumed-prefix size that triggers compaction.
    pub high_water: usize,
    /// Hard cap on buffered, not-yet-parsed bytes. Exceeding it fails the
    /// feed with [`Error::OutOfMemory`].
    pub max_buffer: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            high_water: DEFAULT_HIGH_WATER,
            max_buffer: usize::MAX,
        }
    }
}

/// One in-progress parse frame.
///
/// For aggregates, `kind`/`expected`/`children` describe the container being
/// filled; scalar frames never populate them. `bulk` carries the declared
/// payload length between the bulk header line and its payload bytes.
#[derive(Debug)]
struct Task<R> {
    kind: Option<ReplyKind>,
    bulk: Option<(ReplyKind, usize)>,
    expected: usize,
    idx: usize,
    parent: Option<usize>,
    children: Vec<R>,
}

impl<R> Task<R> {
    fn root() -> Self {
        Self {
            kind: None,
            bulk: None,
            expected: 0,
            idx: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    fn child(parent: usize, idx: usize) -> Self {
        Self {
            kind: None,
            bulk: None,
            expected: 0,
            idx,
            parent: Some(parent),
            children: Vec::new(),
        }
    }
}

/// Outcome of parsing one element header.
enum Header<R> {
    /// The header line is not fully buffered yet.
    NeedMore,
    /// The element completed in its header line (scalars, nil sentinels,
    /// empty aggregates).
    Value(R),
    /// The frame now awaits payload bytes or child elements.
    Descend,
}

/// Incremental RESP reply parser.
///
/// Feed it transport bytes with [`feed`](Reader::feed), then drain complete
/// replies with [`get_reply`](Reader::get_reply). A protocol fault is
/// sticky: every later call returns the same error until [`reset`].
///
/// [`reset`]: Reader::reset
pub struct Reader<B: ReplyBuilder = ReplyTreeBuilder> {
    buf: BytesMut,
    pos: usize,
    config: ReaderConfig,
    stack: Vec<Task<B::Reply>>,
    err: Option<Error>,
    builder: B,
}

impl Reader<ReplyTreeBuilder> {
    /// Create a reader with the default tree builder and buffer tuning.
    pub fn new() -> Self {
        Self::with_builder(ReplyTreeBuilder)
    }
}

impl Default for Reader<ReplyTreeBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ReplyBuilder> Reader<B> {
    /// Create a reader with a custom reply builder.
    pub fn with_builder(builder: B) -> Self {
        Self::with_config(ReaderConfig::default(), builder)
    }

    /// Create a reader with explicit buffer tuning.
    pub fn with_config(config: ReaderConfig, builder: B) -> Self {
        Self {
            buf: BytesMut::new(),
            pos: 0,
            config,
            stack: Vec::new(),
            err: None,
            builder,
        }
    }

    /// Append transport bytes to the input buffer. Never parses.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let buffered = self.buf.len() - self.pos;
        if buffered.saturating_add(data.len()) > self.config.max_buffer {
            return Err(self.fail(Error::OutOfMemory(format!(
                "reader buffer would exceed {} bytes",
                self.config.max_buffer
            ))));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Try to parse one complete top-level reply from buffered bytes.
    ///
    /// Returns `Ok(Some(reply))` when a full reply was consumed,
    /// `Ok(None)` when more input is needed, and `Err` on a (sticky)
    /// protocol fault or buffer-limit failure.
    pub fn get_reply(&mut self) -> Result<Option<B::Reply>, Error> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.stack.is_empty() {
            if self.pos == self.buf.len() {
                self.compact();
                return Ok(None);
            }
            self.stack.push(Task::root());
        }
        match self.run() {
            Ok(Some(reply)) => {
                self.compact();
                Ok(Some(reply))
            }
            Ok(None) => {
                self.compact();
                Ok(None)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Number of buffered bytes not yet consumed by the parser.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True while a partially parsed reply is suspended in the task stack.
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty()
    }

    /// The sticky error, if one has been recorded.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Discard all buffered input, parse state and any sticky error.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.stack.clear();
        self.err = None;
    }

    fn fail(&mut self, e: Error) -> Error {
        self.err = Some(e.clone());
        e
    }

    /// Drive the task stack until a top-level reply completes or input runs
    /// out.
    fn run(&mut self) -> Result<Option<B::Reply>, Error> {
        loop {
            let top = self.stack.len() - 1;
            let value = if let Some((kind, len)) = self.stack[top].bulk {
                match self.read_bulk_payload(kind, len)? {
                    Some(v) => v,
                    None => return Ok(None),
                }
            } else {
                match self.parse_header()? {
                    Header::NeedMore => return Ok(None),
                    Header::Value(v) => v,
                    Header::Descend => continue,
                }
            };
            if let Some(reply) = self.complete(value) {
                return Ok(Some(reply));
            }
        }
    }

    /// Parse the type marker line of the element at the top of the stack.
    fn parse_header(&mut self) -> Result<Header<B::Reply>, Error> {
        let line = match self.take_line()? {
            Some(r) => r,
            None => return Ok(Header::NeedMore),
        };
        if line.is_empty() {
            return Err(Error::Protocol("empty reply line".to_string()));
        }
        let marker = self.buf[line.start];
        let body = line.start + 1..line.end;
        let kind = ReplyKind::from_marker(marker).ok_or_else(|| {
            Error::Protocol(format!("unknown reply type byte {:?}", marker as char))
        })?;

        let value = match kind {
            ReplyKind::Status | ReplyKind::Error | ReplyKind::BigNumber => {
                let Self { buf, builder, .. } = self;
                builder.create_string(kind, &buf[body])
            }
            ReplyKind::Integer => {
                let n = parse_i64(&self.buf[body])
                    .ok_or_else(|| Error::Protocol("bad integer value".to_string()))?;
                self.builder.create_integer(n)
            }
            ReplyKind::Double => {
                let text = std::str::from_utf8(&self.buf[body.clone()])
                    .map_err(|_| Error::Protocol("bad double value".to_string()))?;
                let parsed: f64 = text
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad double value {text:?}")))?;
                let Self { buf, builder, .. } = self;
                builder.create_double(parsed, &buf[body])
            }
            ReplyKind::Boolean => match &self.buf[body] {
                b"t" => self.builder.create_bool(true),
                b"f" => self.builder.create_bool(false),
                _ => return Err(Error::Protocol("bad boolean value".to_string())),
            },
            ReplyKind::Nil => {
                if body.start != body.end {
                    return Err(Error::Protocol("bad nil value".to_string()));
                }
                self.builder.create_nil()
            }
            ReplyKind::String | ReplyKind::Verbatim => {
                let len = parse_i64(&self.buf[body])
                    .ok_or_else(|| Error::Protocol("bad bulk string length".to_string()))?;
                if len == -1 {
                    // Null bulk sentinel.
                    self.builder.create_nil()
                } else if !(0..=MAX_BULK_LEN).contains(&len) {
                    return Err(Error::Protocol("bulk string length out of range".to_string()));
                } else {
                    let top = self.stack.len() - 1;
                    self.stack[top].bulk = Some((kind, len as usize));
                    return Ok(Header::Descend);
                }
            }
            ReplyKind::Array
            | ReplyKind::Map
            | ReplyKind::Set
            | ReplyKind::Push
            | ReplyKind::Attribute => {
                let count = parse_i64(&self.buf[body])
                    .ok_or_else(|| Error::Protocol("bad multi bulk length".to_string()))?;
                if count == -1 {
                    // Null aggregate sentinel: nil, never an empty container.
                    self.builder.create_nil()
                } else if !(0..=MAX_AGGREGATE_ELEMENTS).contains(&count) {
                    return Err(Error::Protocol("multi bulk length out of range".to_string()));
                } else {
                    let expected = if kind.is_paired() {
                        count as usize * 2
                    } else {
                        count as usize
                    };
                    if expected == 0 {
                        self.builder.create_array(kind, Vec::new())
                    } else {
                        if self.stack.len() >= MAX_DEPTH {
                            return Err(Error::Protocol(format!(
                                "aggregate nesting exceeds depth limit of {MAX_DEPTH}"
                            )));
                        }
                        let top = self.stack.len() - 1;
                        let task = &mut self.stack[top];
                        task.kind = Some(kind);
                        task.expected = expected;
                        task.children = Vec::with_capacity(expected.min(INITIAL_CHILD_CAPACITY));
                        self.stack.push(Task::child(top, 0));
                        return Ok(Header::Descend);
                    }
                }
            }
        };
        Ok(Header::Value(value))
    }

    /// Consume a bulk payload once its declared length is fully buffered.
    fn read_bulk_payload(
        &mut self,
        kind: ReplyKind,
        len: usize,
    ) -> Result<Option<B::Reply>, Error> {
        if self.buf.len() - self.pos < len + 2 {
            return Ok(None);
        }
        let start = self.pos;
        let end = start + len;
        if self.buf[end] != b'\r' || self.buf[end + 1] != b'\n' {
            return Err(Error::Protocol(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }
        if kind == ReplyKind::Verbatim && (len < 4 || self.buf[start + 3] != b':') {
            return Err(Error::Protocol("bad verbatim string prefix".to_string()));
        }
        self.pos = end + 2;
        let top = self.stack.len() - 1;
        self.stack[top].bulk = None;
        let Self { buf, builder, .. } = self;
        Ok(Some(builder.create_string(kind, &buf[start..end])))
    }

    /// Pop the finished element and attach it into its parent. Completing
    /// the last child of an aggregate completes the aggregate in turn, so
    /// this walks up as far as completions cascade. Returns the reply when
    /// the root frame finishes.
    fn complete(&mut self, value: B::Reply) -> Option<B::Reply> {
        let mut value = value;
        loop {
            let task = match self.stack.pop() {
                Some(t) => t,
                None => return Some(value),
            };
            let parent_idx = match task.parent {
                None => return Some(value),
                Some(p) => p,
            };
            debug_assert_eq!(parent_idx, self.stack.len() - 1);
            let parent = &mut self.stack[parent_idx];
            parent.children.push(value);
            if parent.children.len() == parent.expected {
                let children = std::mem::take(&mut parent.children);
                let kind = parent.kind.take().unwrap_or(ReplyKind::Array);
                value = self.builder.create_array(kind, children);
                // Next iteration pops the now-complete parent frame.
            } else {
                let idx = parent.children.len();
                self.stack.push(Task::child(parent_idx, idx));
                return None;
            }
        }
    }

    /// Consume one CRLF-terminated line, returning its range excluding the
    /// terminator. Bare line feeds never terminate a line.
    fn take_line(&mut self) -> Result<Option<Range<usize>>, Error> {
        let hay = &self.buf[self.pos..];
        for i in 0..hay.len().saturating_sub(1) {
            if hay[i] == b'\r' && hay[i + 1] == b'\n' {
                let line = self.pos..self.pos + i;
                self.pos += i + 2;
                return Ok(Some(line));
            }
        }
        if hay.len() > MAX_LINE_LEN {
            return Err(Error::Protocol(format!(
                "reply line exceeds {MAX_LINE_LEN} bytes without terminator"
            )));
        }
        Ok(None)
    }

    /// Discard the consumed prefix once it passes the high-water mark.
    /// Parse tasks never hold offsets into the buffer, so this is safe even
    /// mid-reply.
    fn compact(&mut self) {
        if self.pos >= self.config.high_water {
            trace!(consumed = self.pos, "compacting reader buffer");
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }
}

/// Strict decimal parse: optional leading minus, digits only, overflow
/// checked.
fn parse_i64(line: &[u8]) -> Option<i64> {
    let (negative, digits) = match line.split_first()? {
        (b'-', rest) => (true, rest),
        _ => (false, line),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(i64::from(b - b'0'))?;
    }
    Some(if negative { -n } else { n })
}
