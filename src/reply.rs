//! Reply value model.
//!
//! A parsed RESP reply is a tree of [`Reply`] values. The reader does not
//! construct `Reply` directly: it goes through a [`ReplyBuilder`], so call
//! sites that want a different materialization (interned strings, arena
//! allocation, direct deserialization) can plug in their own builder without
//! the parser knowing about the concrete representation. [`ReplyTreeBuilder`]
//! is the default and builds the `Reply` tree below.
//!
//! RESP2 wire types:
//! - Status (simple string): `+OK\r\n`
//! - Error: `-ERR message\r\n`
//! - Integer: `:1000\r\n`
//! - Bulk string: `$6\r\nfoobar\r\n` or `$-1\r\n` (nil)
//! - Array: `*2\r\n...` or `*-1\r\n` (nil)
//!
//! RESP3 additions:
//! - Nil: `_\r\n`
//! - Boolean: `#t\r\n` / `#f\r\n`
//! - Double: `,3.14159\r\n`
//! - Big number: `(3492890328409238509324850943850943825024385\r\n`
//! - Verbatim string: `=15\r\ntxt:Some string\r\n`
//! - Map: `%2\r\n<key><val>...`
//! - Set: `~3\r\n<elem>...`
//! - Push: `>3\r\n<elem>...`
//! - Attribute: `|1\r\n<key><val>`

use bytes::Bytes;

/// The wire-level kind of a reply element.
///
/// Passed to [`ReplyBuilder`] constructors so a single string constructor
/// can cover every line/bulk flavor and a single aggregate constructor can
/// cover every container flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Status,
    Error,
    String,
    Verbatim,
    BigNumber,
    Integer,
    Double,
    Boolean,
    Nil,
    Array,
    Map,
    Set,
    Push,
    Attribute,
}

impl ReplyKind {
    /// Map a RESP type marker byte to its kind.
    pub fn from_marker(marker: u8) -> Option<ReplyKind> {
        match marker {
            b'+' => Some(ReplyKind::Status),
            b'-' => Some(ReplyKind::Error),
            b':' => Some(ReplyKind::Integer),
            b'$' => Some(ReplyKind::String),
            b'*' => Some(ReplyKind::Array),
            b',' => Some(ReplyKind::Double),
            b'#' => Some(ReplyKind::Boolean),
            b'_' => Some(ReplyKind::Nil),
            b'=' => Some(ReplyKind::Verbatim),
            b'(' => Some(ReplyKind::BigNumber),
            b'%' => Some(ReplyKind::Map),
            b'~' => Some(ReplyKind::Set),
            b'>' => Some(ReplyKind::Push),
            b'|' => Some(ReplyKind::Attribute),
            _ => None,
        }
    }

    /// Returns true for container kinds whose payload is child elements.
    #[inline]
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            ReplyKind::Array
                | ReplyKind::Map
                | ReplyKind::Set
                | ReplyKind::Push
                | ReplyKind::Attribute
        )
    }

    /// Map and attribute elements arrive as key/value pairs, so the wire
    /// element count is doubled.
    #[inline]
    pub(crate) fn is_paired(self) -> bool {
        matches!(self, ReplyKind::Map | ReplyKind::Attribute)
    }
}

/// Pluggable reply construction.
///
/// The reader calls exactly one constructor per completed element. Aggregate
/// children are handed over fully built and in wire order; for map-like
/// kinds (`Map`, `Attribute`) the vector holds the flattened key/value
/// sequence (2N elements).
pub trait ReplyBuilder {
    /// The materialized reply representation.
    type Reply;

    /// Build a line- or bulk-string element. `kind` is one of `Status`,
    /// `Error`, `String`, `Verbatim` or `BigNumber`. For `Verbatim` the data
    /// still carries the leading 3-byte format tag and `:` separator.
    fn create_string(&mut self, kind: ReplyKind, data: &[u8]) -> Self::Reply;

    /// Build an aggregate from its completed children. `kind` is one of
    /// `Array`, `Map`, `Set`, `Push` or `Attribute`.
    fn create_array(&mut self, kind: ReplyKind, elements: Vec<Self::Reply>) -> Self::Reply;

    /// Build an integer element.
    fn create_integer(&mut self, value: i64) -> Self::Reply;

    /// Build a double element. `raw` is the formatted text as it appeared on
    /// the wire.
    fn create_double(&mut self, value: f64, raw: &[u8]) -> Self::Reply;

    /// Build a nil element (explicit `_` nil or a `-1` length sentinel).
    fn create_nil(&mut self) -> Self::Reply;

    /// Build a boolean element.
    fn create_bool(&mut self, value: bool) -> Self::Reply;
}

/// A parsed RESP reply value.
///
/// Aggregates own their children exclusively; no value is shared between
/// two containers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple status line: `+OK\r\n`
    Status(Bytes),
    /// Server error reply: `-ERR message\r\n`. This is a valid reply value,
    /// not a protocol fault.
    Error(Bytes),
    /// Bulk string payload (binary safe).
    String(Bytes),
    /// Verbatim string with its 3-byte format tag (e.g. `txt`, `mkd`).
    Verbatim { format: [u8; 3], data: Bytes },
    /// Arbitrary-precision integer, kept as its decimal text.
    BigNumber(Bytes),
    /// 64-bit signed integer.
    Integer(i64),
    /// Double along with the formatted capture from the wire.
    Double { value: f64, raw: Bytes },
    /// Boolean.
    Boolean(bool),
    /// Nil (`$-1`, `*-1` or `_`).
    Nil,
    /// Array of child replies.
    Array(Vec<Reply>),
    /// Map entries in wire order.
    Map(Vec<(Reply, Reply)>),
    /// Set members in wire order.
    Set(Vec<Reply>),
    /// Server-initiated push (subscription delivery).
    Push(Vec<Reply>),
    /// Attribute metadata pairs.
    Attribute(Vec<(Reply, Reply)>),
}

impl Reply {
    /// The kind tag for this value.
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Status(_) => ReplyKind::Status,
            Reply::Error(_) => ReplyKind::Error,
            Reply::String(_) => ReplyKind::String,
            Reply::Verbatim { .. } => ReplyKind::Verbatim,
            Reply::BigNumber(_) => ReplyKind::BigNumber,
            Reply::Integer(_) => ReplyKind::Integer,
            Reply::Double { .. } => ReplyKind::Double,
            Reply::Boolean(_) => ReplyKind::Boolean,
            Reply::Nil => ReplyKind::Nil,
            Reply::Array(_) => ReplyKind::Array,
            Reply::Map(_) => ReplyKind::Map,
            Reply::Set(_) => ReplyKind::Set,
            Reply::Push(_) => ReplyKind::Push,
            Reply::Attribute(_) => ReplyKind::Attribute,
        }
    }

    /// Returns true if this is a nil value.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Returns true if this is a server error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Text payload for string-like values (status, error, bulk, verbatim,
    /// big number).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(b) | Reply::Error(b) | Reply::String(b) | Reply::BigNumber(b) => {
                Some(b)
            }
            Reply::Verbatim { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Text payload as UTF-8, if it is valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Integer payload.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Child elements for sequence-like aggregates (array, set, push).
    pub fn elements(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(v) | Reply::Set(v) | Reply::Push(v) => Some(v),
            _ => None,
        }
    }
}

/// Default builder: materializes the [`Reply`] tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyTreeBuilder;

impl ReplyBuilder for ReplyTreeBuilder {
    type Reply = Reply;

    fn create_string(&mut self, kind: ReplyKind, data: &[u8]) -> Reply {
        match kind {
            ReplyKind::Status => Reply::Status(Bytes::copy_from_slice(data)),
            ReplyKind::Error => Reply::Error(Bytes::copy_from_slice(data)),
            ReplyKind::BigNumber => Reply::BigNumber(Bytes::copy_from_slice(data)),
            ReplyKind::Verbatim => {
                // The reader guarantees at least "xxx:" is present.
                let mut format = [0u8; 3];
                format.copy_from_slice(&data[..3]);
                Reply::Verbatim {
                    format,
                    data: Bytes::copy_from_slice(&data[4..]),
                }
            }
            _ => Reply::String(Bytes::copy_from_slice(data)),
        }
    }

    fn create_array(&mut self, kind: ReplyKind, elements: Vec<Reply>) -> Reply {
        match kind {
            ReplyKind::Map => Reply::Map(pair_up(elements)),
            ReplyKind::Attribute => Reply::Attribute(pair_up(elements)),
            ReplyKind::Set => Reply::Set(elements),
            ReplyKind::Push => Reply::Push(elements),
            _ => Reply::Array(elements),
        }
    }

    fn create_integer(&mut self, value: i64) -> Reply {
        Reply::Integer(value)
    }

    fn create_double(&mut self, value: f64, raw: &[u8]) -> Reply {
        Reply::Double {
            value,
            raw: Bytes::copy_from_slice(raw),
        }
    }

    fn create_nil(&mut self) -> Reply {
        Reply::Nil
    }

    fn create_bool(&mut self, value: bool) -> Reply {
        Reply::Boolean(value)
    }
}

/// Fold a flattened key/value sequence into pairs. The reader only produces
/// even-length sequences for paired kinds.
fn pair_up(elements: Vec<Reply>) -> Vec<(Reply, Reply)> {
    let mut pairs = Vec::with_capacity(elements.len() / 2);
    let mut it = elements.into_iter();
    while let (Some(key), Some(value)) = (it.next(), it.next()) {
        pairs.push((key, value));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_mapping() {
        assert_eq!(ReplyKind::from_marker(b'+'), Some(ReplyKind::Status));
        assert_eq!(ReplyKind::from_marker(b'-'), Some(ReplyKind::Error));
        assert_eq!(ReplyKind::from_marker(b':'), Some(ReplyKind::Integer));
        assert_eq!(ReplyKind::from_marker(b'$'), Some(ReplyKind::String));
        assert_eq!(ReplyKind::from_marker(b'*'), Some(ReplyKind::Array));
        assert_eq!(ReplyKind::from_marker(b'>'), Some(ReplyKind::Push));
        assert_eq!(ReplyKind::from_marker(b'x'), None);
    }

    #[test]
    fn test_builder_strings() {
        let mut b = ReplyTreeBuilder;
        assert_eq!(
            b.create_string(ReplyKind::Status, b"OK"),
            Reply::Status(Bytes::from_static(b"OK"))
        );
        assert_eq!(
            b.create_string(ReplyKind::Error, b"ERR bad"),
            Reply::Error(Bytes::from_static(b"ERR bad"))
        );
        assert_eq!(
            b.create_string(ReplyKind::String, b"foobar"),
            Reply::String(Bytes::from_static(b"foobar"))
        );
    }

    #[test]
    fn test_builder_verbatim_splits_format_tag() {
        let mut b = ReplyTreeBuilder;
        match b.create_string(ReplyKind::Verbatim, b"txt:Some string") {
            Reply::Verbatim { format, data } => {
                assert_eq!(&format, b"txt");
                assert_eq!(&data[..], b"Some string");
            }
            other => panic!("expected verbatim, got {other:?}"),
        }
    }

    #[test]
    fn test_builder_map_pairs() {
        let mut b = ReplyTreeBuilder;
        let flat = vec![
            Reply::String(Bytes::from_static(b"first")),
            Reply::Integer(1),
            Reply::String(Bytes::from_static(b"second")),
            Reply::Integer(2),
        ];
        match b.create_array(ReplyKind::Map, flat) {
            Reply::Map(pairs) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].1, Reply::Integer(1));
                assert_eq!(pairs[1].0.as_bytes(), Some(&b"second"[..]));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn test_accessors() {
        let r = Reply::Status(Bytes::from_static(b"OK"));
        assert_eq!(r.as_str(), Some("OK"));
        assert_eq!(r.kind(), ReplyKind::Status);
        assert!(!r.is_nil());

        let r = Reply::Integer(42);
        assert_eq!(r.as_integer(), Some(42));
        assert_eq!(r.as_bytes(), None);

        let r = Reply::Array(vec![Reply::Nil]);
        assert_eq!(r.elements().map(<[Reply]>::len), Some(1));
    }
}
