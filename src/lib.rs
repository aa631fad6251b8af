//! RESP client protocol core.
//!
//! Three layers, each usable on its own:
//!
//! - [`Reader`] incrementally parses RESP2/RESP3 reply streams into
//!   [`Reply`] values (or a caller's own representation via
//!   [`ReplyBuilder`]), tolerating arbitrary fragmentation.
//! - [`Connection`] is a blocking request/reply client with lazy output
//!   flushing for pipelining.
//! - [`AsyncConnection`] drives the same protocol from an external event
//!   loop through the [`EventHooks`] trait, correlating replies to
//!   callbacks in FIFO order and routing subscription traffic by channel.
//!
//! Commands are caller-encoded byte strings; this crate does not provide a
//! command builder.

pub mod adapters;
mod async_conn;
mod connection;
mod error;
mod event;
mod reader;
mod reply;
mod transport;

pub use async_conn::{reply_callback, AsyncConnection, ConnState, ReplyCallback};
pub use connection::Connection;
pub use error::Error;
pub use event::{EventHooks, NullHooks};
pub use reader::{Reader, ReaderConfig};
pub use reply::{Reply, ReplyBuilder, ReplyKind, ReplyTreeBuilder};
pub use transport::{ConnectOptions, Endpoint, KEEPALIVE_INTERVAL};
