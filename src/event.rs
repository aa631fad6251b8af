//! Event-loop integration surface.
//!
//! An [`AsyncConnection`](crate::async_conn::AsyncConnection) never runs its
//! own loop. Instead it tells its [`EventHooks`] which readiness it wants,
//! and the owning loop calls back into the connection when the socket is
//! ready. One adapter ships in [`crate::adapters`]; any loop that can watch
//! a file descriptor can implement the trait.

use std::time::Duration;

/// Readiness and timer requests a connection makes of its event loop.
///
/// Requests are idempotent: asking for read interest that is already
/// registered must be a no-op, as must dropping interest that was never
/// registered.
pub trait EventHooks {
    /// Start delivering read readiness for the connection's socket.
    fn add_read(&mut self);
    /// Stop delivering read readiness.
    fn del_read(&mut self);
    /// Start delivering write readiness.
    fn add_write(&mut self);
    /// Stop delivering write readiness.
    fn del_write(&mut self);
    /// Arm (or re-arm) the command timeout. The loop should call
    /// [`AsyncConnection::on_timeout`](crate::async_conn::AsyncConnection::on_timeout)
    /// if the duration elapses first.
    fn schedule_timer(&mut self, timeout: Duration);
    /// Disarm the command timeout.
    fn cancel_timer(&mut self);
    /// The connection is going away; release loop-side resources.
    fn cleanup(&mut self);
}

/// Hooks that ignore every request. Useful for tests that drive the
/// connection by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl EventHooks for NullHooks {
    fn add_read(&mut self) {}
    fn del_read(&mut self) {}
    fn add_write(&mut self) {}
    fn del_write(&mut self) {}
    fn schedule_timer(&mut self, _timeout: Duration) {}
    fn cancel_timer(&mut self) {}
    fn cleanup(&mut self) {}
}
