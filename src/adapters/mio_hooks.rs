//! [`EventHooks`] adapter for a mio poll loop.
//!
//! The adapter registers the connection's raw file descriptor with a mio
//! registry and keeps the interest set in step with the connection's
//! requests. Timers are exposed as a deadline the poll loop should use to
//! bound its wait; when the deadline passes, the loop calls
//! [`AsyncConnection::on_timeout`](crate::async_conn::AsyncConnection::on_timeout).

use crate::event::EventHooks;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::warn;

pub struct MioHooks {
    registry: Registry,
    token: Token,
    fd: RawFd,
    /// Currently registered interest set; `None` while unregistered.
    interests: Option<Interest>,
    deadline: Rc<Cell<Option<Instant>>>,
}

impl MioHooks {
    pub fn new(registry: &Registry, token: Token, fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            registry: registry.try_clone()?,
            token,
            fd,
            interests: None,
            deadline: Rc::new(Cell::new(None)),
        })
    }

    /// Shared handle to the timer deadline, for the poll loop to read when
    /// choosing its wait duration.
    pub fn deadline_handle(&self) -> Rc<Cell<Option<Instant>>> {
        Rc::clone(&self.deadline)
    }

    fn apply(&mut self, interests: Option<Interest>) {
        let mut source = SourceFd(&self.fd);
        let result = match (self.interests, interests) {
            (None, None) => Ok(()),
            (None, Some(new)) => self.registry.register(&mut source, self.token, new),
            (Some(_), Some(new)) => self.registry.reregister(&mut source, self.token, new),
            (Some(_), None) => self.registry.deregister(&mut source),
        };
        match result {
            Ok(()) => self.interests = interests,
            Err(e) => warn!(error = %e, token = ?self.token, "interest update failed"),
        }
    }

    fn with_added(&mut self, interest: Interest) {
        let new = match self.interests {
            Some(current) => current | interest,
            None => interest,
        };
        if self.interests != Some(new) {
            self.apply(Some(new));
        }
    }

    fn with_removed(&mut self, interest: Interest) {
        let new = match self.interests {
            Some(current) => current.remove(interest),
            None => return,
        };
        if self.interests != new {
            self.apply(new);
        }
    }
}

impl EventHooks for MioHooks {
    fn add_read(&mut self) {
        self.with_added(Interest::READABLE);
    }

    fn del_read(&mut self) {
        self.with_removed(Interest::READABLE);
    }

    fn add_write(&mut self) {
        self.with_added(Interest::WRITABLE);
    }

    fn del_write(&mut self) {
        self.with_removed(Interest::WRITABLE);
    }

    fn schedule_timer(&mut self, timeout: Duration) {
        self.deadline.set(Some(Instant::now() + timeout));
    }

    fn cancel_timer(&mut self) {
        self.deadline.set(None);
    }

    fn cleanup(&mut self) {
        self.deadline.set(None);
        self.apply(None);
    }
}
