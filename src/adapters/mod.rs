//! Event-loop adapters implementing [`EventHooks`](crate::event::EventHooks).

mod mio_hooks;

pub use mio_hooks::MioHooks;
