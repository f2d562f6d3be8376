//! Networking on top of the event loop.
//!
//! There is no async/await here: sockets are registered with a loop and
//! driven by readiness callbacks, and user code plugs in through
//! [`tcp::NetworkHandler`].

pub mod tcp;
