//! Network plumbing: transports and the readiness multiplexer.

pub mod listener;
pub mod transport;

pub use listener::{Listener, Notifier, Readiness, Wait, WAKE_TOKEN};
pub use transport::{TcpTransport, Transport};
