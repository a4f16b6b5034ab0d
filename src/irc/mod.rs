//! IRC protocol layer: line parsing, events, commands and sessions.

pub mod command;
pub mod event;
pub mod message;
pub mod session;

pub use command::Command;
pub use event::{Event, EventKind, WhoisInfo};
pub use message::{Message, Origin};
pub use session::{is_channel, Session, SessionState};
