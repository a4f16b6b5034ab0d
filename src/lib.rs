//! ircplugd - IRC daemon with sandboxed Lua plugins.
//!
//! The daemon keeps connections to any number of IRC servers on one network
//! thread and forwards protocol events to plugins, each running in its own
//! Lua state on its own worker thread. Plugins act on servers through
//! handles that are checked for liveness on every use.
//!
//! # Architecture
//!
//! - **Listener** - readiness multiplexer with a cross-thread wake-up
//! - **Session** - per-server protocol state machine (bytes <-> events/commands)
//! - **CommandQueue** - many-producer FIFO from plugins to the network thread
//! - **PluginManager** - plugin lifecycle and event fan-out
//! - **Bridge** - value conversion and native class exposition for Lua
//! - **Daemon** - owns all of the above and runs the loop
//!
//! # Modules
//!
//! - [`net`] - transports and the listener
//! - [`irc`] - wire parsing, commands, events, sessions
//! - [`server`] - plugin-visible server state and command queue
//! - [`bridge`] - value bridge and handle table
//! - [`plugin`] - Lua runtime, workers, primitives, hot reload
//! - [`daemon`] - the loop and its control surface
//! - [`config`] - configuration loading

// Library modules
pub mod bridge;
pub mod daemon;
pub mod irc;
pub mod net;
pub mod plugin;
pub mod server;

pub mod config;
pub mod constants;
pub mod error;

// Re-export commonly used types
pub use bridge::{Bridge, HandleId, Value};
pub use config::Config;
pub use daemon::{ControlHandle, ControlRequest, Daemon};
pub use error::{Error, Result};
pub use irc::{Command, Event, EventKind};
pub use plugin::PluginManager;
pub use server::Server;
