//! Error taxonomy for the daemon core.
//!
//! Every variant is local to one server, one plugin, or one script call.
//! Nothing here terminates the process. The only fatal condition, failing
//! to create the multiplexer, is an I/O error from `Listener::new` that
//! `Daemon::new` reports to `main`.

use std::io;

use crate::constants::MAX_LINE_LEN;

/// Result alias used across the core modules.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the network, protocol, bridge and plugin layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect/read/write failure on a transport. Disconnects the session.
    #[error("transport error on '{server}': {source}")]
    Transport {
        /// Server whose connection failed.
        server: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A wire line could not be parsed. The line is skipped.
    #[error("malformed protocol line: {0}")]
    ProtocolParse(String),

    /// The rendered command does not fit in one protocol line.
    #[error("command too long: {len} bytes (limit {MAX_LINE_LEN})")]
    CommandTooLong {
        /// Rendered length including the line terminator.
        len: usize,
    },

    /// A command parameter contains a byte that would break framing.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// A value cannot cross the native/script boundary.
    #[error("conversion error: {0}")]
    BridgeConversion(String),

    /// The scripting engine failed to load or initialize a plugin.
    #[error("failed to load plugin '{name}': {reason}")]
    PluginLoad {
        /// Plugin name.
        name: String,
        /// Engine-reported reason.
        reason: String,
    },

    /// A script dereferenced a handle whose native object is gone.
    #[error("handle {0} has expired")]
    HandleExpired(u64),

    /// No plugin with this name is loaded.
    #[error("no such plugin: {0}")]
    UnknownPlugin(String),

    /// No server with this name is configured.
    #[error("no such server: {0}")]
    UnknownServer(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Build a `Transport` error for `server`.
    pub fn transport(server: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            server: server.into(),
            source,
        }
    }

    /// Build a `PluginLoad` error.
    pub fn plugin_load(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::PluginLoad {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<Error> for mlua::Error {
    fn from(err: Error) -> Self {
        mlua::Error::external(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_too_long_message_mentions_limit() {
        let err = Error::CommandTooLong { len: 600 };
        let msg = err.to_string();
        assert!(msg.contains("600"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_handle_expired_converts_to_lua_error() {
        let lua_err: mlua::Error = Error::HandleExpired(7).into();
        assert!(lua_err.to_string().contains("handle 7 has expired"));
    }

    #[test]
    fn test_transport_keeps_source() {
        let err = Error::transport("libera", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("libera"));
    }
}
