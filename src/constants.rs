//! Daemon-wide constants.
//!
//! Protocol limits, loop timings and defaults live here so the numbers are
//! easy to find.

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Maximum length of one IRC line on the wire, CRLF included (RFC 1459).
pub const MAX_LINE_LEN: usize = 512;

/// Longest inbound line accepted before it is discarded.
///
/// Servers with IRCv3 message tags may exceed 512 bytes, so inbound lines
/// get a larger allowance than outbound ones.
pub const MAX_INPUT_LINE: usize = 8191;

/// Read buffer size for one `recv` call.
pub const READ_CHUNK: usize = 4096;

/// Channels (for NAMES) or nicknames (for WHOIS) with an unfinished reply
/// sequence kept at once. Replies for further targets are dropped until
/// one completes.
pub const MAX_PENDING_REPLIES: usize = 32;

/// Entries gathered for one reply sequence (names of a channel, channels
/// of a WHOIS). The rest is dropped.
pub const MAX_REPLY_ENTRIES: usize = 8192;

/// Default command character for `!plugin args` commands.
pub const DEFAULT_COMMAND_CHAR: &str = "!";

/// Default IRC port.
pub const DEFAULT_PORT: u16 = 6667;

// ============================================================================
// Event loop
// ============================================================================

/// Default bound on one multiplexer wait.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Default interval between Lua GC sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Default delay before reconnecting a dropped server.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Capacity hint for the multiplexer event buffer.
pub const EVENT_CAPACITY: usize = 128;

// ============================================================================
// Plugins
// ============================================================================

/// How long `load` waits for a plugin worker to report initialization.
pub const PLUGIN_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Log target prefix for messages emitted by plugin scripts.
pub const PLUGIN_LOG_TARGET: &str = "plugin";
