//! The `irc` namespace.
//!
//! Only `irc.version` is set here. The bridge later adds `irc.state` and
//! `irc.limits` to the same table.

use anyhow::{anyhow, Result};
use mlua::Lua;

/// Daemon version reported to scripts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register the global `irc` table.
pub fn register(lua: &Lua) -> Result<()> {
    let irc = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create irc table: {e}"))?;
    irc.set("version", VERSION)
        .map_err(|e| anyhow!("Failed to set irc.version: {e}"))?;

    lua.globals()
        .set("irc", irc)
        .map_err(|e| anyhow!("Failed to register irc table globally: {e}"))?;
    Ok(())
}
