//! The `util` table: helpers for protocol strings.
//!
//! Handlers receive the full origin of an event. Split it when only the
//! nickname matters:
//!
//! ```lua
//! function onJoin(server, origin, channel)
//!     server:say(channel, "hello " .. util.splituser(origin))
//! end
//! ```

use anyhow::{anyhow, Result};
use mlua::Lua;

use crate::irc::Origin;

/// Nickname part of `nick!user@host`.
pub fn split_user(target: &str) -> String {
    Origin::parse(target).nick
}

/// Everything after the `!` of `nick!user@host`, or `target` itself when
/// there is no `!`.
pub fn split_host(target: &str) -> &str {
    target.split_once('!').map_or(target, |(_, host)| host)
}

/// Register the global `util` table.
pub fn register(lua: &Lua) -> Result<()> {
    let util = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create util table: {e}"))?;

    let splituser = lua
        .create_function(|_, target: String| Ok(split_user(&target)))
        .map_err(|e| anyhow!("Failed to create util.splituser function: {e}"))?;
    util.set("splituser", splituser)
        .map_err(|e| anyhow!("Failed to set util.splituser: {e}"))?;

    let splithost = lua
        .create_function(|_, target: String| Ok(split_host(&target).to_string()))
        .map_err(|e| anyhow!("Failed to create util.splithost function: {e}"))?;
    util.set("splithost", splithost)
        .map_err(|e| anyhow!("Failed to set util.splithost: {e}"))?;

    lua.globals()
        .set("util", util)
        .map_err(|e| anyhow!("Failed to register util table globally: {e}"))?;
    Ok(())
}
