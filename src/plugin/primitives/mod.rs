//! Native functions and classes available to plugin scripts.
//!
//! # Available Primitives
//!
//! - `log` - logging routed through the `log` crate (info, warn, error, debug)
//! - `irc` - daemon version; the bridge adds `irc.state` and `irc.limits`
//! - `plugin` - name, path and config options of the running plugin
//! - `timer` - one-shot and repeating callbacks (after, every, cancel, clear)
//! - `util` - splitting of `nick!user@host` origins
//! - `Server` - class of the handle passed to every event handler
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement a `register(lua: &Lua, ...) -> Result<()>` function
//! 3. Add `pub mod foo;` here
//! 4. Call `foo::register(lua)?;` in `register_all`

pub mod irc;
pub mod log;
pub mod plugin;
pub mod server;
pub mod timer;
pub mod util;

use anyhow::Result;
use mlua::Lua;

use crate::config::PluginConfig;
use timer::TimerRegistry;

/// Register every global primitive for `config`'s plugin.
///
/// Classes are not registered here: they reach scripts through the
/// bridge when a handle is converted.
pub fn register_all(lua: &Lua, config: &PluginConfig, timers: TimerRegistry) -> Result<()> {
    log::register(lua, &config.name)?;
    irc::register(lua)?;
    plugin::register(lua, &config.name, &config.path, &config.options)?;
    timer::register(lua, timers)?;
    util::register(lua)?;
    Ok(())
}
