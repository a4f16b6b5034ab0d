//! Logging primitive for plugin scripts.
//!
//! Exposes the `log` crate through a global `log` table. Every message is
//! tagged with the target `plugin::<name>` so `RUST_LOG` can filter one
//! plugin at a time.
//!
//! # Usage in Lua
//!
//! ```lua
//! log.info("joined " .. channel)
//! log.debug("raw args: " .. tostring(n))
//! ```

use anyhow::{anyhow, Result};
use mlua::Lua;

use crate::constants::PLUGIN_LOG_TARGET;

/// Log target used for messages from plugin `name`.
pub fn target_for(name: &str) -> String {
    format!("{PLUGIN_LOG_TARGET}::{name}")
}

/// Register the `log` table with `info`, `warn`, `error` and `debug`.
pub fn register(lua: &Lua, plugin: &str) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let levels = [
        ("info", log::Level::Info),
        ("warn", log::Level::Warn),
        ("error", log::Level::Error),
        ("debug", log::Level::Debug),
    ];

    for (name, level) in levels {
        let target = target_for(plugin);
        let func = lua
            .create_function(move |_, msg: String| {
                log::log!(target: target.as_str(), level, "{}", msg);
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{Function, Table};

    #[test]
    fn test_log_table_created() {
        let lua = Lua::new();
        register(&lua, "hello").expect("Should register log primitives");

        let log_table: Table = lua.globals().get("log").expect("log table should exist");
        for name in ["info", "warn", "error", "debug"] {
            let _: Function = log_table
                .get(name)
                .unwrap_or_else(|_| panic!("log.{name} should exist"));
        }
    }

    #[test]
    fn test_log_functions_callable() {
        let lua = Lua::new();
        register(&lua, "hello").expect("Should register log primitives");

        lua.load(r#"log.info("i") log.warn("w") log.error("e") log.debug("d")"#)
            .exec()
            .expect("log functions should be callable");
    }

    #[test]
    fn test_target_is_scoped_to_plugin() {
        assert_eq!(target_for("hello"), "plugin::hello");
    }
}
