//! The `plugin` table: identity and options of the running plugin.
//!
//! ```lua
//! log.info(plugin.name .. " loaded from " .. plugin.path)
//! local greeting = plugin.config.greeting or "hello"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use mlua::Lua;

/// Register the global `plugin` table.
pub fn register(
    lua: &Lua,
    name: &str,
    path: &Path,
    options: &BTreeMap<String, String>,
) -> Result<()> {
    let config = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create plugin.config table: {e}"))?;
    for (key, value) in options {
        config
            .set(key.as_str(), value.as_str())
            .map_err(|e| anyhow!("Failed to set plugin.config.{key}: {e}"))?;
    }

    let table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create plugin table: {e}"))?;
    table
        .set("name", name)
        .map_err(|e| anyhow!("Failed to set plugin.name: {e}"))?;
    table
        .set("path", path.to_string_lossy().as_ref())
        .map_err(|e| anyhow!("Failed to set plugin.path: {e}"))?;
    table
        .set("config", config)
        .map_err(|e| anyhow!("Failed to set plugin.config: {e}"))?;

    lua.globals()
        .set("plugin", table)
        .map_err(|e| anyhow!("Failed to register plugin table globally: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_table_fields() {
        let lua = Lua::new();
        let options = BTreeMap::from([("greeting".to_string(), "hi".to_string())]);
        register(&lua, "hello", Path::new("/srv/hello.lua"), &options).unwrap();

        let (name, path, greeting, missing): (String, String, String, Option<String>) = lua
            .load("return plugin.name, plugin.path, plugin.config.greeting, plugin.config.nope")
            .eval()
            .unwrap();
        assert_eq!(name, "hello");
        assert_eq!(path, "/srv/hello.lua");
        assert_eq!(greeting, "hi");
        assert_eq!(missing, None);
    }
}
