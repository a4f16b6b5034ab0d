//! Handler bindings captured from a plugin's globals.
//!
//! After the script's top level runs, every global function named after an
//! event kind (`onJoin`, `onMessage`, ...) or a lifecycle hook (`onLoad`,
//! `onUnload`, `onReload`) is pinned in the Lua registry. Later changes to
//! the globals do not rebind handlers; a hot reload does.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::irc::EventKind;

/// Plugin lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Called once after the script is loaded.
    Load,
    /// Called once before the Lua state is dropped.
    Unload,
    /// Called on an explicit reload request.
    Reload,
}

impl Hook {
    /// Every hook.
    pub const ALL: [Hook; 3] = [Self::Load, Self::Unload, Self::Reload];

    /// Global function name the hook is bound to.
    pub fn handler_name(self) -> &'static str {
        match self {
            Self::Load => "onLoad",
            Self::Unload => "onUnload",
            Self::Reload => "onReload",
        }
    }
}

/// Registry keys of the functions a plugin defines.
#[derive(Default)]
pub struct HandlerBindings {
    events: HashMap<EventKind, LuaRegistryKey>,
    hooks: HashMap<Hook, LuaRegistryKey>,
}

impl std::fmt::Debug for HandlerBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBindings")
            .field("events", &self.kinds())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fetch global `name` if it is a function.
///
/// A global of another type is ignored with a warning rather than failing
/// the load.
fn global_function(lua: &Lua, name: &str) -> Result<Option<LuaFunction>> {
    match lua
        .globals()
        .get::<LuaValue>(name)
        .map_err(|e| anyhow!("Failed to read global {name}: {e}"))?
    {
        LuaValue::Function(func) => Ok(Some(func)),
        LuaValue::Nil => Ok(None),
        other => {
            log::warn!(
                "Global {} is a {}, not a function; ignoring",
                name,
                other.type_name()
            );
            Ok(None)
        }
    }
}

impl HandlerBindings {
    /// Capture every handler currently defined in `lua`'s globals.
    pub fn capture(lua: &Lua) -> Result<Self> {
        let mut bindings = Self::default();

        for kind in EventKind::ALL {
            if let Some(func) = global_function(lua, kind.handler_name())? {
                let key = lua
                    .create_registry_value(func)
                    .map_err(|e| anyhow!("Failed to create registry value: {e}"))?;
                bindings.events.insert(kind, key);
            }
        }

        for hook in Hook::ALL {
            if let Some(func) = global_function(lua, hook.handler_name())? {
                let key = lua
                    .create_registry_value(func)
                    .map_err(|e| anyhow!("Failed to create registry value: {e}"))?;
                bindings.hooks.insert(hook, key);
            }
        }

        Ok(bindings)
    }

    /// Event kinds with a bound handler.
    pub fn kinds(&self) -> BTreeSet<EventKind> {
        self.events.keys().copied().collect()
    }

    /// Handler bound to `kind`, if any.
    pub fn event(&self, lua: &Lua, kind: EventKind) -> Option<LuaFunction> {
        self.events
            .get(&kind)
            .and_then(|key| lua.registry_value::<LuaFunction>(key).ok())
    }

    /// Function bound to `hook`, if any.
    pub fn hook(&self, lua: &Lua, hook: Hook) -> Option<LuaFunction> {
        self.hooks
            .get(&hook)
            .and_then(|key| lua.registry_value::<LuaFunction>(key).ok())
    }

    /// Remove every registry entry.
    pub fn release(self, lua: &Lua) {
        for (name, key) in self
            .events
            .into_iter()
            .map(|(kind, key)| (kind.handler_name(), key))
            .chain(
                self.hooks
                    .into_iter()
                    .map(|(hook, key)| (hook.handler_name(), key)),
            )
        {
            if let Err(e) = lua.remove_registry_value(key) {
                log::warn!("Failed to remove registry value for {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_binds_defined_handlers_only() {
        let lua = Lua::new();
        lua.load(
            r#"
            function onJoin() end
            function onLoad() end
            onPart = 42
            "#,
        )
        .exec()
        .unwrap();

        let bindings = HandlerBindings::capture(&lua).unwrap();
        assert_eq!(bindings.kinds(), BTreeSet::from([EventKind::Join]));
        assert!(bindings.event(&lua, EventKind::Join).is_some());
        assert!(bindings.event(&lua, EventKind::Part).is_none());
        assert!(bindings.hook(&lua, Hook::Load).is_some());
        assert!(bindings.hook(&lua, Hook::Unload).is_none());
    }

    #[test]
    fn test_bindings_survive_global_reassignment() {
        let lua = Lua::new();
        lua.load("hits = 0 function onPing() hits = hits + 1 end")
            .exec()
            .unwrap();
        let bindings = HandlerBindings::capture(&lua).unwrap();

        lua.load("onPing = nil").exec().unwrap();
        bindings
            .event(&lua, EventKind::Ping)
            .expect("still bound")
            .call::<()>(())
            .unwrap();

        let hits: i64 = lua.globals().get("hits").unwrap();
        assert_eq!(hits, 1);
        bindings.release(&lua);
    }
}
