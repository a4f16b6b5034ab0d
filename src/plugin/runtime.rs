//! One plugin's Lua state.
//!
//! `PluginRuntime` is built and used on the plugin's worker thread only
//! (`mlua::Lua` is not `Send`). It registers the primitives, installs the
//! bridge's enums and tables, runs the script's top level, binds handlers and
//! finally calls `onLoad`. Any failure along the way is a `PluginLoad`
//! error and nothing is left running.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use mlua::prelude::*;

use super::handlers::{HandlerBindings, Hook};
use super::primitives::{self, timer};
use crate::bridge::{Bridge, HandleId, Value};
use crate::config::PluginConfig;
use crate::error::Error;
use crate::irc::{Event, EventKind};

/// A loaded plugin script and its bound handlers.
pub struct PluginRuntime {
    lua: Lua,
    name: String,
    path: PathBuf,
    bridge: Arc<Bridge>,
    bindings: HandlerBindings,
    timers: timer::TimerRegistry,
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("bindings", &self.bindings)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

/// Let `require` find modules next to the plugin file.
fn setup_package_path(lua: &Lua, dir: &Path) -> Result<()> {
    let package: LuaTable = lua
        .globals()
        .get("package")
        .map_err(|e| anyhow!("Failed to get package table: {e}"))?;

    let current_path: String = package
        .get("path")
        .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;

    let new_path = format!(
        "{dir}/?.lua;{dir}/?/init.lua;{current}",
        dir = dir.display(),
        current = current_path
    );

    package
        .set("path", new_path)
        .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;
    Ok(())
}

fn load_file(lua: &Lua, path: &Path) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read Lua file: {}", path.display()))?;

    lua.load(&source)
        .set_name(path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow!("Failed to execute Lua file {}: {}", path.display(), e))?;

    log::debug!("Loaded Lua file: {}", path.display());
    Ok(())
}

impl PluginRuntime {
    /// Create the Lua state for `config` and run its top level and `onLoad`.
    pub fn new(config: &PluginConfig, bridge: Arc<Bridge>) -> Result<Self, Error> {
        let name = config.name.clone();
        let load_error = |e: anyhow::Error| Error::plugin_load(&name, format!("{e:#}"));

        let lua = Lua::new();
        let timers = timer::new_timer_registry();
        primitives::register_all(&lua, config, Arc::clone(&timers)).map_err(load_error)?;
        bridge
            .install(&lua)
            .map_err(|e| Error::plugin_load(&name, e))?;

        let dir = match config.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        setup_package_path(&lua, dir).map_err(load_error)?;
        load_file(&lua, &config.path).map_err(load_error)?;

        let bindings = HandlerBindings::capture(&lua).map_err(load_error)?;
        let runtime = Self {
            lua,
            name: name.clone(),
            path: config.path.clone(),
            bridge,
            bindings,
            timers,
        };

        if let Err(e) = runtime.call_hook(Hook::Load) {
            runtime.release();
            return Err(load_error(e));
        }

        log::info!(
            "Loaded plugin {} from {} ({} handlers)",
            runtime.name,
            runtime.path.display(),
            runtime.bindings.kinds().len()
        );
        Ok(runtime)
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event kinds this plugin handles.
    pub fn kinds(&self) -> BTreeSet<EventKind> {
        self.bindings.kinds()
    }

    /// Call the handler for `event`, passing `server` first.
    ///
    /// Returns `Ok(false)` when no handler is bound.
    pub fn dispatch(&self, server: HandleId, event: &Event) -> Result<bool> {
        let kind = event.kind();
        let Some(func) = self.bindings.event(&self.lua, kind) else {
            return Ok(false);
        };

        let event_args = event.args();
        let mut args = Vec::with_capacity(event_args.len() + 1);
        for value in std::iter::once(Value::Handle(server)).chain(event_args) {
            args.push(
                self.bridge
                    .to_script(&self.lua, &value)
                    .map_err(|e| anyhow!("Failed to convert {kind} argument: {e}"))?,
            );
        }

        func.call::<()>(LuaMultiValue::from_vec(args))
            .map_err(|e| anyhow!("Lua function '{}' failed: {}", kind.handler_name(), e))?;
        Ok(true)
    }

    /// Call a lifecycle hook if the plugin defines it.
    pub fn call_hook(&self, hook: Hook) -> Result<bool> {
        let Some(func) = self.bindings.hook(&self.lua, hook) else {
            return Ok(false);
        };
        func.call::<()>(())
            .map_err(|e| anyhow!("Lua function '{}' failed: {}", hook.handler_name(), e))?;
        Ok(true)
    }

    /// Deadline of the plugin's next timer.
    pub fn next_timer(&self) -> Option<Instant> {
        self.timers
            .lock()
            .expect("TimerEntries mutex poisoned")
            .next_deadline()
    }

    /// Fire due timers. Returns how many callbacks ran.
    pub fn fire_timers(&self) -> usize {
        timer::poll_timers(&self.lua, &self.timers)
    }

    /// Run a full garbage collection cycle.
    ///
    /// Collected server userdata release their handle references here.
    pub fn collect_garbage(&self) -> Result<()> {
        self.lua
            .gc_collect()
            .map_err(|e| anyhow!("Lua garbage collection failed: {e}"))
    }

    /// Run `onUnload` and drop the Lua state.
    pub fn close(self) {
        if let Err(e) = self.call_hook(Hook::Unload) {
            log::warn!("Plugin {} onUnload failed: {}", self.name, e);
        }
        log::info!("Unloaded plugin {}", self.name);
        self.release();
    }

    fn release(self) {
        let Self {
            lua,
            bindings,
            timers,
            ..
        } = self;
        timer::clear(&lua, &timers);
        bindings.release(&lua);
        if let Err(e) = lua.gc_collect() {
            log::debug!("Final garbage collection failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::irc::Origin;
    use crate::net::Notifier;
    use crate::server::Server;
    use std::io::Write;

    fn write_plugin(dir: &Path, name: &str, source: &str) -> PathBuf {
        let path = dir.join(format!("{name}.lua"));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    fn bridge() -> Arc<Bridge> {
        let mut bridge = Bridge::new();
        bridge.register_class::<Server>();
        Arc::new(bridge)
    }

    #[test]
    fn test_load_binds_handlers_and_runs_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "hello",
            "loaded = false function onLoad() loaded = true end function onJoin() end",
        );

        let runtime = PluginRuntime::new(&PluginConfig::new("hello", &path), bridge()).unwrap();
        assert_eq!(runtime.kinds(), BTreeSet::from([EventKind::Join]));
        let loaded: bool = runtime.lua.globals().get("loaded").unwrap();
        assert!(loaded);
        runtime.close();
    }

    #[test]
    fn test_syntax_error_is_plugin_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(dir.path(), "broken", "function onJoin(");

        let err = PluginRuntime::new(&PluginConfig::new("broken", &path), bridge()).unwrap_err();
        assert!(matches!(err, Error::PluginLoad { ref name, .. } if name == "broken"));
    }

    #[test]
    fn test_missing_file_is_plugin_load() {
        let err = PluginRuntime::new(
            &PluginConfig::new("ghost", "/nonexistent/ghost.lua"),
            bridge(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PluginLoad { .. }));
    }

    #[test]
    fn test_failing_on_load_is_plugin_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(dir.path(), "grumpy", r#"function onLoad() error("no") end"#);

        let err = PluginRuntime::new(&PluginConfig::new("grumpy", &path), bridge()).unwrap_err();
        assert!(err.to_string().contains("no"));
    }

    #[test]
    fn test_require_finds_sibling_module() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "helper", "return { answer = 42 }");
        let path = write_plugin(
            dir.path(),
            "main",
            r#"answer = require("helper").answer"#,
        );

        let runtime = PluginRuntime::new(&PluginConfig::new("main", &path), bridge()).unwrap();
        let answer: i64 = runtime.lua.globals().get("answer").unwrap();
        assert_eq!(answer, 42);
        runtime.close();
    }

    #[test]
    fn test_dispatch_passes_server_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "echo",
            r#"
            function onMessage(server, origin, channel, text)
                seen = server:name() .. " " .. origin .. " " .. channel .. " " .. text
            end
            "#,
        );
        let bridge = bridge();
        let server = Arc::new(Server::new(
            ServerConfig::new("local", "127.0.0.1", 6667, "bot"),
            Notifier::disabled(),
        ));
        let id = bridge.expose(Arc::clone(&server));

        let runtime =
            PluginRuntime::new(&PluginConfig::new("echo", &path), Arc::clone(&bridge)).unwrap();
        let event = Event::Message {
            origin: Origin::parse("alice!a@host"),
            channel: "#rust".into(),
            text: "hi".into(),
        };
        assert!(runtime.dispatch(id, &event).unwrap());
        assert!(!runtime.dispatch(id, &Event::Connect).unwrap());

        let seen: String = runtime.lua.globals().get("seen").unwrap();
        assert_eq!(seen, "local alice!a@host #rust hi");

        runtime.collect_garbage().unwrap();
        runtime.collect_garbage().unwrap();
        assert_eq!(bridge.handles().script_refs(id), 0);
        runtime.close();
    }

    #[test]
    fn test_timers_fire_and_stop_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plugin(
            dir.path(),
            "ticker",
            r#"
            fired = 0
            timer.after(0, function() fired = fired + 1 end)
            timer.every(3600, function() fired = fired + 100 end)
            "#,
        );

        let runtime = PluginRuntime::new(&PluginConfig::new("ticker", &path), bridge()).unwrap();
        assert!(runtime.next_timer().is_some());
        assert_eq!(runtime.fire_timers(), 1);
        let fired: i64 = runtime.lua.globals().get("fired").unwrap();
        assert_eq!(fired, 1);

        let timers = Arc::clone(&runtime.timers);
        assert_eq!(timers.lock().unwrap().len(), 1);
        runtime.close();
        assert!(timers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_runs_on_unload() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("unloaded");
        let path = write_plugin(
            dir.path(),
            "bye",
            &format!(
                r#"function onUnload() io.open("{}", "w"):close() end"#,
                marker.display()
            ),
        );

        let runtime = PluginRuntime::new(&PluginConfig::new("bye", &path), bridge()).unwrap();
        runtime.close();
        assert!(marker.exists());
    }
}
