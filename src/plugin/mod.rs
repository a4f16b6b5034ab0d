//! Plugin runtime.
//!
//! A plugin is one Lua file running in its own Lua state on its own worker
//! thread. The [`PluginManager`] lives on the network thread: it loads and
//! unloads plugins, owns the shared [`Bridge`], and fans events out to the
//! workers without ever waiting on a handler.
//!
//! # Lifecycle
//!
//! ```text
//! Loaded ──start──▶ Running ──unload──▶ Unloading ──(drain, onUnload)──▶ gone
//! ```
//!
//! Once a plugin is `Unloading` no new event reaches it. Events already
//! queued run first, then `onUnload`, then the Lua state is dropped. A
//! restart goes through the same drain; the new instance is loaded by
//! [`PluginManager::reap`] once the old worker has exited.
//!
//! # Rules
//!
//! Configured [`Rule`]s are checked for every event and plugin pair before
//! the event is queued.
//!
//! # Commands
//!
//! A channel message starting with `<command_char><plugin name>` reaches
//! that plugin as `onCommand` with the prefix stripped; every other plugin
//! still sees `onMessage`. Private messages become `onQueryCommand` the same
//! way.

pub mod handlers;
pub mod primitives;
pub mod rules;
pub mod runtime;
pub mod watcher;
pub mod worker;

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

pub use handlers::{HandlerBindings, Hook};
pub use rules::{Rule, RuleAction};
pub use runtime::PluginRuntime;
pub use watcher::PluginWatcher;
pub use worker::{Job, Worker};

use crate::bridge::{Bridge, EnumSet, HandleId, StaticTable, Value};
use crate::config::PluginConfig;
use crate::constants::{MAX_INPUT_LINE, MAX_LINE_LEN};
use crate::error::{Error, Result};
use crate::irc::{Event, EventKind, SessionState};
use crate::server::Server;

/// Where a plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Script executed, not yet receiving events.
    Loaded,
    /// Receiving events.
    Running,
    /// Draining queued events before `onUnload`.
    Unloading,
}

/// Network-side view of a loaded plugin.
#[derive(Debug)]
pub struct Plugin {
    config: PluginConfig,
    state: PluginState,
    bound: BTreeSet<EventKind>,
    worker: Worker,
    /// Load again once the worker has exited.
    restart: bool,
}

impl Plugin {
    fn spawn(config: PluginConfig, bridge: Arc<Bridge>) -> Result<Self> {
        let (worker, bound) = Worker::spawn(config.clone(), bridge)?;
        Ok(Self {
            config,
            state: PluginState::Loaded,
            bound,
            worker,
            restart: false,
        })
    }

    fn start(&mut self) {
        if self.state == PluginState::Loaded {
            self.state = PluginState::Running;
        }
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Path of the script.
    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    /// Load parameters.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Event kinds with a bound handler.
    pub fn bound(&self) -> &BTreeSet<EventKind> {
        &self.bound
    }

    /// Hand `event` to the worker. No-op for unbound kinds or a plugin
    /// that is not running.
    fn dispatch(&self, server: HandleId, event: &Event) -> bool {
        if self.state != PluginState::Running || !self.bound.contains(&event.kind()) {
            return false;
        }
        self.worker.send(Job::Event {
            server,
            event: event.clone(),
        })
    }

    fn begin_unload(&mut self) {
        if self.state != PluginState::Unloading {
            self.state = PluginState::Unloading;
            self.worker.send(Job::Unload);
        }
    }
}

/// Text after `<command_char><name>` if `text` addresses plugin `name`.
///
/// `"!hello"` and `"!hello world"` address `hello`; `"!helloworld"` does
/// not.
pub fn command_text<'a>(text: &'a str, command_char: &str, name: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(command_char)?.strip_prefix(name)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(' ')
    }
}

/// The event as plugin `name` should see it.
fn event_for<'a>(event: &'a Event, command_char: &str, name: &str) -> Cow<'a, Event> {
    match event {
        Event::Message {
            origin,
            channel,
            text,
        } => match command_text(text, command_char, name) {
            Some(rest) => Cow::Owned(Event::Command {
                origin: origin.clone(),
                channel: channel.clone(),
                text: rest.to_string(),
            }),
            None => Cow::Borrowed(event),
        },
        Event::Query { origin, text } => match command_text(text, command_char, name) {
            Some(rest) => Cow::Owned(Event::QueryCommand {
                origin: origin.clone(),
                text: rest.to_string(),
            }),
            None => Cow::Borrowed(event),
        },
        _ => Cow::Borrowed(event),
    }
}

/// Build the bridge every plugin state is populated from.
fn default_bridge() -> Bridge {
    let mut bridge = Bridge::new();
    bridge.register_class::<Server>();
    bridge.register_enum(EnumSet {
        namespace: "irc",
        name: "state",
        constants: SessionState::ALL
            .iter()
            .map(|state| (state.name(), state.code()))
            .collect(),
    });
    bridge.register_table(StaticTable {
        namespace: "irc",
        name: "limits",
        entries: vec![
            ("line_length".into(), Value::from(MAX_LINE_LEN as i64)),
            ("input_line_length".into(), Value::from(MAX_INPUT_LINE as i64)),
        ],
    });
    bridge
}

/// Outcome of [`PluginManager::collect_garbage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collection {
    /// Workers asked to run a collection cycle.
    pub workers: usize,
    /// Dead handle entries removed from the table.
    pub swept: usize,
}

/// Loads plugins and routes events to them.
#[derive(Debug)]
pub struct PluginManager {
    bridge: Arc<Bridge>,
    /// Running plugins, in load order.
    plugins: Vec<Plugin>,
    /// Plugins whose worker has not exited yet.
    unloading: Vec<Plugin>,
    /// Server name -> handle passed to handlers.
    servers: HashMap<String, HandleId>,
    rules: Vec<Rule>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    /// Create a manager with the standard bridge.
    pub fn new() -> Self {
        Self {
            bridge: Arc::new(default_bridge()),
            plugins: Vec::new(),
            unloading: Vec::new(),
            servers: HashMap::new(),
            rules: Vec::new(),
        }
    }

    /// Replace the event filtering rules.
    pub fn set_rules(&mut self, rules: Vec<Rule>) {
        self.rules = rules;
    }

    /// Current event filtering rules.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The shared bridge.
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Expose `server` to plugins. Replaces (and revokes) an earlier
    /// server of the same name.
    pub fn attach_server(&mut self, server: Arc<Server>) -> HandleId {
        let name = server.name().to_string();
        let id = self.bridge.expose(server);
        if let Some(old) = self.servers.insert(name, id) {
            self.bridge.handles().revoke(old);
        }
        id
    }

    /// Revoke the handle of server `name`. Scripts still holding it get
    /// `HandleExpired` from then on.
    pub fn detach_server(&mut self, name: &str) -> Result<()> {
        let id = self
            .servers
            .remove(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))?;
        self.bridge.handles().revoke(id);
        Ok(())
    }

    /// Handle of server `name`.
    pub fn server_handle(&self, name: &str) -> Option<HandleId> {
        self.servers.get(name).copied()
    }

    /// Load the plugin at `path` under `name`.
    pub fn load(&mut self, name: &str, path: impl Into<PathBuf>) -> Result<()> {
        self.load_with(&PluginConfig::new(name, path))
    }

    /// Load a plugin described by `config`.
    ///
    /// Blocks until the script's top level and `onLoad` have run.
    pub fn load_with(&mut self, config: &PluginConfig) -> Result<()> {
        if self.is_loaded(&config.name) {
            return Err(Error::plugin_load(&config.name, "already loaded"));
        }
        if self.is_restarting(&config.name) {
            return Err(Error::plugin_load(&config.name, "restart in progress"));
        }

        let mut plugin = Plugin::spawn(config.clone(), Arc::clone(&self.bridge))?;
        plugin.start();
        log::info!(
            "Plugin {} running ({})",
            plugin.name(),
            plugin
                .bound()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.plugins.push(plugin);
        Ok(())
    }

    /// Start unloading plugin `name`. Does not wait for the worker.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let index = self
            .position(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        let mut plugin = self.plugins.remove(index);
        plugin.begin_unload();
        self.unloading.push(plugin);
        Ok(())
    }

    /// Call plugin `name`'s `onReload`.
    pub fn reload(&self, name: &str) -> Result<()> {
        let plugin = self
            .plugin(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        plugin.worker.send(Job::Reload);
        Ok(())
    }

    /// Unload plugin `name` and load it again from disk.
    ///
    /// Does not wait for the worker: queued events drain and `onUnload`
    /// runs in the background, then [`PluginManager::reap`] loads the new
    /// instance.
    pub fn restart(&mut self, name: &str) -> Result<()> {
        let index = self
            .position(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        let mut plugin = self.plugins.remove(index);
        plugin.begin_unload();
        plugin.restart = true;
        self.unloading.push(plugin);
        Ok(())
    }

    /// Whether plugin `name` is draining before being loaded again.
    pub fn is_restarting(&self, name: &str) -> bool {
        self.unloading
            .iter()
            .any(|plugin| plugin.restart && plugin.name() == name)
    }

    /// Deliver `event` from `server` to every plugin bound to it.
    ///
    /// Returns the number of plugins the event was queued for.
    pub fn dispatch(&self, server: &Server, event: &Event) -> usize {
        let Some(handle) = self.server_handle(server.name()) else {
            log::debug!("Event from unattached server {}", server.name());
            return 0;
        };

        self.plugins
            .iter()
            .filter(|plugin| {
                let event = event_for(event, server.command_char(), plugin.name());
                if !rules::accepts(&self.rules, server.name(), &event, plugin.name()) {
                    log::trace!(
                        "Rule dropped {} from {} for plugin {}",
                        event.kind(),
                        server.name(),
                        plugin.name()
                    );
                    return false;
                }
                plugin.dispatch(handle, &event)
            })
            .count()
    }

    /// Ask every worker for a full GC cycle, then drop dead handles.
    ///
    /// Workers collect asynchronously, so references released by this
    /// round's cycles are swept by the next call.
    pub fn collect_garbage(&self) -> Collection {
        let workers = self
            .plugins
            .iter()
            .filter(|plugin| plugin.worker.send(Job::CollectGarbage))
            .count();
        let swept = self.bridge.handles().sweep();
        if swept > 0 {
            log::debug!("Swept {} dead handles", swept);
        }
        Collection { workers, swept }
    }

    /// Join workers that finished unloading and load the ones being
    /// restarted.
    pub fn reap(&mut self) {
        let mut restarts = Vec::new();
        self.unloading.retain_mut(|plugin| {
            if !plugin.worker.is_finished() {
                return true;
            }
            plugin.worker.join();
            if plugin.restart {
                restarts.push(plugin.config.clone());
            }
            false
        });

        for config in restarts {
            match self.load_with(&config) {
                Ok(()) => log::info!("Restarted plugin {}", config.name),
                Err(e) => log::error!("Failed to restart plugin {}: {}", config.name, e),
            }
        }
    }

    /// Unload every plugin, wait for all workers, and revoke all handles.
    pub fn shutdown(&mut self) {
        for mut plugin in self.plugins.drain(..) {
            plugin.begin_unload();
            self.unloading.push(plugin);
        }
        for plugin in &mut self.unloading {
            plugin.worker.join();
        }
        self.unloading.clear();
        self.servers.clear();
        self.bridge.handles().revoke_all();
        self.bridge.handles().sweep();
    }

    /// Names of running plugins, in load order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(Plugin::name).collect()
    }

    /// Running plugin `name`.
    pub fn plugin(&self, name: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    /// Whether plugin `name` is running.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// True when every worker has processed its queue and nothing is
    /// still unloading.
    pub fn is_idle(&self) -> bool {
        self.unloading.is_empty() && self.plugins.iter().all(|p| p.worker.is_idle())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name() == name)
    }
}
