//! The daemon loop.
//!
//! [`Daemon`] is the one process-scoped object: it owns the listener, every
//! server connection, the plugin manager, the control channel and the hot
//! reload watcher. Everything runs on the calling thread; plugin handlers
//! run on their own workers and talk back only through command queues.
//!
//! One [`Daemon::tick`]:
//!
//! 1. wait for readiness (bounded by `tick_ms`, cut short by any enqueue);
//! 2. read ready sessions and dispatch their events in wire order;
//! 3. drain every command queue into its session and flush;
//! 4. housekeeping: control requests, reconnects, hot reload, GC, reaping.

pub mod connection;
pub mod control;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mio::Token;

pub use connection::Connection;
pub use control::{ControlHandle, ControlRequest};

use crate::config::{Config, PluginConfig};
use crate::irc::{Command, Event, SessionState};
use crate::net::{Listener, Readiness};
use crate::plugin::{PluginManager, PluginWatcher};
use crate::server::Server;

/// How long shutdown waits for QUIT to reach the wire.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// Reason sent with QUIT on shutdown.
const QUIT_REASON: &str = "ircplugd shutting down";

/// Process-scoped daemon state.
pub struct Daemon {
    listener: Listener,
    connections: Vec<Connection>,
    plugins: PluginManager,
    /// Load parameters of every plugin the operator asked for, for hot
    /// reload of plugins whose last load failed.
    plugin_configs: HashMap<String, PluginConfig>,
    watcher: Option<PluginWatcher>,
    control: ControlHandle,
    requests: mpsc::Receiver<ControlRequest>,
    tick: Duration,
    gc_interval: Duration,
    last_gc: Instant,
    stopping: bool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("servers", &self.connections.len())
            .field("plugins", &self.plugins.names())
            .field("watching", &self.watcher.is_some())
            .field("stopping", &self.stopping)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the daemon from a validated configuration.
    ///
    /// Only failure to create the multiplexer is an error. Plugins that
    /// fail to load are logged and skipped.
    pub fn new(config: &Config) -> Result<Self> {
        let listener = Listener::new().context("Failed to create readiness multiplexer")?;
        let (control, requests) = control::channel(listener.notifier());
        let mut plugins = PluginManager::new();
        plugins.set_rules(config.rules.clone());

        let connections = config
            .servers
            .iter()
            .enumerate()
            .map(|(index, server_config)| {
                let server = Arc::new(Server::new(server_config.clone(), listener.notifier()));
                plugins.attach_server(Arc::clone(&server));
                Connection::new(server, Token(index))
            })
            .collect();

        let watcher = if config.watch_plugins {
            match PluginWatcher::new() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut daemon = Self {
            listener,
            connections,
            plugins,
            plugin_configs: HashMap::new(),
            watcher,
            control,
            requests,
            tick: config.tick(),
            gc_interval: config.gc_interval(),
            last_gc: Instant::now(),
            stopping: false,
        };

        for plugin in &config.plugins {
            if let Err(e) = daemon.load_plugin(plugin.clone()) {
                log::error!("{}", e);
            }
        }

        Ok(daemon)
    }

    /// Handle for queueing control requests from any thread.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// The plugin manager.
    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// Server `name`.
    pub fn server(&self, name: &str) -> Option<&Arc<Server>> {
        self.connections
            .iter()
            .map(Connection::server)
            .find(|server| server.name() == name)
    }

    /// Whether a shutdown was requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Start connecting to every server.
    pub fn start(&mut self) {
        let now = Instant::now();
        for index in 0..self.connections.len() {
            self.connect(index, now);
        }
    }

    /// Run until `shutdown` is set or a shutdown request arrives, then
    /// shut down cleanly.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        self.start();
        while !self.stopping && !shutdown.load(Ordering::SeqCst) {
            self.tick();
        }
        self.shutdown();
    }

    /// One loop iteration.
    pub fn tick(&mut self) {
        let wait = match self.listener.wait(self.tick) {
            Ok(wait) => wait,
            Err(e) => {
                log::warn!("Listener wait failed: {}", e);
                return;
            }
        };

        let now = Instant::now();
        for readiness in &wait.ready {
            self.handle_readiness(*readiness, now);
        }

        for index in 0..self.connections.len() {
            self.flush(index, now);
        }

        self.housekeeping(now);
    }

    fn handle_readiness(&mut self, readiness: Readiness, now: Instant) {
        let index = readiness.token.0;
        let Some(conn) = self.connections.get_mut(index) else {
            return;
        };

        if conn.state() == SessionState::Connecting {
            if let Err(e) = conn.finish_connect() {
                log::warn!("{}", e);
                self.lost(index, now);
                return;
            }
        }

        if !(readiness.readable || readiness.error) {
            return;
        }
        if !matches!(
            conn.state(),
            SessionState::Connected | SessionState::Closing
        ) {
            return;
        }

        let mut events = Vec::new();
        let result = conn.session_mut().read(&mut events);
        for event in events {
            self.handle_event(index, &event);
        }
        if let Err(e) = result {
            log::warn!("{}", e);
            self.lost(index, now);
        }
    }

    /// Internal bookkeeping for `event`, then plugin dispatch.
    fn handle_event(&mut self, index: usize, event: &Event) {
        let conn = &mut self.connections[index];
        let server = Arc::clone(conn.server());

        let reply = match event {
            Event::Ping { token } => Some(Command::Pong {
                token: token.clone(),
            }),
            Event::Connect => {
                log::info!("[{}] Registered as {}", server.name(), server.nickname());
                conn.join_configured();
                None
            }
            Event::Join { origin, channel } if server.is_self(&origin.nick) => {
                server.add_channel(channel);
                None
            }
            Event::Part {
                origin, channel, ..
            } if server.is_self(&origin.nick) => {
                server.remove_channel(channel);
                None
            }
            Event::Kick {
                channel, target, ..
            } if server.is_self(target) => {
                log::info!("[{}] Kicked from {}", server.name(), channel);
                server.remove_channel(channel);
                None
            }
            Event::Nick { origin, nickname } if server.is_self(&origin.nick) => {
                server.set_nickname(nickname);
                None
            }
            Event::Invite {
                channel, target, ..
            } if server.config().join_invite && server.is_self(target) => {
                Some(Command::Join {
                    channel: channel.clone(),
                    password: None,
                })
            }
            _ => None,
        };

        if let Some(command) = reply {
            if let Err(e) = conn.session_mut().queue(&command) {
                log::warn!("[{}] {}", server.name(), e);
            }
        }

        self.plugins.dispatch(&server, event);
    }

    fn flush(&mut self, index: usize, now: Instant) {
        let conn = &mut self.connections[index];
        conn.drain_queue();
        if let Err(e) = conn.session_mut().flush() {
            log::warn!("{}", e);
            self.lost(index, now);
        }
    }

    fn connect(&mut self, index: usize, now: Instant) {
        let conn = &mut self.connections[index];
        if let Err(e) = conn.connect(&self.listener) {
            log::warn!("{}", e);
            self.lost(index, now);
        }
    }

    fn lost(&mut self, index: usize, now: Instant) {
        let conn = &mut self.connections[index];
        let server = Arc::clone(conn.server());
        let listener = &self.listener;
        let was_connected = if self.stopping {
            conn.close(listener);
            conn.cancel_retry();
            false
        } else {
            conn.lost(listener, now)
        };
        if was_connected {
            self.plugins.dispatch(&server, &Event::Disconnect);
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request);
        }

        for index in 0..self.connections.len() {
            if self.connections[index].retry_due(now) {
                self.connect(index, now);
            }
        }

        let changed = self
            .watcher
            .as_ref()
            .map(PluginWatcher::poll_changes)
            .unwrap_or_default();
        for name in changed {
            self.hot_reload(&name);
        }

        if !self.gc_interval.is_zero() && now.duration_since(self.last_gc) >= self.gc_interval {
            self.plugins.collect_garbage();
            self.last_gc = now;
        }

        self.plugins.reap();
    }

    fn handle_request(&mut self, request: ControlRequest) {
        log::debug!("Control request: {:?}", request);
        let result = match request {
            ControlRequest::LoadPlugin(config) => self.load_plugin(config),
            ControlRequest::UnloadPlugin(name) => self.unload_plugin(&name),
            ControlRequest::ReloadPlugin(name) => self.plugins.reload(&name),
            ControlRequest::Shutdown => {
                self.stopping = true;
                Ok(())
            }
        };
        if let Err(e) = result {
            log::error!("{}", e);
        }
    }

    fn load_plugin(&mut self, config: PluginConfig) -> crate::error::Result<()> {
        if self.plugins.is_loaded(&config.name) || self.plugins.is_restarting(&config.name) {
            return Err(crate::error::Error::plugin_load(&config.name, "already loaded"));
        }
        self.plugin_configs
            .insert(config.name.clone(), config.clone());
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.add(&config.name, &config.path) {
                log::warn!("Cannot watch plugin {}: {:#}", config.name, e);
            }
        }
        self.plugins.load_with(&config)
    }

    fn unload_plugin(&mut self, name: &str) -> crate::error::Result<()> {
        self.plugin_configs.remove(name);
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.remove(name);
        }
        self.plugins.unload(name)
    }

    fn hot_reload(&mut self, name: &str) {
        if self.plugins.is_restarting(name) {
            log::debug!("Plugin {} changed again while restarting", name);
            return;
        }
        log::info!("Plugin {} changed on disk, reloading", name);
        let result = if self.plugins.is_loaded(name) {
            self.plugins.restart(name)
        } else if let Some(config) = self.plugin_configs.get(name) {
            self.plugins.load_with(config)
        } else {
            return;
        };
        if let Err(e) = result {
            log::error!("{}", e);
        }
    }

    /// Send QUIT everywhere, unload every plugin and revoke all handles.
    pub fn shutdown(&mut self) {
        self.stopping = true;
        log::info!("Shutting down");

        for conn in &mut self.connections {
            conn.drain_queue();
            if conn.state() == SessionState::Connected {
                let quit = Command::Quit {
                    reason: Some(QUIT_REASON.to_string()),
                };
                if let Err(e) = conn.session_mut().queue(&quit) {
                    log::debug!("{}", e);
                }
                conn.session_mut().begin_close();
                conn.sync_state();
            }
        }

        let deadline = Instant::now() + QUIT_GRACE;
        loop {
            let mut pending = false;
            for conn in &mut self.connections {
                match conn.session_mut().flush() {
                    Ok(done) => pending |= !done,
                    Err(e) => log::debug!("{}", e),
                }
            }
            let now = Instant::now();
            if !pending || now >= deadline {
                break;
            }
            if let Err(e) = self.listener.wait(deadline - now) {
                log::debug!("Listener wait failed: {}", e);
                break;
            }
        }

        for conn in &mut self.connections {
            conn.close(&self.listener);
            conn.cancel_retry();
        }

        self.plugins.shutdown();
        log::info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn config_without_servers() -> Config {
        Config::default()
    }

    #[test]
    fn test_new_with_missing_plugin_still_starts() {
        let mut config = config_without_servers();
        config
            .plugins
            .push(PluginConfig::new("ghost", "/nonexistent/ghost.lua"));

        let daemon = Daemon::new(&config).unwrap();
        assert!(daemon.plugins().names().is_empty());
    }

    #[test]
    fn test_control_shutdown_stops_run() {
        let mut daemon = Daemon::new(&config_without_servers()).unwrap();
        let control = daemon.control();
        assert!(control.shutdown());

        let flag = AtomicBool::new(false);
        daemon.run(&flag);
        assert!(daemon.is_stopping());
    }

    #[test]
    fn test_control_load_and_unload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.lua");
        std::fs::write(&path, "function onJoin() end").unwrap();

        let mut daemon = Daemon::new(&config_without_servers()).unwrap();
        let control = daemon.control();

        control.load_plugin("p", &path);
        daemon.tick();
        assert_eq!(daemon.plugins().names(), vec!["p"]);

        control.unload_plugin("p");
        daemon.tick();
        assert!(daemon.plugins().names().is_empty());
        daemon.shutdown();
    }

    #[test]
    fn test_duplicate_load_keeps_first_config() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("p.lua");
        let other_dir = dir.path().join("other");
        std::fs::create_dir(&other_dir).unwrap();
        let second = other_dir.join("p.lua");
        std::fs::write(&first, "").unwrap();
        std::fs::write(&second, "").unwrap();

        let mut config = config_without_servers();
        config.watch_plugins = true;
        let mut daemon = Daemon::new(&config).unwrap();

        daemon.load_plugin(PluginConfig::new("p", &first)).unwrap();
        let err = daemon
            .load_plugin(PluginConfig::new("p", &second))
            .unwrap_err();
        assert!(err.to_string().contains("already loaded"));
        assert_eq!(daemon.plugin_configs["p"].path, first);
        assert_eq!(daemon.plugins().plugin("p").unwrap().path(), &first);
        daemon.shutdown();
    }

    #[test]
    fn test_rules_reach_plugin_manager() {
        let mut config = config_without_servers();
        config
            .rules
            .push(crate::plugin::Rule::new(crate::plugin::RuleAction::Drop));
        let daemon = Daemon::new(&config).unwrap();
        assert_eq!(daemon.plugins().rules(), config.rules.as_slice());
    }

    #[test]
    fn test_unreachable_server_schedules_retry() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let mut config = config_without_servers();
        let mut server = ServerConfig::new("dead", "127.0.0.1", port, "bot");
        server.reconnect.delay_secs = 3600;
        config.servers.push(server);
        config.tick_ms = 20;

        let mut daemon = Daemon::new(&config).unwrap();
        daemon.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while daemon.connections[0].state() != SessionState::Disconnected {
            assert!(Instant::now() < deadline, "connect never failed");
            daemon.tick();
        }
        assert_eq!(
            daemon.server("dead").unwrap().state(),
            SessionState::Disconnected
        );
        assert!(!daemon.connections[0].retry_due(Instant::now()));
        daemon.shutdown();
    }
}
