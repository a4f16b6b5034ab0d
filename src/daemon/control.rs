//! Operator requests delivered to a running daemon.

use std::path::PathBuf;
use std::sync::mpsc;

use crate::config::PluginConfig;
use crate::net::Notifier;

/// An operator action for the daemon loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Load a plugin.
    LoadPlugin(PluginConfig),
    /// Unload a plugin by name.
    UnloadPlugin(String),
    /// Call a plugin's `onReload`.
    ReloadPlugin(String),
    /// Stop the daemon.
    Shutdown,
}

/// Cloneable, thread-safe sender of [`ControlRequest`]s.
///
/// Every request wakes the daemon so it is handled on the current tick.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
    notifier: Notifier,
}

/// Create a handle and the receiving end the daemon polls.
pub(crate) fn channel(notifier: Notifier) -> (ControlHandle, mpsc::Receiver<ControlRequest>) {
    let (tx, rx) = mpsc::channel();
    (ControlHandle { tx, notifier }, rx)
}

impl ControlHandle {
    /// Queue `request`. Returns false if the daemon is gone.
    pub fn send(&self, request: ControlRequest) -> bool {
        if self.tx.send(request).is_err() {
            return false;
        }
        self.notifier.notify();
        true
    }

    /// Request loading `path` as plugin `name`.
    pub fn load_plugin(&self, name: &str, path: impl Into<PathBuf>) -> bool {
        self.send(ControlRequest::LoadPlugin(PluginConfig::new(name, path)))
    }

    /// Request unloading plugin `name`.
    pub fn unload_plugin(&self, name: &str) -> bool {
        self.send(ControlRequest::UnloadPlugin(name.to_string()))
    }

    /// Request calling plugin `name`'s `onReload`.
    pub fn reload_plugin(&self, name: &str) -> bool {
        self.send(ControlRequest::ReloadPlugin(name.to_string()))
    }

    /// Request a clean shutdown.
    pub fn shutdown(&self) -> bool {
        self.send(ControlRequest::Shutdown)
    }
}
