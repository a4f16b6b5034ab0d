//! Shared per-server state.
//!
//! A [`Server`] is the part of a connection that plugins may touch: the
//! immutable configuration, a live snapshot (nickname, joined channels,
//! session state) written only by the network thread, and the
//! [`CommandQueue`]. The protocol session itself stays with the daemon.

pub mod queue;

use std::collections::BTreeSet;
use std::sync::RwLock;

pub use queue::CommandQueue;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::irc::{Command, SessionState};
use crate::net::Notifier;

#[derive(Debug)]
struct Live {
    nickname: String,
    channels: BTreeSet<String>,
    state: SessionState,
}

/// An IRC server as seen by plugins.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    live: RwLock<Live>,
    queue: CommandQueue,
}

impl Server {
    /// Create the shared state for `config`, waking `notifier` on enqueue.
    pub fn new(config: ServerConfig, notifier: Notifier) -> Self {
        let live = Live {
            nickname: config.nickname.clone(),
            channels: BTreeSet::new(),
            state: SessionState::Disconnected,
        };
        Self {
            config,
            live: RwLock::new(live),
            queue: CommandQueue::new(notifier),
        }
    }

    /// Unique server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Construction parameters.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Prefix that turns a message into a plugin command.
    pub fn command_char(&self) -> &str {
        &self.config.command_char
    }

    /// Current nickname.
    pub fn nickname(&self) -> String {
        self.live.read().expect("Server state lock poisoned").nickname.clone()
    }

    /// Channels we are currently in, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.live
            .read()
            .expect("Server state lock poisoned")
            .channels
            .iter()
            .cloned()
            .collect()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.live.read().expect("Server state lock poisoned").state
    }

    /// The outbound queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Validate and queue a command.
    ///
    /// The command is rendered once here so `CommandTooLong` and
    /// `InvalidCommand` reach the caller instead of being dropped later by
    /// the daemon.
    pub fn send(&self, command: Command) -> Result<()> {
        command.render()?;
        self.queue.enqueue(command);
        Ok(())
    }

    // Mutators below are called by the network thread only.

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut live = self.live.write().expect("Server state lock poisoned");
        live.state = state;
        if state == SessionState::Disconnected {
            live.channels.clear();
            live.nickname.clone_from(&self.config.nickname);
        }
    }

    pub(crate) fn set_nickname(&self, nickname: &str) {
        self.live
            .write()
            .expect("Server state lock poisoned")
            .nickname = nickname.to_string();
    }

    pub(crate) fn add_channel(&self, channel: &str) {
        self.live
            .write()
            .expect("Server state lock poisoned")
            .channels
            .insert(channel.to_string());
    }

    pub(crate) fn remove_channel(&self, channel: &str) {
        self.live
            .write()
            .expect("Server state lock poisoned")
            .channels
            .remove(channel);
    }

    /// Whether `nick` is our own nickname (case-insensitive).
    pub fn is_self(&self, nick: &str) -> bool {
        self.live
            .read()
            .expect("Server state lock poisoned")
            .nickname
            .eq_ignore_ascii_case(nick)
    }
}
