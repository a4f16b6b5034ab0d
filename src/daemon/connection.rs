//! One server connection as driven by the daemon loop.
//!
//! Couples the plugin-visible [`Server`] with the [`Session`] that owns the
//! socket, and carries the reconnection bookkeeping.

use std::sync::Arc;
use std::time::Instant;

use mio::{Interest, Token};

use crate::error::{Error, Result};
use crate::irc::{Command, Session, SessionState};
use crate::net::{Listener, TcpTransport};
use crate::server::Server;

/// Network-thread state of one server.
#[derive(Debug)]
pub struct Connection {
    server: Arc<Server>,
    session: Session,
    token: Token,
    /// Consecutive failed attempts since the last successful connect.
    tries: u32,
    /// When the next connect attempt is due.
    retry_at: Option<Instant>,
}

impl Connection {
    /// Wrap `server`, registering future transports under `token`.
    pub fn new(server: Arc<Server>, token: Token) -> Self {
        let session = Session::new(server.name());
        Self {
            server,
            session,
            token,
            tries: 0,
            retry_at: None,
        }
    }

    /// The shared server state.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// The protocol session.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Listener token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Start a non-blocking connect and register the socket.
    pub fn connect(&mut self, listener: &Listener) -> Result<()> {
        self.retry_at = None;
        let config = self.server.config();
        let mut transport = TcpTransport::connect(&config.host, config.port)
            .map_err(|e| Error::transport(self.server.name(), e))?;
        listener
            .register(
                &mut transport,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(|e| Error::transport(self.server.name(), e))?;

        log::info!(
            "[{}] Connecting to {}:{}",
            self.server.name(),
            config.host,
            config.port
        );
        self.session.attach(Box::new(transport));
        self.sync_state();
        Ok(())
    }

    /// Check a pending connect. On success the registration commands are
    /// queued and the retry counter resets.
    pub fn finish_connect(&mut self) -> Result<bool> {
        if self.session.state() != SessionState::Connecting {
            return Ok(false);
        }
        let connected = self.session.finish_connect()?;
        if connected {
            self.tries = 0;
            self.sync_state();
            self.register()?;
        }
        Ok(connected)
    }

    fn register(&mut self) -> Result<()> {
        let config = self.server.config();
        if let Some(password) = &config.password {
            self.session.queue(&Command::Pass {
                password: password.clone(),
            })?;
        }
        self.session.queue(&Command::Nick {
            nickname: config.nickname.clone(),
        })?;
        self.session.queue(&Command::User {
            username: config.effective_username().to_string(),
            realname: config.effective_realname().to_string(),
        })
    }

    /// Join every configured channel.
    pub fn join_configured(&mut self) {
        for channel in &self.server.config().channels {
            let join = Command::Join {
                channel: channel.name.clone(),
                password: channel.password.clone(),
            };
            if let Err(e) = self.session.queue(&join) {
                log::warn!("[{}] Cannot join {}: {}", self.server.name(), channel.name, e);
            }
        }
    }

    /// Move everything plugins queued into the session outbox.
    ///
    /// Commands drained while not connected are dropped.
    pub fn drain_queue(&mut self) {
        let commands = self.server.queue().drain_all();
        if commands.is_empty() {
            return;
        }
        if !matches!(
            self.session.state(),
            SessionState::Connected | SessionState::Closing
        ) {
            log::debug!(
                "[{}] Dropping {} commands while disconnected",
                self.server.name(),
                commands.len()
            );
            return;
        }
        for command in &commands {
            if let Err(e) = self.session.queue(command) {
                log::warn!("[{}] Dropping {}: {}", self.server.name(), command.verb(), e);
            }
        }
    }

    /// Tear the transport down and schedule the next attempt if the
    /// reconnect policy allows one.
    ///
    /// Returns true if the session had been connected.
    pub fn lost(&mut self, listener: &Listener, now: Instant) -> bool {
        // The session may already have dropped its transport; the server
        // still holds the last synced state.
        let was_connected = matches!(
            self.server.state(),
            SessionState::Connected | SessionState::Closing
        );
        self.close(listener);
        self.retry_at = None;

        let policy = &self.server.config().reconnect;
        if !policy.enabled {
            log::info!("[{}] Reconnect disabled", self.server.name());
        } else if policy.max_tries != 0 && self.tries >= policy.max_tries {
            log::warn!(
                "[{}] Giving up after {} attempts",
                self.server.name(),
                self.tries
            );
        } else {
            self.tries += 1;
            self.retry_at = Some(now + policy.delay());
            log::info!(
                "[{}] Reconnecting in {:?} (attempt {})",
                self.server.name(),
                policy.delay(),
                self.tries
            );
        }
        was_connected
    }

    /// Whether a reconnect attempt is due at `now`.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.session.state() == SessionState::Disconnected
            && self.retry_at.is_some_and(|at| at <= now)
    }

    /// Deregister and close the transport without scheduling a retry.
    pub fn close(&mut self, listener: &Listener) {
        if let Some(transport) = self.session.transport_mut() {
            if let Err(e) = listener.deregister(transport) {
                log::debug!("[{}] Deregister failed: {}", self.server.name(), e);
            }
        }
        self.session.disconnect();
        self.sync_state();
    }

    /// Cancel any scheduled reconnect.
    pub fn cancel_retry(&mut self) {
        self.retry_at = None;
    }

    /// Copy the session state to the plugin-visible server.
    pub fn sync_state(&self) {
        if self.server.state() != self.session.state() {
            self.server.set_state(self.session.state());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::net::Notifier;
    use std::time::Duration;

    fn connection(reconnect_tries: u32) -> Connection {
        let mut config = ServerConfig::new("local", "127.0.0.1", 6667, "bot");
        config.reconnect.max_tries = reconnect_tries;
        config.reconnect.delay_secs = 5;
        Connection::new(
            Arc::new(Server::new(config, Notifier::disabled())),
            Token(0),
        )
    }

    #[test]
    fn test_lost_schedules_retry_until_max_tries() {
        let listener = Listener::new().unwrap();
        let mut conn = connection(2);
        let now = Instant::now();

        assert!(!conn.lost(&listener, now));
        assert!(!conn.retry_due(now));
        assert!(conn.retry_due(now + Duration::from_secs(5)));

        conn.lost(&listener, now);
        conn.lost(&listener, now);
        assert!(!conn.retry_due(now + Duration::from_secs(60)), "gave up");
    }

    #[test]
    fn test_drain_while_disconnected_drops_commands() {
        let mut conn = connection(0);
        conn.server()
            .send(Command::Nick {
                nickname: "other".into(),
            })
            .unwrap();
        conn.drain_queue();
        assert!(conn.server().queue().is_empty());
        assert!(!conn.session_mut().has_pending_output());
    }
}
