//! Per-connection protocol state machine.
//!
//! A [`Session`] owns one transport, the partial-line input buffer and the
//! outbound byte buffer. It turns received bytes into [`Event`]s and
//! queued [`Command`]s into wire bytes. It never decides when to reconnect;
//! on a transport error it drops to [`SessionState::Disconnected`] and waits
//! for the daemon.

use std::collections::HashMap;
use std::io;

use super::command::Command;
use super::event::{Event, WhoisInfo};
use super::message::{Message, Origin};
use crate::constants::{MAX_INPUT_LINE, MAX_PENDING_REPLIES, MAX_REPLY_ENTRIES, READ_CHUNK};
use crate::error::{Error, Result};
use crate::net::Transport;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport attached.
    Disconnected,
    /// TCP handshake in progress.
    Connecting,
    /// Transport established; bytes flow both ways.
    Connected,
    /// QUIT queued; waiting for the outbox to drain.
    Closing,
}

impl SessionState {
    /// Stable integer code, exposed to scripts as `irc.state`.
    pub fn code(self) -> i64 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Closing => 3,
        }
    }

    /// Name used in logs and scripts.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
        }
    }

    /// All states in code order.
    pub const ALL: [SessionState; 4] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Closing,
    ];
}

/// Protocol session for one server.
pub struct Session {
    server: String,
    transport: Option<Box<dyn Transport>>,
    state: SessionState,
    inbuf: Vec<u8>,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
    outbuf: Vec<u8>,
    names: HashMap<String, Vec<String>>,
    whois: HashMap<String, WhoisInfo>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("state", &self.state)
            .field("buffered_in", &self.inbuf.len())
            .field("buffered_out", &self.outbuf.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session for `server`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            transport: None,
            state: SessionState::Disconnected,
            inbuf: Vec::new(),
            discarding: false,
            outbuf: Vec::new(),
            names: HashMap::new(),
            whois: HashMap::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attach a freshly connecting transport. Resets all buffers.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.reset_buffers();
        self.transport = Some(transport);
        self.state = SessionState::Connecting;
    }

    /// The attached transport, for (de)registration with the listener.
    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Close and drop the transport. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.reset_buffers();
        self.state = SessionState::Disconnected;
    }

    /// Mark the session as closing after a QUIT was queued.
    pub fn begin_close(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Closing;
        }
    }

    fn reset_buffers(&mut self) {
        self.inbuf.clear();
        self.outbuf.clear();
        self.discarding = false;
        self.names.clear();
        self.whois.clear();
    }

    /// Check a pending connect.
    ///
    /// Returns `Ok(true)` once connected. On failure the session is
    /// disconnected and the error returned.
    pub fn finish_connect(&mut self) -> Result<bool> {
        if self.state != SessionState::Connecting {
            return Ok(self.state == SessionState::Connected);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Ok(false);
        };
        match transport.finish_connect() {
            Ok(true) => {
                self.state = SessionState::Connected;
                log::info!("[{}] Connected", self.server);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.disconnect();
                Err(Error::transport(&self.server, e))
            }
        }
    }

    /// Render a command to wire bytes without queueing it.
    ///
    /// Fails with `CommandTooLong` past 512 bytes and `InvalidCommand` on
    /// CR, LF or NUL in a parameter.
    pub fn render(&self, command: &Command) -> Result<Vec<u8>> {
        command.render()
    }

    /// Render and append a command to the outbox.
    ///
    /// A command that fails to render leaves the outbox untouched.
    pub fn queue(&mut self, command: &Command) -> Result<()> {
        let bytes = self.render(command)?;
        log::trace!(
            "[{}] >> {}",
            self.server,
            String::from_utf8_lossy(&bytes).trim_end()
        );
        self.outbuf.extend_from_slice(&bytes);
        Ok(())
    }

    /// Whether the outbox holds unsent bytes.
    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Write as much of the outbox as the socket accepts.
    ///
    /// Returns `Ok(true)` when the outbox is empty afterwards. A write error
    /// disconnects the session.
    pub fn flush(&mut self) -> Result<bool> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(self.outbuf.is_empty());
        };
        if !matches!(self.state, SessionState::Connected | SessionState::Closing) {
            return Ok(self.outbuf.is_empty());
        }

        while !self.outbuf.is_empty() {
            match transport.send(&self.outbuf) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "connection closed");
                    self.disconnect();
                    return Err(Error::transport(&self.server, err));
                }
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(Error::transport(&self.server, e));
                }
            }
        }
        Ok(true)
    }

    /// Read until the socket would block, appending parsed events to `events`.
    ///
    /// Events parsed before an error or EOF are kept in `events`. EOF and
    /// read errors disconnect the session and return `Transport`.
    pub fn read(&mut self, events: &mut Vec<Event>) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Ok(());
            };
            match transport.recv(&mut chunk) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                    self.disconnect();
                    return Err(Error::transport(&self.server, err));
                }
                Ok(n) => events.extend(self.feed(&chunk[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(Error::transport(&self.server, e));
                }
            }
        }
    }

    /// Consume raw bytes and return the events of every completed line.
    ///
    /// The unterminated tail is kept for the next call, so splitting a
    /// byte stream differently never changes the resulting events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.inbuf.extend_from_slice(head);
            let line = std::mem::take(&mut self.inbuf);
            if line.len() > MAX_INPUT_LINE {
                log::debug!("[{}] Dropping {} byte line", self.server, line.len());
                continue;
            }
            self.handle_line(&line, &mut events);
        }

        if !self.discarding {
            self.inbuf.extend_from_slice(rest);
            if self.inbuf.len() > MAX_INPUT_LINE {
                log::debug!("[{}] Dropping over-long partial line", self.server);
                self.inbuf.clear();
                self.discarding = true;
            }
        }

        events
    }

    fn handle_line(&mut self, raw: &[u8], events: &mut Vec<Event>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(|&b| b == b' ') {
            return;
        }
        let Ok(line) = std::str::from_utf8(raw) else {
            log::debug!("[{}] Skipping line with invalid UTF-8", self.server);
            return;
        };
        log::trace!("[{}] << {}", self.server, line);

        match Message::parse(line) {
            Ok(msg) => self.translate(msg, events),
            Err(e) => log::debug!("[{}] {}", self.server, e),
        }
    }

    fn translate(&mut self, msg: Message, events: &mut Vec<Event>) {
        let Message {
            origin,
            command,
            mut params,
        } = msg;
        let mut take = |i: usize| params.get_mut(i).map(std::mem::take).unwrap_or_default();

        let event = match command.as_str() {
            "001" => Some(Event::Connect),
            "PING" => Some(Event::Ping { token: take(0) }),
            "JOIN" => Some(Event::Join {
                origin,
                channel: take(0),
            }),
            "PART" => Some(Event::Part {
                origin,
                channel: take(0),
                reason: take(1),
            }),
            "TOPIC" => Some(Event::Topic {
                origin,
                channel: take(0),
                topic: take(1),
            }),
            "NICK" => Some(Event::Nick {
                origin,
                nickname: take(0),
            }),
            "KICK" => Some(Event::Kick {
                origin,
                channel: take(0),
                target: take(1),
                reason: take(2),
            }),
            "INVITE" => {
                let target = take(0);
                Some(Event::Invite {
                    origin,
                    channel: take(1),
                    target,
                })
            }
            "MODE" => {
                let target = take(0);
                let mode = take(1);
                if is_channel(&target) {
                    let args = params.drain(2.min(params.len())..).collect();
                    Some(Event::Mode {
                        origin,
                        channel: target,
                        mode,
                        args,
                    })
                } else {
                    Some(Event::UserMode { origin, mode })
                }
            }
            "PRIVMSG" => {
                let target = take(0);
                let text = take(1);
                Some(privmsg_event(origin, target, text))
            }
            "NOTICE" => {
                let target = take(0);
                let text = take(1);
                if is_channel(&target) {
                    Some(Event::ChannelNotice {
                        origin,
                        channel: target,
                        text,
                    })
                } else {
                    Some(Event::Notice { origin, text })
                }
            }
            // RPL_NAMREPLY: <me> <type> <channel> :<names>
            "353" => {
                let channel = take(2);
                let names = take(3);
                if !self.names.contains_key(&channel) && self.names.len() >= MAX_PENDING_REPLIES {
                    log::debug!("[{}] Too many pending NAMES, dropping {}", self.server, channel);
                } else {
                    let list = self.names.entry(channel).or_default();
                    let room = MAX_REPLY_ENTRIES.saturating_sub(list.len());
                    list.extend(
                        names
                            .split_whitespace()
                            .take(room)
                            .map(|n| strip_prefix_modes(n).to_string()),
                    );
                }
                None
            }
            // RPL_ENDOFNAMES: <me> <channel> :End of /NAMES list
            "366" => {
                let channel = take(1);
                let names = self.names.remove(&channel).unwrap_or_default();
                Some(Event::Names { channel, names })
            }
            // RPL_WHOISUSER: <me> <nick> <user> <host> * :<realname>
            "311" => {
                let nick = take(1);
                if !self.whois.contains_key(&nick) && self.whois.len() >= MAX_PENDING_REPLIES {
                    log::debug!("[{}] Too many pending WHOIS, dropping {}", self.server, nick);
                } else {
                    let info = WhoisInfo {
                        nick: nick.clone(),
                        user: take(2),
                        host: take(3),
                        realname: take(5),
                        channels: Vec::new(),
                    };
                    self.whois.insert(nick, info);
                }
                None
            }
            // RPL_WHOISCHANNELS: <me> <nick> :<channels>
            "319" => {
                let nick = take(1);
                let channels = take(2);
                if let Some(info) = self.whois.get_mut(&nick) {
                    let room = MAX_REPLY_ENTRIES.saturating_sub(info.channels.len());
                    info.channels.extend(
                        channels
                            .split_whitespace()
                            .take(room)
                            .map(|c| strip_prefix_modes(c).to_string()),
                    );
                }
                None
            }
            // RPL_ENDOFWHOIS: <me> <nick> :End of /WHOIS list
            "318" => {
                let nick = take(1);
                self.whois.remove(&nick).map(Event::Whois)
            }
            "ERROR" => {
                log::warn!("[{}] Server error: {}", self.server, take(0));
                None
            }
            _ => None,
        };

        if let Some(event) = event {
            events.push(event);
        }
    }
}

/// Classify a PRIVMSG by target and CTCP framing.
fn privmsg_event(origin: Origin, target: String, text: String) -> Event {
    if let Some(action) = text
        .strip_prefix("\x01ACTION")
        .map(|rest| rest.strip_suffix('\x01').unwrap_or(rest))
    {
        return Event::Me {
            origin,
            target,
            text: action.strip_prefix(' ').unwrap_or(action).to_string(),
        };
    }
    if is_channel(&target) {
        Event::Message {
            origin,
            channel: target,
            text,
        }
    } else {
        Event::Query { origin, text }
    }
}

/// Whether `target` names a channel rather than a user.
pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

fn strip_prefix_modes(name: &str) -> &str {
    name.trim_start_matches(['~', '&', '@', '%', '+'])
}
