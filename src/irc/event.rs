//! Inbound protocol events.
//!
//! Events are immutable values. A session produces them from wire lines and
//! the daemon hands them to plugin workers over a channel; each worker turns
//! the fields into script arguments with [`Event::args`].

use std::fmt;

use super::message::Origin;
use crate::bridge::Value;

/// Reply data gathered from a WHOIS numeric sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoisInfo {
    /// Nickname queried.
    pub nick: String,
    /// Username.
    pub user: String,
    /// Hostname.
    pub host: String,
    /// Real name.
    pub realname: String,
    /// Channels the user is in, mode prefixes stripped.
    pub channels: Vec<String>,
}

/// One inbound protocol occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Registration completed (`001`).
    Connect,
    /// The connection was lost or closed.
    Disconnect,
    /// Channel message.
    Message {
        /// Sender.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Message text.
        text: String,
    },
    /// Channel message addressed to one plugin via the command character.
    Command {
        /// Sender.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Text after the plugin name.
        text: String,
    },
    /// Private message.
    Query {
        /// Sender.
        origin: Origin,
        /// Message text.
        text: String,
    },
    /// Private message addressed to one plugin via the command character.
    QueryCommand {
        /// Sender.
        origin: Origin,
        /// Text after the plugin name.
        text: String,
    },
    /// CTCP ACTION (`/me`).
    Me {
        /// Sender.
        origin: Origin,
        /// Channel or own nickname.
        target: String,
        /// Action text.
        text: String,
    },
    /// Notice addressed to us.
    Notice {
        /// Sender.
        origin: Origin,
        /// Notice text.
        text: String,
    },
    /// Notice addressed to a channel.
    ChannelNotice {
        /// Sender.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Notice text.
        text: String,
    },
    /// Someone (possibly us) joined a channel.
    Join {
        /// Joining user.
        origin: Origin,
        /// Channel.
        channel: String,
    },
    /// Someone (possibly us) left a channel.
    Part {
        /// Leaving user.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Part message, empty if none.
        reason: String,
    },
    /// Topic changed.
    Topic {
        /// User who changed it.
        origin: Origin,
        /// Channel.
        channel: String,
        /// New topic.
        topic: String,
    },
    /// Nickname changed.
    Nick {
        /// Old identity.
        origin: Origin,
        /// New nickname.
        nickname: String,
    },
    /// Someone was kicked.
    Kick {
        /// Kicker.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Kicked nickname.
        target: String,
        /// Reason, empty if none.
        reason: String,
    },
    /// We were invited to a channel.
    Invite {
        /// Inviter.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Invited nickname (normally ours).
        target: String,
    },
    /// Channel mode change.
    Mode {
        /// User who set the mode.
        origin: Origin,
        /// Channel.
        channel: String,
        /// Mode string.
        mode: String,
        /// Mode arguments.
        args: Vec<String>,
    },
    /// User mode change on our own nickname.
    UserMode {
        /// Origin of the change.
        origin: Origin,
        /// Mode string.
        mode: String,
    },
    /// Complete NAMES listing for a channel.
    Names {
        /// Channel.
        channel: String,
        /// Nicknames, mode prefixes stripped.
        names: Vec<String>,
    },
    /// Complete WHOIS reply.
    Whois(WhoisInfo),
    /// Server keep-alive. Answered by the daemon.
    Ping {
        /// Token to echo back.
        token: String,
    },
}

/// Event discriminant, used for handler bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// [`Event::Connect`]
    Connect,
    /// [`Event::Disconnect`]
    Disconnect,
    /// [`Event::Message`]
    Message,
    /// [`Event::Command`]
    Command,
    /// [`Event::Query`]
    Query,
    /// [`Event::QueryCommand`]
    QueryCommand,
    /// [`Event::Me`]
    Me,
    /// [`Event::Notice`]
    Notice,
    /// [`Event::ChannelNotice`]
    ChannelNotice,
    /// [`Event::Join`]
    Join,
    /// [`Event::Part`]
    Part,
    /// [`Event::Topic`]
    Topic,
    /// [`Event::Nick`]
    Nick,
    /// [`Event::Kick`]
    Kick,
    /// [`Event::Invite`]
    Invite,
    /// [`Event::Mode`]
    Mode,
    /// [`Event::UserMode`]
    UserMode,
    /// [`Event::Names`]
    Names,
    /// [`Event::Whois`]
    Whois,
    /// [`Event::Ping`]
    Ping,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 20] = [
        Self::Connect,
        Self::Disconnect,
        Self::Message,
        Self::Command,
        Self::Query,
        Self::QueryCommand,
        Self::Me,
        Self::Notice,
        Self::ChannelNotice,
        Self::Join,
        Self::Part,
        Self::Topic,
        Self::Nick,
        Self::Kick,
        Self::Invite,
        Self::Mode,
        Self::UserMode,
        Self::Names,
        Self::Whois,
        Self::Ping,
    ];

    /// Name of the global script function handling this kind.
    pub fn handler_name(self) -> &'static str {
        match self {
            Self::Connect => "onConnect",
            Self::Disconnect => "onDisconnect",
            Self::Message => "onMessage",
            Self::Command => "onCommand",
            Self::Query => "onQuery",
            Self::QueryCommand => "onQueryCommand",
            Self::Me => "onMe",
            Self::Notice => "onNotice",
            Self::ChannelNotice => "onChannelNotice",
            Self::Join => "onJoin",
            Self::Part => "onPart",
            Self::Topic => "onTopic",
            Self::Nick => "onNick",
            Self::Kick => "onKick",
            Self::Invite => "onInvite",
            Self::Mode => "onMode",
            Self::UserMode => "onUserMode",
            Self::Names => "onNames",
            Self::Whois => "onWhois",
            Self::Ping => "onPing",
        }
    }
}

impl EventKind {
    /// Kind handled by the global function `name`.
    pub fn from_handler_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.handler_name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.handler_name()[2..])
    }
}

impl Event {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Disconnect => EventKind::Disconnect,
            Self::Message { .. } => EventKind::Message,
            Self::Command { .. } => EventKind::Command,
            Self::Query { .. } => EventKind::Query,
            Self::QueryCommand { .. } => EventKind::QueryCommand,
            Self::Me { .. } => EventKind::Me,
            Self::Notice { .. } => EventKind::Notice,
            Self::ChannelNotice { .. } => EventKind::ChannelNotice,
            Self::Join { .. } => EventKind::Join,
            Self::Part { .. } => EventKind::Part,
            Self::Topic { .. } => EventKind::Topic,
            Self::Nick { .. } => EventKind::Nick,
            Self::Kick { .. } => EventKind::Kick,
            Self::Invite { .. } => EventKind::Invite,
            Self::Mode { .. } => EventKind::Mode,
            Self::UserMode { .. } => EventKind::UserMode,
            Self::Names { .. } => EventKind::Names,
            Self::Whois(_) => EventKind::Whois,
            Self::Ping { .. } => EventKind::Ping,
        }
    }

    /// Nickname of the sender, or `""` for events without one.
    pub fn origin(&self) -> &str {
        self.origin_full().map_or("", |o| o.nick.as_str())
    }

    /// Full sender identity, if the event has one.
    pub fn origin_full(&self) -> Option<&Origin> {
        match self {
            Self::Message { origin, .. }
            | Self::Command { origin, .. }
            | Self::Query { origin, .. }
            | Self::QueryCommand { origin, .. }
            | Self::Me { origin, .. }
            | Self::Notice { origin, .. }
            | Self::ChannelNotice { origin, .. }
            | Self::Join { origin, .. }
            | Self::Part { origin, .. }
            | Self::Topic { origin, .. }
            | Self::Nick { origin, .. }
            | Self::Kick { origin, .. }
            | Self::Invite { origin, .. }
            | Self::Mode { origin, .. }
            | Self::UserMode { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Channel or target the event concerns, or `""`.
    pub fn target(&self) -> &str {
        match self {
            Self::Message { channel, .. }
            | Self::Command { channel, .. }
            | Self::ChannelNotice { channel, .. }
            | Self::Join { channel, .. }
            | Self::Part { channel, .. }
            | Self::Topic { channel, .. }
            | Self::Kick { channel, .. }
            | Self::Invite { channel, .. }
            | Self::Mode { channel, .. }
            | Self::Names { channel, .. } => channel,
            Self::Me { target, .. } => target,
            Self::Whois(info) => &info.nick,
            _ => "",
        }
    }

    /// Handler arguments after the server handle.
    ///
    /// The origin is passed in full (`nick!user@host`); scripts split it
    /// with `util.splituser` and `util.splithost`.
    pub fn args(&self) -> Vec<Value> {
        let origin = Value::from(self.origin_full().map(ToString::to_string).unwrap_or_default());
        match self {
            Self::Connect | Self::Disconnect => Vec::new(),
            Self::Message { channel, text, .. }
            | Self::Command { channel, text, .. }
            | Self::ChannelNotice { channel, text, .. } => {
                vec![origin, channel.as_str().into(), text.as_str().into()]
            }
            Self::Query { text, .. } | Self::QueryCommand { text, .. } | Self::Notice { text, .. } => {
                vec![origin, text.as_str().into()]
            }
            Self::Me { target, text, .. } => {
                vec![origin, target.as_str().into(), text.as_str().into()]
            }
            Self::Join { channel, .. } => vec![origin, channel.as_str().into()],
            Self::Part {
                channel, reason, ..
            } => vec![origin, channel.as_str().into(), reason.as_str().into()],
            Self::Topic { channel, topic, .. } => {
                vec![origin, channel.as_str().into(), topic.as_str().into()]
            }
            Self::Nick { nickname, .. } => vec![origin, nickname.as_str().into()],
            Self::Kick {
                channel,
                target,
                reason,
                ..
            } => vec![
                origin,
                channel.as_str().into(),
                target.as_str().into(),
                reason.as_str().into(),
            ],
            Self::Invite {
                channel, target, ..
            } => vec![origin, channel.as_str().into(), target.as_str().into()],
            Self::Mode {
                channel,
                mode,
                args,
                ..
            } => vec![
                origin,
                channel.as_str().into(),
                mode.as_str().into(),
                Value::from(args.clone()),
            ],
            Self::UserMode { mode, .. } => vec![origin, mode.as_str().into()],
            Self::Names { channel, names } => {
                vec![channel.as_str().into(), Value::from(names.clone())]
            }
            Self::Whois(info) => vec![
                info.nick.as_str().into(),
                info.user.as_str().into(),
                info.host.as_str().into(),
                info.realname.as_str().into(),
                Value::from(info.channels.clone()),
            ],
            Self::Ping { token } => vec![token.as_str().into()],
        }
    }
}
