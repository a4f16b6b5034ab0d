//! Raw IRC line parsing.
//!
//! Splits one line (terminator already removed) into prefix, verb and
//! parameters:
//!
//! ```text
//! [@tags SP] [:prefix SP] VERB *( SP param ) [ SP :trailing ]
//! ```
//!
//! Message tags are accepted and dropped.

use std::fmt;

use crate::error::{Error, Result};

/// Source of a message, parsed from `nick!user@host`.
///
/// Server-originated messages carry only a host-like name; it ends up in
/// `nick` because that is what scripts print.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// Nickname (or server name).
    pub nick: String,
    /// Username, empty if absent.
    pub user: String,
    /// Hostname, empty if absent.
    pub host: String,
}

impl Origin {
    /// Parse a prefix without its leading colon.
    pub fn parse(prefix: &str) -> Self {
        let (nick_user, host) = match prefix.split_once('@') {
            Some((left, host)) => (left, host),
            None => (prefix, ""),
        };
        let (nick, user) = match nick_user.split_once('!') {
            Some((nick, user)) => (nick, user),
            None => (nick_user, ""),
        };
        Self {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }

    /// True when no prefix was present.
    pub fn is_empty(&self) -> bool {
        self.nick.is_empty() && self.user.is_empty() && self.host.is_empty()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nick)?;
        if !self.user.is_empty() {
            write!(f, "!{}", self.user)?;
        }
        if !self.host.is_empty() {
            write!(f, "@{}", self.host)?;
        }
        Ok(())
    }
}

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender, empty when the line had no prefix.
    pub origin: Origin,
    /// Verb or three-digit numeric, uppercased.
    pub command: String,
    /// Middle parameters followed by the trailing one, if any.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a single line. The line terminator must already be stripped.
    pub fn parse(line: &str) -> Result<Self> {
        let mut rest = line.trim_start_matches(' ');

        if let Some(tagged) = rest.strip_prefix('@') {
            rest = match tagged.split_once(' ') {
                Some((_, after)) => after.trim_start_matches(' '),
                None => return Err(Error::ProtocolParse(format!("tags without command: {line:?}"))),
            };
        }

        let mut origin = Origin::default();
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (prefix, after) = prefixed
                .split_once(' ')
                .ok_or_else(|| Error::ProtocolParse(format!("prefix without command: {line:?}")))?;
            origin = Origin::parse(prefix);
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() || !command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::ProtocolParse(format!("bad command in {line:?}")));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            origin,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Parameter at `index`, or `""` if absent.
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map_or("", String::as_str)
    }
}
