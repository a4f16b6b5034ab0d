//! Outbound protocol actions and their wire rendering.
//!
//! Rendering never truncates. A command whose line (CRLF included) would
//! exceed [`MAX_LINE_LEN`] is rejected with [`Error::CommandTooLong`], and a
//! parameter carrying CR, LF or NUL is rejected with
//! [`Error::InvalidCommand`]. Either way nothing reaches the socket.

use crate::constants::MAX_LINE_LEN;
use crate::error::{Error, Result};

/// One outbound action awaiting transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `PASS <password>`
    Pass {
        /// Connection password.
        password: String,
    },
    /// `NICK <nickname>`
    Nick {
        /// Requested nickname.
        nickname: String,
    },
    /// `USER <username> 0 * :<realname>`
    User {
        /// Ident username.
        username: String,
        /// Free-form real name.
        realname: String,
    },
    /// `JOIN <channel> [<key>]`
    Join {
        /// Channel to join.
        channel: String,
        /// Channel key, if the channel requires one.
        password: Option<String>,
    },
    /// `PART <channel> [:<reason>]`
    Part {
        /// Channel to leave.
        channel: String,
        /// Optional part message.
        reason: Option<String>,
    },
    /// `PRIVMSG <target> :<text>`
    Privmsg {
        /// Channel or nickname.
        target: String,
        /// Message body.
        text: String,
    },
    /// `NOTICE <target> :<text>`
    Notice {
        /// Channel or nickname.
        target: String,
        /// Notice body.
        text: String,
    },
    /// CTCP ACTION sent as `PRIVMSG <target> :\x01ACTION <text>\x01`
    Me {
        /// Channel or nickname.
        target: String,
        /// Action text.
        text: String,
    },
    /// `INVITE <target> <channel>`
    Invite {
        /// Nickname to invite.
        target: String,
        /// Channel to invite to.
        channel: String,
    },
    /// `KICK <channel> <target> [:<reason>]`
    Kick {
        /// Channel to kick from.
        channel: String,
        /// Nickname to kick.
        target: String,
        /// Optional reason.
        reason: Option<String>,
    },
    /// `MODE <target> <mode> [args...]`
    Mode {
        /// Channel or own nickname.
        target: String,
        /// Mode string such as `+o`.
        mode: String,
        /// Mode arguments.
        args: Vec<String>,
    },
    /// `NAMES <channel>`
    Names {
        /// Channel to list.
        channel: String,
    },
    /// `TOPIC <channel> [:<topic>]`; without a topic this queries it.
    Topic {
        /// Channel.
        channel: String,
        /// New topic.
        topic: Option<String>,
    },
    /// `WHOIS <target>`
    Whois {
        /// Nickname to look up.
        target: String,
    },
    /// `PONG :<token>`
    Pong {
        /// Token echoed from the matching PING.
        token: String,
    },
    /// `QUIT [:<reason>]`
    Quit {
        /// Optional quit message.
        reason: Option<String>,
    },
    /// A pre-formatted line, sent as-is after validation.
    Raw(String),
}

impl Command {
    /// Protocol verb this command renders to.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Pass { .. } => "PASS",
            Self::Nick { .. } => "NICK",
            Self::User { .. } => "USER",
            Self::Join { .. } => "JOIN",
            Self::Part { .. } => "PART",
            Self::Privmsg { .. } | Self::Me { .. } => "PRIVMSG",
            Self::Notice { .. } => "NOTICE",
            Self::Invite { .. } => "INVITE",
            Self::Kick { .. } => "KICK",
            Self::Mode { .. } => "MODE",
            Self::Names { .. } => "NAMES",
            Self::Topic { .. } => "TOPIC",
            Self::Whois { .. } => "WHOIS",
            Self::Pong { .. } => "PONG",
            Self::Quit { .. } => "QUIT",
            Self::Raw(_) => "RAW",
        }
    }

    /// Render to wire bytes, CRLF included.
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut line = LineWriter::new(self.verb());

        match self {
            Self::Pass { password } => line.middle(password)?,
            Self::Nick { nickname } => line.middle(nickname)?,
            Self::User { username, realname } => {
                line.middle(username)?;
                line.middle("0")?;
                line.middle("*")?;
                line.trailing(realname)?;
            }
            Self::Join { channel, password } => {
                line.middle(channel)?;
                if let Some(key) = password {
                    line.middle(key)?;
                }
            }
            Self::Part { channel, reason } => {
                line.middle(channel)?;
                if let Some(reason) = reason {
                    line.trailing(reason)?;
                }
            }
            Self::Privmsg { target, text } | Self::Notice { target, text } => {
                line.middle(target)?;
                line.trailing(text)?;
            }
            Self::Me { target, text } => {
                line.middle(target)?;
                line.trailing(&format!("\x01ACTION {text}\x01"))?;
            }
            Self::Invite { target, channel } => {
                line.middle(target)?;
                line.middle(channel)?;
            }
            Self::Kick {
                channel,
                target,
                reason,
            } => {
                line.middle(channel)?;
                line.middle(target)?;
                if let Some(reason) = reason {
                    line.trailing(reason)?;
                }
            }
            Self::Mode { target, mode, args } => {
                line.middle(target)?;
                line.middle(mode)?;
                for arg in args {
                    line.middle(arg)?;
                }
            }
            Self::Names { channel } => line.middle(channel)?,
            Self::Topic { channel, topic } => {
                line.middle(channel)?;
                if let Some(topic) = topic {
                    line.trailing(topic)?;
                }
            }
            Self::Whois { target } => line.middle(target)?,
            Self::Pong { token } => line.trailing(token)?,
            Self::Quit { reason } => {
                if let Some(reason) = reason {
                    line.trailing(reason)?;
                }
            }
            Self::Raw(raw) => {
                check_framing(raw)?;
                if raw.trim().is_empty() {
                    return Err(Error::InvalidCommand("empty raw line".into()));
                }
                line = LineWriter {
                    buf: raw.clone(),
                };
            }
        }

        line.finish()
    }
}

/// Incremental builder for one wire line.
struct LineWriter {
    buf: String,
}

impl LineWriter {
    fn new(verb: &str) -> Self {
        Self {
            buf: verb.to_string(),
        }
    }

    /// Append a space-separated parameter.
    fn middle(&mut self, param: &str) -> Result<()> {
        check_framing(param)?;
        if param.is_empty() || param.starts_with(':') || param.contains(' ') {
            return Err(Error::InvalidCommand(format!(
                "parameter {param:?} cannot appear before the last position"
            )));
        }
        self.buf.push(' ');
        self.buf.push_str(param);
        Ok(())
    }

    /// Append the final, colon-prefixed parameter.
    fn trailing(&mut self, text: &str) -> Result<()> {
        check_framing(text)?;
        self.buf.push_str(" :");
        self.buf.push_str(text);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        let len = self.buf.len() + 2;
        if len > MAX_LINE_LEN {
            return Err(Error::CommandTooLong { len });
        }
        self.buf.push_str("\r\n");
        Ok(self.buf.into_bytes())
    }
}

fn check_framing(param: &str) -> Result<()> {
    if let Some(bad) = param.bytes().find(|b| matches!(b, b'\r' | b'\n' | 0)) {
        return Err(Error::InvalidCommand(format!(
            "parameter contains forbidden byte 0x{bad:02x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(cmd: Command) -> String {
        String::from_utf8(cmd.render().unwrap()).unwrap()
    }

    #[test]
    fn test_render_privmsg() {
        let cmd = Command::Privmsg {
            target: "#rust".into(),
            text: "hello world".into(),
        };
        assert_eq!(rendered(cmd), "PRIVMSG #rust :hello world\r\n");
    }

    #[test]
    fn test_render_me_wraps_ctcp_action() {
        let cmd = Command::Me {
            target: "#rust".into(),
            text: "waves".into(),
        };
        assert_eq!(rendered(cmd), "PRIVMSG #rust :\x01ACTION waves\x01\r\n");
    }

    #[test]
    fn test_render_registration() {
        assert_eq!(
            rendered(Command::Nick {
                nickname: "bot".into()
            }),
            "NICK bot\r\n"
        );
        assert_eq!(
            rendered(Command::User {
                username: "bot".into(),
                realname: "IRC Bot".into()
            }),
            "USER bot 0 * :IRC Bot\r\n"
        );
    }

    #[test]
    fn test_render_optional_parts() {
        assert_eq!(
            rendered(Command::Part {
                channel: "#a".into(),
                reason: None
            }),
            "PART #a\r\n"
        );
        assert_eq!(
            rendered(Command::Kick {
                channel: "#a".into(),
                target: "eve".into(),
                reason: Some("spam".into())
            }),
            "KICK #a eve :spam\r\n"
        );
        assert_eq!(
            rendered(Command::Join {
                channel: "#secret".into(),
                password: Some("key".into())
            }),
            "JOIN #secret key\r\n"
        );
        assert_eq!(rendered(Command::Quit { reason: None }), "QUIT\r\n");
    }

    #[test]
    fn test_render_mode_with_args() {
        let cmd = Command::Mode {
            target: "#a".into(),
            mode: "+o".into(),
            args: vec!["alice".into()],
        };
        assert_eq!(rendered(cmd), "MODE #a +o alice\r\n");
    }

    #[test]
    fn test_render_empty_trailing_allowed() {
        let cmd = Command::Topic {
            channel: "#a".into(),
            topic: Some(String::new()),
        };
        assert_eq!(rendered(cmd), "TOPIC #a :\r\n");
    }

    #[test]
    fn test_render_exactly_at_limit() {
        // "PRIVMSG #a :" is 12 bytes, plus CRLF leaves 498 for the text.
        let cmd = Command::Privmsg {
            target: "#a".into(),
            text: "x".repeat(498),
        };
        assert_eq!(cmd.render().unwrap().len(), MAX_LINE_LEN);
    }

    #[test]
    fn test_render_too_long_rejected() {
        let cmd = Command::Privmsg {
            target: "#a".into(),
            text: "x".repeat(499),
        };
        match cmd.render() {
            Err(Error::CommandTooLong { len }) => assert_eq!(len, 513),
            other => panic!("expected CommandTooLong, got {other:?}"),
        }
    }

    #[test]
    fn test_render_rejects_line_breaks() {
        let cmd = Command::Privmsg {
            target: "#a".into(),
            text: "hi\r\nQUIT".into(),
        };
        assert!(matches!(cmd.render(), Err(Error::InvalidCommand(_))));

        let raw = Command::Raw("PRIVMSG #a :x\0y".into());
        assert!(matches!(raw.render(), Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn test_render_rejects_spaced_middle() {
        let cmd = Command::Join {
            channel: "#a b".into(),
            password: None,
        };
        assert!(matches!(cmd.render(), Err(Error::InvalidCommand(_))));

        let cmd = Command::Nick {
            nickname: String::new(),
        };
        assert!(matches!(cmd.render(), Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn test_render_raw_as_is() {
        assert_eq!(
            rendered(Command::Raw("CAP LS 302".into())),
            "CAP LS 302\r\n"
        );
        assert!(Command::Raw("  ".into()).render().is_err());
    }
}
