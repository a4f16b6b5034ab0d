//! The `Server` class exposed to plugin scripts.
//!
//! Every handler receives the server the event came from as its first
//! argument. Query methods raise a Lua error once the server is gone;
//! sending methods never raise and instead return `true` or `nil, err`:
//!
//! ```lua
//! function onCommand(server, origin, channel, text)
//!     local ok, err = server:say(channel, util.splituser(origin) .. ": " .. text)
//!     if not ok then log.warn(err) end
//! end
//! ```

use mlua::prelude::*;

use crate::bridge::{Bridge, Native, NativeClass, Value};
use crate::error::{Error, Result};
use crate::irc::Command;
use crate::server::Server;

/// Result of a sending method as seen from Lua.
type Sent = (Option<bool>, Option<String>);

/// Positional arguments of a sending method, converted by the bridge.
struct Args(std::vec::IntoIter<Value>);

impl Args {
    fn convert(lua: &Lua, raw: LuaMultiValue) -> Result<Self> {
        let bridge = Bridge::of(lua)?;
        let values = raw
            .iter()
            .map(|value| bridge.to_native(value))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(values.into_iter()))
    }

    /// Next argument as text. Numbers are accepted the way Lua would
    /// coerce them.
    fn optional(&mut self, name: &str) -> Result<Option<String>> {
        match self.0.next() {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text)),
            Some(Value::Int(i)) => Ok(Some(i.to_string())),
            Some(Value::Double(d)) => Ok(Some(d.to_string())),
            Some(other) => Err(Error::BridgeConversion(format!(
                "argument '{name}' must be a string, got {}",
                other.type_name()
            ))),
        }
    }

    fn text(&mut self, name: &str) -> Result<String> {
        self.optional(name)?
            .ok_or_else(|| Error::BridgeConversion(format!("missing argument '{name}'")))
    }

    fn rest(mut self, name: &str) -> Result<Vec<String>> {
        let mut values = Vec::new();
        while let Some(value) = self.optional(name)? {
            values.push(value);
        }
        Ok(values)
    }
}

/// Convert the arguments, build the command and queue it on the server.
fn submit(
    lua: &Lua,
    this: &Native<Server>,
    raw: LuaMultiValue,
    build: impl FnOnce(Args) -> Result<Command>,
) -> Sent {
    let outcome = Args::convert(lua, raw)
        .and_then(build)
        .and_then(|command| this.resolve()?.send(command));
    match outcome {
        Ok(()) => (Some(true), None),
        Err(e) => {
            log::debug!("Plugin command rejected: {e}");
            (None, Some(e.to_string()))
        }
    }
}

impl NativeClass for Server {
    const NAME: &'static str = "Server";

    fn describe(&self) -> String {
        self.name().to_string()
    }

    fn add_methods<M: LuaUserDataMethods<Native<Self>>>(methods: &mut M) {
        methods.add_method("name", |_, this, ()| Ok(this.get()?.name().to_string()));

        methods.add_method("nickname", |_, this, ()| Ok(this.get()?.nickname()));

        methods.add_method("channels", |_, this, ()| Ok(this.get()?.channels()));

        methods.add_method("state", |_, this, ()| Ok(this.get()?.state().code()));

        methods.add_method("info", |lua, this, ()| {
            let server = this.get()?;
            let config = server.config();
            let info = lua.create_table()?;
            info.set("name", server.name())?;
            info.set("host", config.host.as_str())?;
            info.set("port", config.port)?;
            info.set("nickname", server.nickname())?;
            info.set("username", config.effective_username())?;
            info.set("realname", config.effective_realname())?;
            info.set("command_char", server.command_char())?;
            info.set("channels", server.channels())?;
            Ok(info)
        });

        methods.add_method("say", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Privmsg {
                    target: args.text("target")?,
                    text: args.text("text")?,
                })
            }))
        });

        methods.add_method("notice", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Notice {
                    target: args.text("target")?,
                    text: args.text("text")?,
                })
            }))
        });

        methods.add_method("cnotice", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Notice {
                    target: args.text("channel")?,
                    text: args.text("text")?,
                })
            }))
        });

        methods.add_method("me", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Me {
                    target: args.text("target")?,
                    text: args.text("text")?,
                })
            }))
        });

        methods.add_method("join", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Join {
                    channel: args.text("channel")?,
                    password: args.optional("password")?,
                })
            }))
        });

        methods.add_method("part", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Part {
                    channel: args.text("channel")?,
                    reason: args.optional("reason")?,
                })
            }))
        });

        methods.add_method("kick", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                let target = args.text("target")?;
                Ok(Command::Kick {
                    channel: args.text("channel")?,
                    target,
                    reason: args.optional("reason")?,
                })
            }))
        });

        methods.add_method("invite", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Invite {
                    target: args.text("target")?,
                    channel: args.text("channel")?,
                })
            }))
        });

        methods.add_method("mode", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Mode {
                    target: args.text("channel")?,
                    mode: args.text("mode")?,
                    args: args.rest("argument")?,
                })
            }))
        });

        methods.add_method("umode", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Mode {
                    target: this.resolve()?.nickname(),
                    mode: args.text("mode")?,
                    args: Vec::new(),
                })
            }))
        });

        methods.add_method("names", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Names {
                    channel: args.text("channel")?,
                })
            }))
        });

        methods.add_method("nick", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Nick {
                    nickname: args.text("nickname")?,
                })
            }))
        });

        methods.add_method("topic", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Topic {
                    channel: args.text("channel")?,
                    topic: Some(args.text("topic")?),
                })
            }))
        });

        methods.add_method("whois", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Whois {
                    target: args.text("target")?,
                })
            }))
        });

        methods.add_method("send", |lua, this, raw: LuaMultiValue| {
            Ok(submit(lua, this, raw, |mut args| {
                Ok(Command::Raw(args.text("line")?))
            }))
        });
    }
}
