//! Configuration loading.
//!
//! The daemon reads one JSON document describing the servers to connect to
//! and the plugins to load. Location priority:
//!
//! 1. `--config PATH` on the command line
//! 2. `IRCPLUGD_CONFIG` env var
//! 3. Platform config dir (`~/.config/ircplugd/config.json` on Linux)
//!
//! Env overrides are applied after the file is read.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COMMAND_CHAR, DEFAULT_GC_INTERVAL, DEFAULT_PORT, DEFAULT_RECONNECT_DELAY, DEFAULT_TICK,
};
use crate::error::Error;
use crate::plugin::Rule;

/// Top-level daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Servers to connect to.
    pub servers: Vec<ServerConfig>,
    /// Plugins loaded at startup.
    pub plugins: Vec<PluginConfig>,
    /// Upper bound on one multiplexer wait, in milliseconds.
    pub tick_ms: u64,
    /// Seconds between Lua garbage collection sweeps.
    pub gc_interval_secs: u64,
    /// Reload plugins when their files change.
    pub watch_plugins: bool,
    /// Event filtering rules, evaluated in order.
    pub rules: Vec<Rule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            plugins: Vec::new(),
            tick_ms: duration_millis(DEFAULT_TICK),
            gc_interval_secs: DEFAULT_GC_INTERVAL.as_secs(),
            watch_plugins: false,
            rules: Vec::new(),
        }
    }
}

/// One IRC server connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Unique identifier used by scripts and logs.
    pub name: String,
    /// Hostname or address.
    pub host: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Nickname to register with.
    pub nickname: String,
    /// Ident username; defaults to the nickname.
    #[serde(default)]
    pub username: String,
    /// Real name; defaults to the nickname.
    #[serde(default)]
    pub realname: String,
    /// Connection password sent with PASS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Channels joined after registration.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Prefix for plugin commands, e.g. `!` in `!weather paris`.
    #[serde(default = "default_command_char")]
    pub command_char: String,
    /// Join channels we are invited to.
    #[serde(default)]
    pub join_invite: bool,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ServerConfig {
    /// Minimal configuration, mostly for tests and `ircplugd config`.
    pub fn new(name: &str, host: &str, port: u16, nickname: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            nickname: nickname.to_string(),
            username: String::new(),
            realname: String::new(),
            password: None,
            channels: Vec::new(),
            command_char: default_command_char(),
            join_invite: false,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Username, falling back to the nickname.
    pub fn effective_username(&self) -> &str {
        if self.username.is_empty() {
            &self.nickname
        } else {
            &self.username
        }
    }

    /// Real name, falling back to the nickname.
    pub fn effective_realname(&self) -> &str {
        if self.realname.is_empty() {
            &self.nickname
        } else {
            &self.realname
        }
    }
}

/// A channel to join, with an optional key.
///
/// Accepts either `"#chan"` or `{ "name": "#chan", "password": "key" }`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "ChannelRepr")]
pub struct ChannelConfig {
    /// Channel name.
    pub name: String,
    /// Channel key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        password: Option<String>,
    },
}

impl From<ChannelRepr> for ChannelConfig {
    fn from(repr: ChannelRepr) -> Self {
        match repr {
            ChannelRepr::Name(name) => Self {
                name,
                password: None,
            },
            ChannelRepr::Full { name, password } => Self { name, password },
        }
    }
}

/// How a dropped connection is retried.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Attempts before giving up; 0 retries forever.
    pub max_tries: u32,
    /// Seconds between attempts.
    pub delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tries: 0,
            delay_secs: DEFAULT_RECONNECT_DELAY.as_secs(),
        }
    }
}

impl ReconnectConfig {
    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// A plugin to load at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PluginConfig {
    /// Plugin name, used for the command character and control requests.
    pub name: String,
    /// Path to the Lua file. Relative paths resolve against the config file.
    pub path: PathBuf,
    /// Options exposed to the script as `plugin.config`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PluginConfig {
    /// A plugin with no options.
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            options: BTreeMap::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_command_char() -> String {
    DEFAULT_COMMAND_CHAR.to_string()
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ircplugd")
            .join("config.json"))
    }

    /// Resolve which file to read.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = env::var("IRCPLUGD_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Self::default_path()
    }

    /// Load, apply env overrides, and validate.
    ///
    /// A missing file at the default location yields an empty configuration;
    /// an explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else if explicit.is_some() {
            anyhow::bail!("Config file not found: {}", path.display());
        } else {
            log::warn!("No config file at {}, starting empty", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read and parse one file. Relative plugin paths are resolved against
    /// the file's directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if let Some(base) = path.parent() {
            for plugin in &mut config.plugins {
                if plugin.path.is_relative() {
                    plugin.path = base.join(&plugin.path);
                }
            }
        }
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(tick) = lookup("IRCPLUGD_TICK_MS") {
            match tick.parse::<u64>() {
                Ok(ms) => self.tick_ms = ms,
                Err(_) => log::warn!("Ignoring invalid IRCPLUGD_TICK_MS={}", tick),
            }
        }

        if let Some(gc) = lookup("IRCPLUGD_GC_INTERVAL") {
            match gc.parse::<u64>() {
                Ok(secs) => self.gc_interval_secs = secs,
                Err(_) => log::warn!("Ignoring invalid IRCPLUGD_GC_INTERVAL={}", gc),
            }
        }

        if let Some(watch) = lookup("IRCPLUGD_WATCH_PLUGINS") {
            self.watch_plugins = matches!(watch.as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Check names, hosts, ports and nicknames.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::Config("server with empty name".into()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(Error::Config(format!("duplicate server '{}'", server.name)));
            }
            if server.host.trim().is_empty() {
                return Err(Error::Config(format!("server '{}' has no host", server.name)));
            }
            if server.port == 0 {
                return Err(Error::Config(format!("server '{}' has port 0", server.name)));
            }
            if !is_valid_nickname(&server.nickname) {
                return Err(Error::Config(format!(
                    "server '{}' has invalid nickname '{}'",
                    server.name, server.nickname
                )));
            }
            if server.command_char.is_empty() || server.command_char.contains(' ') {
                return Err(Error::Config(format!(
                    "server '{}' has invalid command_char",
                    server.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() || plugin.name.contains(char::is_whitespace) {
                return Err(Error::Config(format!("invalid plugin name '{}'", plugin.name)));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(Error::Config(format!("duplicate plugin '{}'", plugin.name)));
            }
        }

        for rule in &self.rules {
            rule.validate()?;
        }

        if self.tick_ms == 0 {
            return Err(Error::Config("tick_ms must be positive".into()));
        }
        Ok(())
    }

    /// Multiplexer wait bound.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// GC sweep interval. Zero disables the sweep.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// RFC 2812 nickname check: letter or special first, then letters, digits,
/// specials and `-`.
pub fn is_valid_nickname(nick: &str) -> bool {
    let special = |c: char| "[]\\`_^{|}".contains(c);
    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || special(c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
        "servers": [{
            "name": "local",
            "host": "127.0.0.1",
            "nickname": "bot",
            "channels": ["#a", { "name": "#b", "password": "key" }]
        }],
        "plugins": [{ "name": "hello", "path": "hello.lua", "options": { "greeting": "hi" } }],
        "rules": [{ "channels": ["#b"], "plugins": ["hello"], "action": "drop" }],
        "tick_ms": 100
    }"##;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.tick(), DEFAULT_TICK);
        assert_eq!(config.gc_interval(), DEFAULT_GC_INTERVAL);
        assert!(!config.watch_plugins);
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.tick_ms, 100);
        assert_eq!(config.gc_interval_secs, DEFAULT_GC_INTERVAL.as_secs());

        let server = &config.servers[0];
        assert_eq!(server.port, DEFAULT_PORT);
        assert_eq!(server.command_char, "!");
        assert_eq!(server.effective_username(), "bot");
        assert!(server.reconnect.enabled);
        assert_eq!(
            server.channels,
            vec![
                ChannelConfig {
                    name: "#a".into(),
                    password: None
                },
                ChannelConfig {
                    name: "#b".into(),
                    password: Some("key".into())
                },
            ]
        );

        assert_eq!(config.plugins[0].options["greeting"], "hi");
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].action, crate::plugin::RuleAction::Drop);
        config.validate().unwrap();
    }

    #[test]
    fn test_relative_plugin_paths_resolve_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.plugins[0].path, dir.path().join("hello.lua"));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "IRCPLUGD_TICK_MS" => Some("50".into()),
            "IRCPLUGD_GC_INTERVAL" => Some("not-a-number".into()),
            "IRCPLUGD_WATCH_PLUGINS" => Some("true".into()),
            _ => None,
        });
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.gc_interval(), DEFAULT_GC_INTERVAL);
        assert!(config.watch_plugins);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_fields() {
        let mut config = Config::default();
        config.servers.push(ServerConfig::new("a", "h", 6667, "bot"));
        config.servers.push(ServerConfig::new("a", "h", 6667, "bot"));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.servers.push(ServerConfig::new("a", " ", 6667, "bot"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.servers.push(ServerConfig::new("a", "h", 0, "bot"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.servers.push(ServerConfig::new("a", "h", 6667, "9bot"));
        assert!(config.validate().is_err());

        let config = Config::from_json(r#"{ "rules": [{ "events": ["onBogus"], "action": "drop" }] }"#)
            .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_nickname_rules() {
        assert!(is_valid_nickname("bot"));
        assert!(is_valid_nickname("[bot]-2"));
        assert!(!is_valid_nickname(""));
        assert!(!is_valid_nickname("-bot"));
        assert!(!is_valid_nickname("b ot"));
    }
}
