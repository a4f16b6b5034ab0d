//! Event filtering rules.
//!
//! A rule selects events by server, channel, origin nickname, plugin and
//! handler name. An empty criterion matches anything. For every event and
//! plugin pair the rules are evaluated in order and the last matching rule
//! decides; with no match the event is delivered.
//!
//! ```json
//! "rules": [
//!   { "servers": ["libera"], "channels": ["#staff"], "action": "drop" },
//!   { "servers": ["libera"], "channels": ["#staff"], "plugins": ["ask"], "action": "accept" }
//! ]
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::irc::{Event, EventKind};

/// What a matching rule does with the event.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Deliver the event.
    Accept,
    /// Withhold the event from the plugin.
    Drop,
}

/// One filtering rule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    /// Server names.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub servers: BTreeSet<String>,
    /// Channel names.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub channels: BTreeSet<String>,
    /// Sender nicknames.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub origins: BTreeSet<String>,
    /// Plugin names.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub plugins: BTreeSet<String>,
    /// Handler names such as `onMessage`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub events: BTreeSet<String>,
    /// Outcome when the rule matches.
    pub action: RuleAction,
}

fn allows(set: &BTreeSet<String>, value: &str) -> bool {
    set.is_empty() || set.contains(value)
}

impl Rule {
    /// A rule matching everything.
    pub fn new(action: RuleAction) -> Self {
        Self {
            servers: BTreeSet::new(),
            channels: BTreeSet::new(),
            origins: BTreeSet::new(),
            plugins: BTreeSet::new(),
            events: BTreeSet::new(),
            action,
        }
    }

    /// Whether every non-empty criterion contains the given value.
    pub fn matches(&self, server: &str, event: &Event, plugin: &str) -> bool {
        allows(&self.servers, server)
            && allows(&self.channels, event.target())
            && allows(&self.origins, event.origin())
            && allows(&self.plugins, plugin)
            && allows(&self.events, event.kind().handler_name())
    }

    /// Reject event names no handler uses.
    pub fn validate(&self) -> Result<(), Error> {
        match self
            .events
            .iter()
            .find(|name| EventKind::from_handler_name(name).is_none())
        {
            Some(name) => Err(Error::Config(format!("rule names unknown event '{name}'"))),
            None => Ok(()),
        }
    }
}

/// Whether `event` from `server` should reach `plugin` under `rules`.
pub fn accepts(rules: &[Rule], server: &str, event: &Event, plugin: &str) -> bool {
    rules
        .iter()
        .filter(|rule| rule.matches(server, event, plugin))
        .last()
        .map_or(true, |rule| rule.action == RuleAction::Accept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::Origin;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn message(channel: &str) -> Event {
        Event::Message {
            origin: Origin::parse("alice!a@host"),
            channel: channel.into(),
            text: "hi".into(),
        }
    }

    #[test]
    fn test_no_rules_accepts() {
        assert!(accepts(&[], "local", &message("#a"), "p"));
    }

    #[test]
    fn test_empty_criteria_match_everything() {
        let drop_all = Rule::new(RuleAction::Drop);
        assert!(drop_all.matches("any", &Event::Connect, "p"));
        assert!(!accepts(&[drop_all], "local", &message("#a"), "p"));
    }

    #[test]
    fn test_last_match_wins() {
        let mut drop_staff = Rule::new(RuleAction::Drop);
        drop_staff.channels = set(&["#staff"]);
        let mut allow_ask = Rule::new(RuleAction::Accept);
        allow_ask.channels = set(&["#staff"]);
        allow_ask.plugins = set(&["ask"]);
        let rules = [drop_staff, allow_ask];

        assert!(!accepts(&rules, "local", &message("#staff"), "logger"));
        assert!(accepts(&rules, "local", &message("#staff"), "ask"));
        assert!(accepts(&rules, "local", &message("#public"), "logger"));
    }

    #[test]
    fn test_every_criterion_must_match() {
        let mut rule = Rule::new(RuleAction::Drop);
        rule.servers = set(&["libera"]);
        rule.origins = set(&["alice"]);
        rule.events = set(&["onMessage"]);

        assert!(rule.matches("libera", &message("#a"), "p"));
        assert!(!rule.matches("oftc", &message("#a"), "p"));
        assert!(!rule.matches(
            "libera",
            &Event::Join {
                origin: Origin::parse("alice!a@host"),
                channel: "#a".into()
            },
            "p"
        ));
    }

    #[test]
    fn test_parse_and_validate() {
        let rules: Vec<Rule> = serde_json::from_str(
            r##"[{ "channels": ["#a"], "events": ["onJoin"], "action": "drop" }]"##,
        )
        .unwrap();
        assert_eq!(rules[0].action, RuleAction::Drop);
        assert!(rules[0].servers.is_empty());
        rules[0].validate().unwrap();

        let mut bad = Rule::new(RuleAction::Accept);
        bad.events = set(&["onSomething"]);
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        assert!(serde_json::from_str::<Rule>(r#"{ "action": "maybe" }"#).is_err());
    }
}
