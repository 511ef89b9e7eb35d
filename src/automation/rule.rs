use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use super::topic::TopicFilter;
use crate::mqtt::config::{ConnectionId, Qos};

/// Stored in place of a connection id for rules that apply everywhere.
pub const ALL_CONNECTIONS: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleScope {
    All,
    Connection(ConnectionId),
}

impl RuleScope {
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            RuleScope::All
        } else {
            RuleScope::Connection(ConnectionId(raw))
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            RuleScope::All => ALL_CONNECTIONS,
            RuleScope::Connection(id) => id.0,
        }
    }

    pub fn applies_to(self, connection_id: ConnectionId) -> bool {
        match self {
            RuleScope::All => true,
            RuleScope::Connection(id) => id == connection_id,
        }
    }
}

/// Predicate kind of a rule, decided when the record is read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    Any,
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Regex,
    /// Kept verbatim so the record round-trips; never matches
    Unknown(String),
}

impl TriggerCondition {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "any" => TriggerCondition::Any,
            "contains" => TriggerCondition::Contains,
            "equals" => TriggerCondition::Equals,
            "startsWith" => TriggerCondition::StartsWith,
            "endsWith" => TriggerCondition::EndsWith,
            "regex" => TriggerCondition::Regex,
            other => TriggerCondition::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TriggerCondition::Any => "any",
            TriggerCondition::Contains => "contains",
            TriggerCondition::Equals => "equals",
            TriggerCondition::StartsWith => "startsWith",
            TriggerCondition::EndsWith => "endsWith",
            TriggerCondition::Regex => "regex",
            TriggerCondition::Unknown(kind) => kind,
        }
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator-defined trigger/response automation record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Empty matches every topic
    pub trigger_topic: String,
    pub condition: TriggerCondition,
    pub condition_value: String,
    pub response_topic: String,
    pub response_payload: String,
    pub response_qos: Qos,
    pub response_retain: bool,
    pub delay_ms: i64,
    pub scope: RuleScope,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            id: -1,
            name: String::new(),
            enabled: true,
            trigger_topic: String::new(),
            condition: TriggerCondition::Any,
            condition_value: String::new(),
            response_topic: String::new(),
            response_payload: String::new(),
            response_qos: Qos::AtMostOnce,
            response_retain: false,
            delay_ms: 0,
            scope: RuleScope::All,
        }
    }
}

/// Payload predicate ready for evaluation.
#[derive(Clone, Debug)]
pub enum Condition {
    Any,
    Contains(String),
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Regex),
    Never,
}

impl Condition {
    pub fn matches(&self, payload: &str) -> bool {
        match self {
            Condition::Any => true,
            Condition::Contains(value) => payload.contains(value.as_str()),
            Condition::Equals(value) => payload == value,
            Condition::StartsWith(value) => payload.starts_with(value.as_str()),
            Condition::EndsWith(value) => payload.ends_with(value.as_str()),
            Condition::Regex(regex) => regex.is_match(payload),
            Condition::Never => false,
        }
    }
}

/// A rule with its topic filter and predicate built once.
#[derive(Clone, Debug)]
pub struct CompiledRule {
    pub rule: Rule,
    topic: Option<TopicFilter>,
    condition: Condition,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> Self {
        let topic = if rule.trigger_topic.is_empty() {
            None
        } else {
            Some(TopicFilter::parse(&rule.trigger_topic))
        };

        let value = rule.condition_value.clone();
        let condition = match &rule.condition {
            TriggerCondition::Any => Condition::Any,
            TriggerCondition::Contains => Condition::Contains(value),
            TriggerCondition::Equals => Condition::Equals(value),
            TriggerCondition::StartsWith => Condition::StartsWith(value),
            TriggerCondition::EndsWith => Condition::EndsWith(value),
            TriggerCondition::Regex => match Regex::new(&value) {
                Ok(regex) => Condition::Regex(regex),
                Err(e) => {
                    warn!(rule = %rule.name, pattern = %value, "Invalid regex, rule disabled: {}", e);
                    Condition::Never
                }
            },
            TriggerCondition::Unknown(kind) => {
                warn!(rule = %rule.name, kind = %kind, "Unknown trigger condition, rule never matches");
                Condition::Never
            }
        };

        Self {
            rule,
            topic,
            condition,
        }
    }

    pub fn matches(&self, topic: &str, payload: &str) -> bool {
        if let Some(filter) = &self.topic {
            if !filter.matches(topic) {
                return false;
            }
        }
        self.condition.matches(payload)
    }

    /// `None` publishes immediately.
    pub fn delay(&self) -> Option<Duration> {
        if self.rule.delay_ms > 0 {
            Some(Duration::from_millis(self.rule.delay_ms as u64))
        } else {
            None
        }
    }
}
