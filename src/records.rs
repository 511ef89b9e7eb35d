//! Editing of stored profiles, rules and saved commands from `key=value`
//! fields typed at the console.
//!
//! Values containing spaces are written in double quotes, `\"` inside quotes
//! is a literal quote:
//!
//! ```text
//! rule add name=alarm topic=sensors/# when=contains value=ERR reply=alerts payload="seen {{payload}}"
//! ```

use std::path::PathBuf;

use crate::automation::rule::{Rule, RuleScope, TriggerCondition};
use crate::commands::CommandConfig;
use crate::mqtt::config::{ConnectionId, ConnectionProfile, Qos, TlsSettings};

pub type Fields = Vec<(String, String)>;

pub const PROFILE_KEYS: &str = "name host port user pass client clean keepalive tls ca cert key";
pub const RULE_KEYS: &str = "name enabled topic when value reply payload qos retain delay conn";
pub const COMMAND_KEYS: &str = "name topic payload qos retain loop interval conn";

/// Splits `input` into `key=value` pairs.
pub fn split_fields(input: &str) -> Result<Fields, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err("dangling escape at end of input".to_string()),
            },
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("expected key=value, got '{token}'")),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(format!("{key} expects on or off, got '{value}'")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{key} expects a number, got '{value}'"))
}

fn parse_qos(value: &str) -> Result<Qos, String> {
    match value {
        "0" => Ok(Qos::AtMostOnce),
        "1" => Ok(Qos::AtLeastOnce),
        "2" => Ok(Qos::ExactlyOnce),
        _ => Err(format!("qos must be 0, 1 or 2, got '{value}'")),
    }
}

/// `all` or a connection id.
fn parse_scope(value: &str) -> Result<Option<ConnectionId>, String> {
    if value == "all" {
        Ok(None)
    } else {
        parse_number("conn", value).map(|id| Some(ConnectionId(id)))
    }
}

fn path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

fn unknown(key: &str, known: &str) -> String {
    format!("unknown field '{key}', expected one of: {known}")
}

pub fn apply_profile(profile: &mut ConnectionProfile, fields: &[(String, String)]) -> Result<(), String> {
    for (key, value) in fields {
        match key.as_str() {
            "name" => profile.name = value.clone(),
            "host" => profile.host = value.clone(),
            "port" => profile.port = parse_number(key, value)?,
            "user" => profile.username = value.clone(),
            "pass" => profile.password = value.clone(),
            "client" => profile.client_id = value.clone(),
            "clean" => profile.clean_session = parse_bool(key, value)?,
            "keepalive" => profile.keep_alive_secs = parse_number(key, value)?,
            "tls" => {
                if parse_bool(key, value)? {
                    profile.tls.get_or_insert_with(TlsSettings::default);
                } else {
                    profile.tls = None;
                }
            }
            "ca" => profile.tls.get_or_insert_with(TlsSettings::default).ca_cert_path = path(value),
            "cert" => profile.tls.get_or_insert_with(TlsSettings::default).client_cert_path = path(value),
            "key" => profile.tls.get_or_insert_with(TlsSettings::default).client_key_path = path(value),
            other => return Err(unknown(other, PROFILE_KEYS)),
        }
    }
    if profile.name.trim().is_empty() {
        return Err("a profile needs a name".to_string());
    }
    if profile.host.trim().is_empty() {
        return Err("a profile needs a host".to_string());
    }
    Ok(())
}

pub fn apply_rule(rule: &mut Rule, fields: &[(String, String)]) -> Result<(), String> {
    for (key, value) in fields {
        match key.as_str() {
            "name" => rule.name = value.clone(),
            "enabled" => rule.enabled = parse_bool(key, value)?,
            "topic" => rule.trigger_topic = value.clone(),
            "when" => rule.condition = TriggerCondition::parse(value),
            "value" => rule.condition_value = value.clone(),
            "reply" => rule.response_topic = value.clone(),
            "payload" => rule.response_payload = value.clone(),
            "qos" => rule.response_qos = parse_qos(value)?,
            "retain" => rule.response_retain = parse_bool(key, value)?,
            "delay" => rule.delay_ms = parse_number(key, value)?,
            "conn" => {
                rule.scope = match parse_scope(value)? {
                    Some(id) => RuleScope::Connection(id),
                    None => RuleScope::All,
                }
            }
            other => return Err(unknown(other, RULE_KEYS)),
        }
    }
    if rule.response_topic.trim().is_empty() {
        return Err("a rule needs a reply topic".to_string());
    }
    Ok(())
}

pub fn apply_command(command: &mut CommandConfig, fields: &[(String, String)]) -> Result<(), String> {
    for (key, value) in fields {
        match key.as_str() {
            "name" => command.name = value.clone(),
            "topic" => command.topic = value.clone(),
            "payload" => command.payload = value.clone(),
            "qos" => command.qos = parse_qos(value)?,
            "retain" => command.retain = parse_bool(key, value)?,
            "loop" => command.loop_enabled = parse_bool(key, value)?,
            "interval" => command.loop_interval_ms = parse_number(key, value)?,
            "conn" => command.connection_id = parse_scope(value)?,
            other => return Err(unknown(other, COMMAND_KEYS)),
        }
    }
    if command.topic.trim().is_empty() {
        return Err("a command needs a topic".to_string());
    }
    Ok(())
}
