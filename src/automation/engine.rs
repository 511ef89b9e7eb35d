//! Rule evaluation against the inbound traffic of one bound session.

use chrono::Local;
use tracing::{debug, info, warn};

use super::rule::{CompiledRule, Rule};
use super::template;
use crate::mqtt::config::ConnectionId;
use crate::session::session::SessionLink;

struct Binding {
    link: SessionLink,
    rules: Vec<CompiledRule>,
}

/// Turns inbound messages into templated responses.
///
/// The engine is bound to at most one session at a time. Rebinding replaces
/// the session and rule set in one step; responses already scheduled keep
/// their own link and check connectivity when they fire.
#[derive(Default)]
pub struct AutomationEngine {
    binding: Option<Binding>,
}

impl AutomationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds to `link`, keeping the enabled rules that apply to its connection.
    /// Rules are evaluated in the order given.
    pub fn bind(&mut self, link: SessionLink, rules: Vec<Rule>) {
        let connection_id = link.connection_id();
        let rules: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|rule| rule.enabled && rule.scope.applies_to(connection_id))
            .map(CompiledRule::compile)
            .collect();
        info!(connection = %connection_id, rules = rules.len(), "Automation bound");
        self.binding = Some(Binding { link, rules });
    }

    pub fn unbind(&mut self) {
        if let Some(binding) = self.binding.take() {
            info!(connection = %binding.link.connection_id(), "Automation unbound");
        }
    }

    pub fn bound_to(&self) -> Option<ConnectionId> {
        self.binding.as_ref().map(|binding| binding.link.connection_id())
    }

    pub fn rule_count(&self) -> usize {
        self.binding.as_ref().map_or(0, |binding| binding.rules.len())
    }

    /// Evaluates every bound rule against one inbound message and returns how
    /// many responses were sent or scheduled.
    ///
    /// Retained messages are never evaluated.
    pub fn on_message(&self, topic: &str, payload: &str, retained: bool) -> usize {
        if retained {
            debug!(topic = %topic, "Retained message skipped by automation");
            return 0;
        }
        let Some(binding) = &self.binding else {
            return 0;
        };
        if !binding.link.is_connected() {
            debug!(topic = %topic, "Automation skipped, session not connected");
            return 0;
        }

        let mut fired = 0;
        for compiled in binding.rules.iter().filter(|r| r.matches(topic, payload)) {
            let rule = &compiled.rule;
            let now = Local::now();
            let response_topic = template::render(&rule.response_topic, topic, payload, now);
            let response_payload = template::render(&rule.response_payload, topic, payload, now);
            if response_topic.is_empty() {
                warn!(rule = %rule.name, "Rule matched but response topic is empty");
                continue;
            }

            info!(rule = %rule.name, trigger = %topic, response = %response_topic, "Rule matched");
            match compiled.delay() {
                None => {
                    if let Err(e) = binding.link.publish(
                        response_topic,
                        response_payload.into_bytes(),
                        rule.response_qos,
                        rule.response_retain,
                    ) {
                        warn!(rule = %rule.name, "Response dropped: {}", e);
                        continue;
                    }
                }
                Some(delay) => {
                    let link = binding.link.clone();
                    let name = rule.name.clone();
                    let qos = rule.response_qos;
                    let retain = rule.response_retain;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if !link.is_connected() {
                            debug!(rule = %name, "Delayed response dropped, session not connected");
                            return;
                        }
                        if let Err(e) = link.publish(response_topic, response_payload.into_bytes(), qos, retain) {
                            warn!(rule = %name, "Delayed response dropped: {}", e);
                        }
                    });
                }
            }
            fired += 1;
        }
        fired
    }
}
