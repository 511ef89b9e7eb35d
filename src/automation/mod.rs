//! # Automation
//!
//! Operator-defined rules that listen to inbound traffic and publish
//! templated responses, optionally after a delay.
//!
//! ```text
//! inbound message ──► [topic filter] ──► [condition] ──► render templates ──► publish
//!                                                              │
//!                                                        (delay_ms > 0)
//!                                                              ▼
//!                                                   sleep, re-check connected
//! ```
//!
//! Conditions are compiled once when rules are bound. A rule whose condition
//! kind is unknown, or whose regular expression does not compile, never
//! matches.

pub mod engine;
pub mod rule;
pub mod template;
pub mod topic;

pub use engine::AutomationEngine;
pub use rule::{Rule, RuleScope, TriggerCondition};
