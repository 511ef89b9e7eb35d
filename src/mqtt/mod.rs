//! # MQTT Transport Module
//!
//! Everything that belongs to a single broker connection: the profile it is
//! opened from, the messages it carries, and the worker that drives it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection profiles, QoS and subscriptions
//! ├── message_manager.rs  - Message records and payload decoding
//! ├── link.rs             - Connector/Link seam to the protocol client
//! ├── rumqtt_link.rs      - rumqttc-backed Connector
//! ├── tls.rs              - CA, client certificate and key loading
//! ├── error.rs            - Transport faults
//! └── mqtt_handler.rs     - Transport worker state machine
//! ```
//!
//! ## Event Flow
//!
//! The worker never returns errors to its caller. Connection changes, inbound
//! traffic, accepted publishes and faults are all reported as
//! [`SessionEvent`](mqtt_handler::SessionEvent)s on one ordered channel.

pub mod config;
pub mod error;
pub mod link;
pub mod message_manager;
pub mod mqtt_handler;
pub mod rumqtt_link;
pub mod tls;

#[cfg(test)]
pub mod mock;
