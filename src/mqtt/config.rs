use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Store-assigned key of a connection profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub i64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// TLS file locations of a profile. Paths are read when a connection is made,
/// never when the profile is saved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

/// Everything needed to open one broker connection.
///
/// A running session keeps the copy it was connected with; edits only take
/// effect on the next `request_connect`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Empty means a random id is generated per connect
    pub client_id: String,
    /// `None` connects in plain text
    pub tls: Option<TlsSettings>,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            id: ConnectionId(-1),
            name: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            tls: None,
            clean_session: true,
            keep_alive_secs: 60,
        }
    }
}

impl ConnectionProfile {
    pub fn keep_alive(&self) -> Duration {
        // rumqttc rejects keep-alive intervals below one second
        Duration::from_secs(u64::from(self.keep_alive_secs.max(1)))
    }

    pub fn effective_client_id(&self) -> String {
        if self.client_id.trim().is_empty() {
            format!("mqttassistant-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.clone()
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Quality of service levels, stored as their wire number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// Out-of-range numbers fall back to QoS 0.
    pub fn from_level(level: i64) -> Self {
        match level {
            1 => Qos::AtLeastOnce,
            2 => Qos::ExactlyOnce,
            _ => Qos::AtMostOnce,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A persisted topic subscription, replayed whenever its connection comes up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub connection_id: ConnectionId,
    pub topic: String,
    pub qos: Qos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_is_generated() {
        let profile = ConnectionProfile::default();
        let a = profile.effective_client_id();
        let b = profile.effective_client_id();
        assert!(a.starts_with("mqttassistant-"));
        assert_ne!(a, b);
    }

    #[test]
    fn configured_client_id_is_kept() {
        let profile = ConnectionProfile {
            client_id: "bench-01".to_string(),
            ..ConnectionProfile::default()
        };
        assert_eq!(profile.effective_client_id(), "bench-01");
    }

    #[test]
    fn keep_alive_never_below_one_second() {
        let profile = ConnectionProfile {
            keep_alive_secs: 0,
            ..ConnectionProfile::default()
        };
        assert_eq!(profile.keep_alive(), Duration::from_secs(1));
    }

    #[test]
    fn qos_levels() {
        assert_eq!(Qos::from_level(2), Qos::ExactlyOnce);
        assert_eq!(Qos::from_level(7), Qos::AtMostOnce);
        assert_eq!(Qos::AtLeastOnce.level(), 1);
    }
}
