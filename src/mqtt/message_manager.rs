use chrono::{DateTime, Utc};
use std::fmt;

use super::config::ConnectionId;

/// Prefix of payloads that could not be shown as text.
pub const HEX_MARKER: &str = "HEX: ";

/// Share of control bytes above which a valid UTF-8 payload is still shown as hex.
const CONTROL_BYTE_RATIO: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Display hint only. Nothing in the pipeline branches on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Json,
    Binary,
}

impl ContentKind {
    pub fn classify(payload: &str) -> Self {
        if payload.starts_with(HEX_MARKER) {
            return ContentKind::Binary;
        }
        let trimmed = payload.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
                return ContentKind::Json;
            }
        }
        ContentKind::Text
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Set once the store has assigned a row id
    pub id: Option<i64>,
    pub connection_id: ConnectionId,
    pub topic: String,
    pub payload: String,
    pub direction: Direction,
    pub retained: bool,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
}

impl Message {
    pub fn inbound(connection_id: ConnectionId, topic: String, payload: String, retained: bool) -> Self {
        Self::new(connection_id, topic, payload, Direction::Inbound, retained)
    }

    pub fn outbound(connection_id: ConnectionId, topic: String, payload: String, retained: bool) -> Self {
        Self::new(connection_id, topic, payload, Direction::Outbound, retained)
    }

    fn new(
        connection_id: ConnectionId,
        topic: String,
        payload: String,
        direction: Direction,
        retained: bool,
    ) -> Self {
        let kind = ContentKind::classify(&payload);
        Message {
            id: None,
            connection_id,
            topic,
            payload,
            direction,
            retained,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outbound
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        let preview: String = self.payload.chars().take(60).collect();
        write!(
            f,
            "{} {} {} {}",
            self.timestamp.format("%H:%M:%S"),
            arrow,
            self.topic,
            preview
        )
    }
}

/// Turns raw payload bytes into display text.
///
/// Valid UTF-8 is returned as is unless more than 5% of the bytes are control
/// characters, in which case (and for invalid UTF-8) the bytes are rendered as an
/// upper-case hex dump behind [`HEX_MARKER`].
pub fn decode_payload(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !mostly_control(bytes) => text.to_string(),
        _ => hex_dump(bytes),
    }
}

fn mostly_control(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let control = bytes
        .iter()
        .filter(|b| {
            let b = **b;
            (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7f
        })
        .count();
    control as f64 / bytes.len() as f64 > CONTROL_BYTE_RATIO
}

fn hex_dump(bytes: &[u8]) -> String {
    let pairs: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!("{}{}", HEX_MARKER, pairs.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_text_passes_through() {
        assert_eq!(decode_payload("température 21°C\n".as_bytes()), "température 21°C\n");
    }

    #[test]
    fn invalid_utf8_becomes_hex() {
        assert_eq!(decode_payload(&[0xff, 0x00, 0x1a]), "HEX: FF 00 1A");
    }

    #[test]
    fn control_heavy_utf8_becomes_hex() {
        let mut bytes = b"abcdefghij".to_vec();
        bytes.push(0x01);
        assert_eq!(decode_payload(&bytes), "HEX: 61 62 63 64 65 66 67 68 69 6A 01");
    }

    #[test]
    fn few_control_bytes_are_tolerated() {
        let mut bytes = vec![b'a'; 40];
        bytes.push(0x02);
        assert!(!decode_payload(&bytes).starts_with(HEX_MARKER));
    }

    #[test]
    fn empty_payload_is_empty_text() {
        assert_eq!(decode_payload(&[]), "");
    }

    #[test]
    fn content_kinds() {
        assert_eq!(ContentKind::classify(r#"{"t": 21.5}"#), ContentKind::Json);
        assert_eq!(ContentKind::classify("[1, 2"), ContentKind::Text);
        assert_eq!(ContentKind::classify("HEX: 00"), ContentKind::Binary);
        assert_eq!(ContentKind::classify("on"), ContentKind::Text);
    }
}
