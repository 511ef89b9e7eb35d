use chrono::{DateTime, Local};

pub const TIMESTAMP: &str = "{{timestamp}}";
pub const TIMESTAMP_UNIX: &str = "{{timestamp_unix}}";
pub const TIMESTAMP_MS: &str = "{{timestamp_ms}}";
pub const TOPIC: &str = "{{topic}}";
pub const PAYLOAD: &str = "{{payload}}";

/// Substitutes placeholders in a response template.
///
/// Replacement is plain text, one placeholder after the other in the order
/// timestamps, topic, payload. A topic that itself contains `{{payload}}` is
/// therefore replaced again; no escaping exists.
pub fn render(template: &str, topic: &str, payload: &str, now: DateTime<Local>) -> String {
    template
        .replace(TIMESTAMP, &now.format("%Y-%m-%dT%H:%M:%S").to_string())
        .replace(TIMESTAMP_UNIX, &now.timestamp().to_string())
        .replace(TIMESTAMP_MS, &now.timestamp_millis().to_string())
        .replace(TOPIC, topic)
        .replace(PAYLOAD, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.timestamp_millis_opt(1_700_000_000_123).unwrap()
    }

    #[test]
    fn echo_template() {
        assert_eq!(
            render("echo: {{payload}} from {{topic}}", "t1", "hi", fixed_now()),
            "echo: hi from t1"
        );
    }

    #[test]
    fn unix_variants() {
        let now = fixed_now();
        assert_eq!(render("{{timestamp_unix}}", "t", "p", now), "1700000000");
        assert_eq!(render("{{timestamp_ms}}", "t", "p", now), "1700000000123");
    }

    #[test]
    fn human_timestamp() {
        let now = fixed_now();
        let expected = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        assert_eq!(render("at {{timestamp}}", "t", "p", now), format!("at {}", expected));
    }

    #[test]
    fn every_occurrence_is_replaced() {
        assert_eq!(render("{{topic}}/{{topic}}", "a", "", fixed_now()), "a/a");
    }

    #[test]
    fn topic_containing_placeholder_is_substituted_again() {
        assert_eq!(render("{{topic}}", "x/{{payload}}", "boom", fixed_now()), "x/boom");
    }
}
