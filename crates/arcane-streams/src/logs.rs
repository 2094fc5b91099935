//! Log line normalization: sequence numbers, level and service
//! extraction, and timestamp fill.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One normalized log entry as delivered to JSON-format subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    /// Monotonic per-stream sequence number, starting at 1. Authoritative
    /// for ordering; consumers observe drops as gaps.
    pub seq: u64,
    pub level: String,
    pub message: String,
    /// RFC3339 with nanoseconds; echoed from the source when present,
    /// filled monotonically by the normalizer otherwise.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Turns raw source lines into [`LogMessage`]s.
///
/// The source occasionally emits "noop" lines and lines without a
/// timestamp; the former are dropped, the latter get a monotonic
/// RFC3339-nano timestamp. Frames are never reordered.
pub struct LogNormalizer {
    seq: u64,
    last_filled: Option<DateTime<Utc>>,
    container_id: Option<String>,
}

impl LogNormalizer {
    pub fn new(container_id: Option<String>) -> Self {
        Self {
            seq: 0,
            last_filled: None,
            container_id,
        }
    }

    /// Normalizes one line; returns `None` for lines that carry nothing.
    pub fn normalize(&mut self, raw: &str) -> Option<LogMessage> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line == "noop" {
            return None;
        }

        let (service, line) = split_service(line);
        let (timestamp, message) = split_timestamp(line);
        let timestamp = match timestamp {
            Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            None => self.fill_timestamp(),
        };

        self.seq += 1;
        Some(LogMessage {
            seq: self.seq,
            level: detect_level(message),
            message: message.to_string(),
            timestamp,
            service,
            container_id: self.container_id.clone(),
        })
    }

    /// A timestamp that never runs backwards, even across clock
    /// adjustments within one stream.
    fn fill_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_filled {
            if now < last {
                now = last;
            }
        }
        self.last_filled = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

/// Splits a compose-style `service | message` prefix off the line.
fn split_service(line: &str) -> (Option<String>, &str) {
    let Some((prefix, rest)) = line.split_once('|') else {
        return (None, line);
    };
    let service = prefix.trim();
    // A real service prefix is one short token; anything with spaces is
    // log content that happens to contain a pipe.
    if service.is_empty() || service.contains(' ') || service.len() > 63 {
        return (None, line);
    }
    (Some(service.to_string()), rest.trim_start())
}

/// Peels a leading RFC3339 timestamp (docker `--timestamps` style) off
/// the line.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let token = line.split_whitespace().next().unwrap_or("");
    match DateTime::parse_from_rfc3339(token) {
        Ok(ts) => {
            let rest = line[token.len()..].trim_start();
            (Some(ts.with_timezone(&Utc)), rest)
        }
        Err(_) => (None, line),
    }
}

fn detect_level(message: &str) -> String {
    let lower = message.to_ascii_lowercase();
    for (marker, level) in [
        ("error", "error"),
        ("fatal", "error"),
        ("panic", "error"),
        ("warn", "warn"),
        ("debug", "debug"),
        ("trace", "debug"),
    ] {
        if lower.contains(marker) {
            return level.to_string();
        }
    }
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic_from_one() {
        let mut normalizer = LogNormalizer::new(None);
        let seqs: Vec<u64> = ["a", "b", "c"]
            .iter()
            .filter_map(|line| normalizer.normalize(line))
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn noop_and_empty_lines_are_dropped_without_burning_seq() {
        let mut normalizer = LogNormalizer::new(None);
        assert!(normalizer.normalize("noop").is_none());
        assert!(normalizer.normalize("").is_none());
        assert_eq!(normalizer.normalize("real line").unwrap().seq, 1);
    }

    #[test]
    fn source_timestamp_is_echoed() {
        let mut normalizer = LogNormalizer::new(None);
        let message = normalizer
            .normalize("2026-03-01T10:20:30.123456789Z started worker")
            .unwrap();
        assert_eq!(message.timestamp, "2026-03-01T10:20:30.123456789Z");
        assert_eq!(message.message, "started worker");
    }

    #[test]
    fn missing_timestamp_is_filled_and_parseable() {
        let mut normalizer = LogNormalizer::new(None);
        let message = normalizer.normalize("no timestamp here").unwrap();
        let parsed = DateTime::parse_from_rfc3339(&message.timestamp);
        assert!(parsed.is_ok(), "unparseable timestamp {}", message.timestamp);
        // Nanosecond precision is preserved in the rendering.
        assert!(message.timestamp.contains('.'));
    }

    #[test]
    fn filled_timestamps_never_run_backwards() {
        let mut normalizer = LogNormalizer::new(None);
        let first = normalizer.normalize("one").unwrap().timestamp;
        let second = normalizer.normalize("two").unwrap().timestamp;
        assert!(second >= first);
    }

    #[test]
    fn level_extraction_defaults_to_info() {
        let mut normalizer = LogNormalizer::new(None);
        assert_eq!(normalizer.normalize("ERROR: boom").unwrap().level, "error");
        assert_eq!(normalizer.normalize("level=warn slow").unwrap().level, "warn");
        assert_eq!(normalizer.normalize("plain output").unwrap().level, "info");
    }

    #[test]
    fn compose_service_prefix_is_extracted() {
        let mut normalizer = LogNormalizer::new(Some("abc123".into()));
        let message = normalizer.normalize("web-1  | listening on :8080").unwrap();
        assert_eq!(message.service.as_deref(), Some("web-1"));
        assert_eq!(message.message, "listening on :8080");
        assert_eq!(message.container_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn json_shape_matches_the_wire_contract() {
        let message = LogMessage {
            seq: 7,
            level: "info".into(),
            message: "hi".into(),
            timestamp: "2026-03-01T00:00:00.000000000Z".into(),
            service: None,
            container_id: Some("c1".into()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["containerId"], "c1");
        assert!(json.get("service").is_none());
    }
}
