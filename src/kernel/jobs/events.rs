//! Event shapes forwarded to live subscribers through the fan-out registry.

use serde::{Deserialize, Serialize};

/// A tagged event emitted for a single job, forwarded to every subscriber of
/// that job's id. Events for a job are totally ordered per subscriber: a
/// `Status` event, zero or more `Chunk` events, then exactly one `Result`
/// event followed by end-of-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Status { status: String },
    Chunk { text: String },
    Result {
        status: String,
        result: Option<String>,
        error: Option<String>,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Chunk { .. } => "chunk",
            JobEvent::Result { .. } => "result",
        }
    }

    /// The `data` half of the tagged representation, for SSE framing where
    /// `event:` and `data:` are written as separate lines.
    pub fn data_json(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("data").cloned())
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_status_field() {
        let event = JobEvent::Status {
            status: "processing".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["data"]["status"], "processing");
    }

    #[test]
    fn result_event_round_trips() {
        let event = JobEvent::Result {
            status: "completed".to_string(),
            result: Some("Hi".to_string()),
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: JobEvent = serde_json::from_str(&json).unwrap();
        match back {
            JobEvent::Result { status, result, .. } => {
                assert_eq!(status, "completed");
                assert_eq!(result.as_deref(), Some("Hi"));
            }
            _ => panic!("expected Result variant"),
        }
    }

    #[test]
    fn data_json_extracts_only_the_payload() {
        let event = JobEvent::Chunk {
            text: "hi".to_string(),
        };
        assert_eq!(event.data_json(), serde_json::json!({"text": "hi"}));
    }

    #[test]
    fn event_name_matches_variant() {
        assert_eq!(JobEvent::Status { status: "x".into() }.name(), "status");
        assert_eq!(JobEvent::Chunk { text: "x".into() }.name(), "chunk");
        assert_eq!(
            JobEvent::Result {
                status: "x".into(),
                result: None,
                error: None
            }
            .name(),
            "result"
        );
    }
}
