//! Job model — the only persisted entity in the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Status transitions form a DAG: `Queued -> Processing -> {Completed, Failed,
/// Cancelled}`, `Queued -> Cancelled`, `Processing -> {Completed, Failed,
/// Cancelled}`. Terminal statuses never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A submitted prompt and its lifecycle through the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub prompt: String,

    #[builder(default, setter(strip_option))]
    pub system_prompt: Option<String>,

    pub model: String,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default, setter(strip_option))]
    pub result: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub callback_url: Option<String>,

    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,

    /// One of `""`, `"text"`, `"json"`. `"json"` triggers fence-stripping
    /// post-processing in the worker.
    #[builder(default = String::new())]
    pub response_format: String,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn wants_json(&self) -> bool {
        self.response_format == "json"
    }
}

#[cfg(test)]
pub(crate) fn sample_job() -> Job {
    Job::builder()
        .prompt("hello".to_string())
        .model("haiku".to_string())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_queued_with_no_timestamps_set() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn terminal_statuses_are_exactly_completed_failed_cancelled() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn status_as_str_round_trips_through_parse() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn wants_json_only_when_response_format_is_json() {
        let mut job = sample_job();
        assert!(!job.wants_json());
        job.response_format = "json".to_string();
        assert!(job.wants_json());
    }
}
