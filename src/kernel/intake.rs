//! Intake Adaptor — the operations the HTTP layer calls into. Owns request
//! validation and the persist-then-enqueue contract; knows nothing about
//! axum.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::config::parse_model;
use crate::error::StoreError;

use super::fanout::Subscription;
use super::jobs::{Job, JobStatus, JobStore};
use super::scheduler::Scheduler;

const VALID_RESPONSE_FORMATS: [&str; 3] = ["", "text", "json"];

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub response_format: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    #[error("job not found")]
    NotFound,
    #[error("job is already in a terminal state")]
    Conflict,
    #[error("job queue is full")]
    QueueFull,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Intake {
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    default_model: String,
}

impl Intake {
    pub fn new(store: Arc<dyn JobStore>, scheduler: Arc<Scheduler>, default_model: String) -> Self {
        Self {
            store,
            scheduler,
            default_model,
        }
    }

    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job, IntakeError> {
        if req.prompt.trim().is_empty() {
            return Err(IntakeError::Validation("prompt must not be empty".to_string()));
        }

        let model = match req.model {
            Some(m) => parse_model(&m).map_err(IntakeError::Validation)?,
            None => self.default_model.clone(),
        };

        let response_format = req.response_format.unwrap_or_default();
        if !VALID_RESPONSE_FORMATS.contains(&response_format.as_str()) {
            return Err(IntakeError::Validation(format!(
                "invalid response_format {response_format:?}: must be one of {VALID_RESPONSE_FORMATS:?}"
            )));
        }

        if let Some(url) = &req.callback_url {
            let parsed =
                url::Url::parse(url).map_err(|e| IntakeError::Validation(format!("invalid callback_url: {e}")))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(IntakeError::Validation(
                    "callback_url scheme must be http or https".to_string(),
                ));
            }
        }

        let mut job = Job::builder()
            .prompt(req.prompt)
            .model(model)
            .response_format(response_format)
            .build();
        job.system_prompt = req.system_prompt;
        job.callback_url = req.callback_url;
        job.metadata = req.metadata;

        self.store.create(&job).await?;

        if self.scheduler.enqueue(job.id).is_err() {
            return Err(IntakeError::QueueFull);
        }

        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, IntakeError> {
        self.store.get(id).await?.ok_or(IntakeError::NotFound)
    }

    pub async fn list_jobs(&self, limit: i64, offset: i64) -> Result<(Vec<Job>, i64), IntakeError> {
        Ok(self.store.list(limit, offset).await?)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<(), IntakeError> {
        if self.store.delete(id).await? {
            Ok(())
        } else {
            Err(IntakeError::NotFound)
        }
    }

    /// Writes `status=cancelled` to the store first, then best-effort signals
    /// the scheduler. The scheduler's return value does not affect the
    /// response — a job that has not yet been dequeued is simply skipped by
    /// its worker on dequeue.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, IntakeError> {
        let job = self.store.get(id).await?.ok_or(IntakeError::NotFound)?;
        if job.status.is_terminal() {
            return Err(IntakeError::Conflict);
        }

        self.store
            .update_status(id, JobStatus::Cancelled, None, Some("job cancelled by user"))
            .await?;
        let _ = self.scheduler.cancel(id).await;

        self.store.get(id).await?.ok_or(IntakeError::NotFound)
    }

    pub async fn subscribe(&self, id: Uuid) -> Subscription {
        self.scheduler.registry().subscribe(id).await
    }

    pub async fn unsubscribe(&self, sub: &Subscription) {
        self.scheduler.registry().unsubscribe(sub).await;
    }
}
