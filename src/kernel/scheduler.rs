//! Scheduler / Worker Pool — the core's core.
//!
//! A bounded in-memory FIFO queue of job ids feeds a static pool of N worker
//! tasks. Scheduling is FIFO by enqueue order; fairness across clients is not
//! attempted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;

use super::fanout::Registry;
use super::jobs::{Job, JobEvent, JobStatus, JobStore};
use super::process_runner::{ChunkSink, ProcessRunner};
use super::webhook::{WebhookDispatcher, WebhookPayload};

/// The fixed instruction appended to the effective system prompt when a job
/// requests `response_format=json`.
const JSON_ONLY_INSTRUCTION: &str = "Respond with raw JSON only. Do not wrap the \
output in code fences, do not include any prose before or after it. The \
response must be directly parseable as JSON.";

struct SchedulerConfig {
    worker_count: usize,
    job_timeout_minutes: i64,
    job_ttl_hours: i64,
    cleanup_interval: Duration,
    security_prompt: String,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registry: Registry,
    process_runner: Arc<ProcessRunner>,
    webhook: Arc<WebhookDispatcher>,
    tx: mpsc::Sender<Uuid>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        process_runner: Arc<ProcessRunner>,
        webhook: Arc<WebhookDispatcher>,
        queue_capacity: usize,
        worker_count: usize,
        job_timeout_minutes: i64,
        job_ttl_hours: i64,
        cleanup_interval_minutes: u64,
        security_prompt: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        Self {
            store,
            registry: Registry::new(),
            process_runner,
            webhook,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            config: SchedulerConfig {
                worker_count,
                job_timeout_minutes,
                job_ttl_hours,
                cleanup_interval: Duration::from_secs(cleanup_interval_minutes * 60),
                security_prompt,
            },
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Non-blocking send. Returns [`SchedulerError::QueueFull`] on a full
    /// queue — callers must treat this as "temporarily unavailable" and must
    /// not retry synchronously. The caller's contract is persist-then-enqueue:
    /// a job whose enqueue fails is durably `queued` and will be picked up by
    /// recovery on the next startup.
    pub fn enqueue(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.tx
            .try_send(id)
            .map_err(|_| SchedulerError::QueueFull)
    }

    /// Cancel an in-flight job. Returns whether an active run was found.
    /// Callers are expected to have already written `status=cancelled` to the
    /// store; this return value does not affect the HTTP response.
    pub async fn cancel(&self, id: Uuid) -> bool {
        self.registry.cancel(id).await
    }

    /// Must be called synchronously before [`Scheduler::start`] spawns any
    /// workers. Reverts every `processing` record left by a prior crash back
    /// to `queued` and re-enqueues it. A re-enqueue that fails with
    /// `QueueFull` is logged and dropped — the record remains durably
    /// `queued` and will be picked up on the next boot.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let ids = self.store.reset_processing().await?;
        let mut recovered = 0;
        for id in ids {
            match self.enqueue(id) {
                Ok(()) => recovered += 1,
                Err(_) => warn!(job_id = %id, "recovery re-enqueue failed, queue full"),
            }
        }
        info!(count = recovered, "recovery complete");
        Ok(recovered)
    }

    /// Spawn the N worker tasks and the periodic cleanup task. Each worker
    /// loops until `shutdown` fires, draining one id per iteration.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count + 1);

        for worker_id in 0..self.config.worker_count {
            let scheduler = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, shutdown).await;
            }));
        }

        handles.push(self.clone().spawn_cleanup(shutdown));
        handles
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "worker starting");
        loop {
            let next = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    id = rx.recv() => id,
                }
            };

            let Some(id) = next else { break };
            self.process_one(id, &shutdown).await;
        }
        info!(worker_id, "worker stopped");
    }

    async fn process_one(&self, id: Uuid, shutdown: &CancellationToken) {
        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %id, "dequeued job not found in store");
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to load job");
                return;
            }
        };

        if job.status == JobStatus::Cancelled {
            info!(job_id = %id, "skipping job cancelled while queued");
            return;
        }

        if let Err(e) = self.store.mark_processing(id).await {
            error!(job_id = %id, error = %e, "failed to mark job processing");
            return;
        }

        self.registry
            .notify(
                id,
                JobEvent::Status {
                    status: JobStatus::Processing.as_str().to_string(),
                },
            )
            .await;

        let run_cancel = shutdown.child_token();
        self.registry.register_cancel(id, run_cancel.clone()).await;

        let deadline = (self.config.job_timeout_minutes > 0)
            .then(|| Duration::from_secs((self.config.job_timeout_minutes * 60) as u64));

        let effective_system_prompt = compose_system_prompt(&self.config.security_prompt, &job);
        let chunk_sink = FanoutChunkSink {
            registry: self.registry.clone(),
            job_id: id,
        };

        let run_result = self
            .process_runner
            .run(
                &run_cancel,
                deadline,
                self.config.job_timeout_minutes,
                &job.model,
                &job.prompt,
                &effective_system_prompt,
                &chunk_sink,
            )
            .await;

        self.registry.remove_cancel(id).await;

        let (status, final_text, error_msg) = match run_result {
            Ok(text) => {
                let text = if job.wants_json() {
                    strip_code_fences(&text)
                } else {
                    text
                };
                (JobStatus::Completed, Some(text), None)
            }
            Err(e) if e.is_cancelled() => {
                (JobStatus::Cancelled, None, Some("job cancelled by user".to_string()))
            }
            Err(e) if e.is_timed_out() => (JobStatus::Failed, None, Some(e.to_string())),
            Err(e) => (JobStatus::Failed, None, Some(e.to_string())),
        };

        self.finalize(id, status, final_text, error_msg, job.callback_url, shutdown)
            .await;
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
        callback_url: Option<String>,
        shutdown: &CancellationToken,
    ) {
        if let Err(e) = self
            .store
            .update_status(id, status, result.as_deref(), error.as_deref())
            .await
        {
            error!(job_id = %id, error = %e, "failed to persist terminal status");
        }

        self.registry
            .notify_and_close(
                id,
                JobEvent::Result {
                    status: status.as_str().to_string(),
                    result: result.clone(),
                    error: error.clone(),
                },
            )
            .await;

        if let Some(url) = callback_url {
            let payload = WebhookPayload {
                job_id: id,
                status: status.as_str().to_string(),
                result,
                error,
            };
            // Detached from the job's own (now-discarded) cancellation scope,
            // but inherits the process shutdown scope.
            if let Err(e) = self.webhook.send(shutdown.clone(), url, payload).await {
                warn!(job_id = %id, error = %e, "webhook not dispatched");
            }
        }
    }

    fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.job_ttl_hours <= 0 {
                return;
            }

            let mut ticker = tokio::time::interval(self.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::hours(self.config.job_ttl_hours);
                        match self.store.delete_terminal_before(cutoff).await {
                            Ok(count) => info!(count, "deleted expired terminal jobs"),
                            Err(e) => error!(error = %e, "cleanup tick failed"),
                        }
                    }
                }
            }
        })
    }
}

struct FanoutChunkSink {
    registry: Registry,
    job_id: Uuid,
}

#[async_trait::async_trait]
impl ChunkSink for FanoutChunkSink {
    async fn write_chunk(&self, text: String) {
        self.registry
            .notify(self.job_id, JobEvent::Chunk { text })
            .await;
    }
}

/// 4.E.1 — compose the effective system prompt sent to the assistant.
pub fn compose_system_prompt(security_prompt: &str, job: &Job) -> String {
    let mut composed = String::new();

    if !security_prompt.is_empty() {
        composed.push_str(security_prompt);
    }

    if job.wants_json() {
        if !composed.is_empty() {
            composed.push_str("\n\n");
        }
        composed.push_str(JSON_ONLY_INSTRUCTION);
    }

    if let Some(system_prompt) = job.system_prompt.as_ref().filter(|s| !s.is_empty()) {
        composed.push_str("\n\n");
        composed.push_str(system_prompt);
    }

    composed
}

/// 4.E.3 — idempotent fence-stripping for JSON response_format.
pub fn strip_code_fences(input: &str) -> String {
    let mut text = input.trim().to_string();

    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.find('\n') {
            Some(idx) => rest[idx + 1..].to_string(),
            None => String::new(),
        };
    }

    if let Some(rest) = text.strip_suffix("```") {
        text = rest.to_string();
    }

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::sample_job;

    #[test]
    fn strip_code_fences_removes_fence_and_language_tag() {
        let input = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fences(input), "{\"a\":1}");
    }

    #[test]
    fn strip_code_fences_on_plain_text_only_trims() {
        assert_eq!(strip_code_fences("  plain text  "), "plain text");
    }

    #[test]
    fn strip_code_fences_is_idempotent() {
        let once = strip_code_fences("```json\n{\"a\":1}\n```");
        let twice = strip_code_fences(&once);
        assert_eq!(once, twice);

        let plain_once = strip_code_fences("no fences here");
        let plain_twice = strip_code_fences(&plain_once);
        assert_eq!(plain_once, plain_twice);
    }

    #[test]
    fn compose_system_prompt_with_all_three_parts() {
        let mut job = sample_job();
        job.response_format = "json".to_string();
        job.system_prompt = Some("be terse".to_string());

        let composed = compose_system_prompt("be safe", &job);
        assert!(composed.starts_with("be safe"));
        assert!(composed.contains(JSON_ONLY_INSTRUCTION));
        assert!(composed.ends_with("be terse"));
    }

    #[test]
    fn compose_system_prompt_empty_security_prompt_still_appends_json_instruction() {
        let mut job = sample_job();
        job.response_format = "json".to_string();

        let composed = compose_system_prompt("", &job);
        assert_eq!(composed, JSON_ONLY_INSTRUCTION);
    }

    #[test]
    fn compose_system_prompt_with_nothing_configured_is_empty() {
        let job = sample_job();
        assert_eq!(compose_system_prompt("", &job), "");
    }
}
