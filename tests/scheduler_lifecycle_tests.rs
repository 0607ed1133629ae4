//! End-to-end scheduler scenarios, run against the real `Scheduler` and
//! `ProcessRunner` with a throwaway shell script standing in for the
//! assistant CLI.

mod common;

use std::time::Duration;

use gateway_core::kernel::{CreateJobRequest, Intake, JobEvent, JobStatus};
use tokio_util::sync::CancellationToken;

use common::{test_scheduler, FakeAssistant};

const ASSISTANT_HELLO: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#;
const RESULT_HI: &str = r#"{"type":"result","result":"Hi"}"#;

async fn wait_for_terminal(intake: &Intake, id: uuid::Uuid) -> gateway_core::kernel::Job {
    for _ in 0..200 {
        let job = intake.get_job(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} never reached a terminal status");
}

#[tokio::test]
async fn scenario_1_default_model_and_sse_event_ordering() {
    let assistant = FakeAssistant::emitting(&[ASSISTANT_HELLO, RESULT_HI]);
    let (store, scheduler) = test_scheduler(assistant.path_string(), 1);
    let intake = Intake::new(store, scheduler.clone(), "haiku".to_string());

    let job = intake
        .create_job(CreateJobRequest {
            prompt: "hello".to_string(),
            model: None,
            system_prompt: None,
            callback_url: None,
            metadata: None,
            response_format: None,
        })
        .await
        .unwrap();
    assert_eq!(job.model, "haiku");
    assert_eq!(job.status, JobStatus::Queued);

    let mut sub = intake.subscribe(job.id).await;
    scheduler.start(CancellationToken::new());

    let first = sub.recv().await.unwrap();
    assert!(matches!(first, JobEvent::Status { ref status } if status == "processing"));

    let second = sub.recv().await.unwrap();
    assert!(matches!(second, JobEvent::Chunk { ref text } if text == "Hi"));

    let third = sub.recv().await.unwrap();
    match third {
        JobEvent::Result { status, result, error } => {
            assert_eq!(status, "completed");
            assert_eq!(result.as_deref(), Some("Hi"));
            assert!(error.is_none());
        }
        other => panic!("expected a result event, got {other:?}"),
    }
    assert!(sub.recv().await.is_none(), "stream should end after result");

    let completed = wait_for_terminal(&intake, job.id).await;
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.result.as_deref(), Some("Hi"));
}

#[tokio::test]
async fn scenario_3_cancel_while_queued_prevents_spawn() {
    let marker = std::env::temp_dir().join(format!("spawn-marker-{}", uuid::Uuid::new_v4()));
    let assistant = FakeAssistant::emitting_with_marker(&[ASSISTANT_HELLO, RESULT_HI], &marker);
    let (store, scheduler) = test_scheduler(assistant.path_string(), 1);
    let intake = Intake::new(store, scheduler.clone(), "haiku".to_string());

    let job = intake
        .create_job(CreateJobRequest {
            prompt: "hello".to_string(),
            model: None,
            system_prompt: None,
            callback_url: None,
            metadata: None,
            response_format: None,
        })
        .await
        .unwrap();

    // Cancel before any worker has started draining the pending queue.
    let cancelled = intake.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    scheduler.start(CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let final_job = intake.get_job(job.id).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Cancelled);
    assert!(
        !marker.exists(),
        "worker must not spawn the assistant for a job cancelled while queued"
    );
}

#[tokio::test]
async fn scenario_4_json_response_format_strips_code_fences() {
    let fenced_result = r#"{"type":"result","result":"```json\n{\"a\":1}\n```"}"#;
    let assistant = FakeAssistant::emitting(&[ASSISTANT_HELLO, fenced_result]);
    let (store, scheduler) = test_scheduler(assistant.path_string(), 1);
    let intake = Intake::new(store, scheduler.clone(), "haiku".to_string());

    let job = intake
        .create_job(CreateJobRequest {
            prompt: "give me json".to_string(),
            model: None,
            system_prompt: None,
            callback_url: None,
            metadata: None,
            response_format: Some("json".to_string()),
        })
        .await
        .unwrap();

    scheduler.start(CancellationToken::new());
    let completed = wait_for_terminal(&intake, job.id).await;

    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.result.as_deref(), Some("{\"a\":1}"));
}

#[tokio::test]
async fn scenario_5_crash_recovery_re_enqueues_and_completes() {
    let assistant = FakeAssistant::emitting(&[ASSISTANT_HELLO, RESULT_HI]);
    let (store, stale_scheduler) = test_scheduler(assistant.path_string(), 2);
    let intake = Intake::new(store.clone(), stale_scheduler.clone(), "haiku".to_string());

    let job = intake
        .create_job(CreateJobRequest {
            prompt: "hello".to_string(),
            model: None,
            system_prompt: None,
            callback_url: None,
            metadata: None,
            response_format: None,
        })
        .await
        .unwrap();

    // Simulate a worker that marked the job processing, then crashed before
    // finalizing. `stale_scheduler` is dropped without ever calling `start`.
    store.mark_processing(job.id).await.unwrap();
    drop(stale_scheduler);

    let fresh_scheduler = std::sync::Arc::new(gateway_core::kernel::Scheduler::new(
        store.clone(),
        std::sync::Arc::new(gateway_core::kernel::ProcessRunner::new(assistant.path_string())),
        std::sync::Arc::new(gateway_core::kernel::WebhookDispatcher::new()),
        100,
        2,
        0,
        0,
        60,
        String::new(),
    ));

    let recovered = fresh_scheduler.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let requeued = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);

    fresh_scheduler.start(CancellationToken::new());

    let fresh_intake = Intake::new(store.clone(), fresh_scheduler, "haiku".to_string());
    let completed = wait_for_terminal(&fresh_intake, job.id).await;
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.result.as_deref(), Some("Hi"));
}

#[tokio::test]
async fn scenario_6_loopback_callback_url_is_never_dispatched() {
    let assistant = FakeAssistant::emitting(&[ASSISTANT_HELLO, RESULT_HI]);
    let (store, scheduler) = test_scheduler(assistant.path_string(), 1);
    let intake = Intake::new(store, scheduler.clone(), "haiku".to_string());

    let job = intake
        .create_job(CreateJobRequest {
            prompt: "hello".to_string(),
            model: None,
            system_prompt: None,
            callback_url: Some("http://127.0.0.1/hook".to_string()),
            metadata: None,
            response_format: None,
        })
        .await
        .unwrap();

    scheduler.start(CancellationToken::new());
    let completed = wait_for_terminal(&intake, job.id).await;

    // The job completes normally; the dispatcher's own SSRF validation
    // (covered directly in kernel::webhook's tests) blocks the loopback
    // address before any HTTP request would be attempted.
    assert_eq!(completed.status, JobStatus::Completed);
}
