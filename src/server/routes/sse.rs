//! `GET /api/v1/jobs/{id}/sse` — live event stream.
//!
//! Framing: `event: <name>\ndata: <json>\n\n`. On connect, a job already in a
//! terminal state gets one `result` event and the stream ends immediately.
//! Otherwise: subscribe first (to avoid missing events raised between the
//! initial lookup and subscription), write the current status, then forward
//! events until the sink is closed by `notifyAndClose` or the client
//! disconnects. The subscription is released either way.

use std::convert::Infallible;
use std::pin::Pin;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use uuid::Uuid;

use crate::kernel::{Intake, JobEvent, Subscription};
use crate::server::app::AppState;
use crate::server::error::ApiError;

type BoxedEventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub async fn job_event_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<BoxedEventStream>, ApiError> {
    let job = state.intake.get_job(id).await?;

    if job.status.is_terminal() {
        let event = JobEvent::Result {
            status: job.status.as_str().to_string(),
            result: job.result.clone(),
            error: job.error.clone(),
        };
        let sse_event = to_sse_event(&event);
        let once: BoxedEventStream = Box::pin(stream::once(async move { Ok(sse_event) }));
        return Ok(Sse::new(once).keep_alive(KeepAlive::default()));
    }

    let sub = state.intake.subscribe(id).await;
    // Re-read after subscribing so the first event reflects any transition
    // that happened between the lookup above and the subscribe. If the job
    // already finished in that window, notify_and_close already fired (and
    // found no subscriber) before `sub` was created, so `sub.recv()` would
    // hang forever waiting on an event that will never come; emit the
    // terminal result directly instead and never wait on the subscription.
    let current = state.intake.get_job(id).await.unwrap_or(job);
    let (initial_events, sub) = if current.status.is_terminal() {
        // The job finished in the window between the lookup above and this
        // subscribe; no further notify will ever target it, so release the
        // just-created registry slot instead of leaving it to never unsubscribe.
        state.intake.unsubscribe(&sub).await;
        let event = JobEvent::Result {
            status: current.status.as_str().to_string(),
            result: current.result.clone(),
            error: current.error.clone(),
        };
        (vec![to_sse_event(&event)], None)
    } else {
        let status_event = to_sse_event(&JobEvent::Status {
            status: current.status.as_str().to_string(),
        });
        (vec![status_event], Some(sub))
    };

    let guard = SseGuard {
        intake: state.intake.clone(),
        sub,
    };
    let initial = initial_events.into_iter();

    let forward: BoxedEventStream = Box::pin(stream::unfold((initial, guard), next_sse_item));
    Ok(Sse::new(forward).keep_alive(KeepAlive::default()))
}

type UnfoldState = (std::vec::IntoIter<Event>, SseGuard);

async fn next_sse_item(
    (mut pending, mut guard): UnfoldState,
) -> Option<(Result<Event, Infallible>, UnfoldState)> {
    if let Some(event) = pending.next() {
        return Some((Ok(event), (pending, guard)));
    }

    let sub = guard.sub.as_mut()?;
    let event = sub.recv().await?;
    let is_terminal = matches!(event, JobEvent::Result { .. });
    let sse_event = to_sse_event(&event);

    if is_terminal {
        // Drop the subscription now so unsubscribe fires without waiting for
        // the caller to drop the whole stream.
        guard.sub = None;
    }

    Some((Ok(sse_event), (pending, guard)))
}

fn to_sse_event(event: &JobEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data_json().to_string())
}

/// Releases the subscription when the stream ends or is dropped (client
/// disconnect). Cleanup is async (registry unsubscribe takes a lock) so it is
/// dispatched onto a detached task from `Drop`.
struct SseGuard {
    intake: std::sync::Arc<Intake>,
    sub: Option<Subscription>,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        if let Some(sub) = self.sub.take() {
            let intake = self.intake.clone();
            tokio::spawn(async move {
                intake.unsubscribe(&sub).await;
            });
        }
    }
}
