//! Router assembly: middleware layering, route table, shared state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::Intake;

use super::middleware::require_api_key;
use super::routes::{health, jobs, sse};

const BODY_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
    pub config: Arc<Config>,
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route(
            "/api/v1/jobs/:id",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/v1/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/api/v1/jobs/:id/sse", get(sse::job_event_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let mut router = Router::new()
        .route("/api/v1/health", get(health::health))
        .merge(protected);

    if state.config.rate_limit_per_second > 0 {
        let replenish_interval_ms = (1000 / state.config.rate_limit_per_second).max(1) as u64;
        let governor_conf = GovernorConfigBuilder::default()
            .per_millisecond(replenish_interval_ms)
            .burst_size(state.config.rate_limit_per_second)
            .finish()
            .expect("static governor configuration is valid");
        let governor_conf: &'static _ = Box::leak(Box::new(governor_conf));
        router = router.layer(GovernorLayer {
            config: governor_conf,
        });
    }

    router = router
        .layer(cors_layer(&state.config))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .max_age(Duration::from_secs(3600))
}
