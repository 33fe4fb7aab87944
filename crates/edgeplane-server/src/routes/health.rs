//! Operational endpoints outside the tenant/agent data plane: liveness and
//! a minimal metrics surface for the rate limiter's tracked bucket count.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sys/metrics", get(metrics))
}

#[derive(Debug, Serialize)]
struct Healthz {
    status: &'static str,
}

async fn healthz() -> Json<Healthz> {
    Json(Healthz { status: "ok" })
}

#[derive(Debug, Serialize)]
struct Metrics {
    rate_limiter_tracked_buckets: usize,
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<Metrics> {
    Json(Metrics {
        rate_limiter_tracked_buckets: state.rate_limiter.tracked_bucket_count().await,
    })
}
