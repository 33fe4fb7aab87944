//! `POST /enroll`, `/v1/enroll` — token-in-body agent provisioning
//! (`spec.md` §6).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use edgeplane_core::enrollment;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/enroll", post(enroll))
        .route("/v1/enroll", post(enroll))
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    enrollment_token: String,
    #[serde(alias = "requested_hostname")]
    hostname: String,
    csr_pem: String,
    agent_version: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    kernel_version: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    bootstrap_nonce: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    agent_id: Uuid,
    certificate_pem: String,
    ca_chain_pem: String,
    refresh_token: String,
    next_heartbeat_seconds: u64,
}

async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, AppError> {
    // `labels`/`bootstrap_nonce` are accepted but not yet consumed by the
    // identity model beyond validation of request shape.
    let _ = (&body.labels, &body.bootstrap_nonce);

    let enrolled = enrollment::enroll(
        &state.repo,
        &state.ca,
        &body.enrollment_token,
        &body.hostname,
        &body.csr_pem,
        body.agent_version,
        body.os,
        body.arch,
        body.kernel_version,
        state.config.agent_cert_ttl,
        state.config.heartbeat_interval,
    )
    .await?;

    Ok(Json(EnrollResponse {
        agent_id: enrolled.agent.id,
        certificate_pem: enrolled.certificate_pem,
        ca_chain_pem: enrolled.ca_chain_pem,
        refresh_token: enrolled.refresh_token,
        next_heartbeat_seconds: enrolled.heartbeat_interval_seconds,
    }))
}
