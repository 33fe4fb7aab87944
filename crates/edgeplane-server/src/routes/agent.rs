//! mTLS agent endpoints: heartbeat, log ingestion, plan lease/result,
//! renew, unenroll (`spec.md` §4.3, §4.4, §4.6, §6).

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use edgeplane_core::{enrollment, heartbeat, plan_engine};
use edgeplane_storage::{
    ExecutionResultInput, HeartbeatExecutionUpdate, HeartbeatInput, HostFacts, LeasedPlan,
    NewExecutionLog, ReportedMicroVm, Severity,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AgentContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents/heartbeat", post(heartbeat_handler))
        .route("/v1/heartbeat", post(heartbeat_handler))
        .route("/v1/logs", post(ingest_single_log))
        .route("/agents/logs", post(ingest_batch_logs))
        .route("/v1/plans/next", get(plans_next))
        .route("/v1/executions/result", post(executions_result))
        .route("/v1/unenroll", post(unenroll))
        .route("/v1/renew", post(renew))
}

#[derive(Debug, Deserialize, Default)]
struct HostFactsBody {
    cpu_cores: Option<i32>,
    memory_bytes: Option<i64>,
    storage_bytes: Option<i64>,
    kvm_capable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MicroVmBody {
    id: Uuid,
    state: String,
    vcpu_count: Option<i32>,
    memory_mib: Option<i32>,
    host_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ExecutionUpdateBody {
    execution_id: Uuid,
    ok: bool,
    error_code: Option<String>,
    message: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    heartbeat_seq: i64,
    agent_version: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    kernel_version: Option<String>,
    host_facts: Option<HostFactsBody>,
    #[serde(default)]
    micro_vms: Vec<MicroVmBody>,
    #[serde(default)]
    execution_updates: Vec<ExecutionUpdateBody>,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    next_heartbeat_seconds: u64,
    pending_plans: Vec<LeasedPlan>,
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let host_facts = body.host_facts.map(|f| HostFacts {
        cpu_cores: f.cpu_cores.unwrap_or_default(),
        memory_bytes: f.memory_bytes.unwrap_or_default(),
        storage_bytes: f.storage_bytes.unwrap_or_default(),
        kvm_capable: f.kvm_capable.unwrap_or_default(),
    });

    let input = HeartbeatInput {
        agent_id: ctx.agent_id,
        presented_cert_serial: ctx.cert_serial,
        heartbeat_seq: body.heartbeat_seq,
        agent_version: body.agent_version,
        os: body.os,
        arch: body.arch,
        kernel_version: body.kernel_version,
        host_facts,
        micro_vms: body
            .micro_vms
            .into_iter()
            .map(|vm| ReportedMicroVm {
                id: vm.id,
                state: vm.state,
                vcpu_count: vm.vcpu_count,
                memory_mib: vm.memory_mib,
                host_id: vm.host_id,
            })
            .collect(),
        execution_updates: body
            .execution_updates
            .into_iter()
            .map(|u| HeartbeatExecutionUpdate {
                execution_id: u.execution_id,
                ok: u.ok,
                error_code: u.error_code,
                message: u.message,
                finished_at: u.finished_at,
            })
            .collect(),
    };

    let outcome = heartbeat::process_heartbeat(
        &state.repo,
        &state.crl,
        input,
        state.config.heartbeat_interval,
        state.config.max_pending_plans,
        state.config.plan_lease_ttl,
    )
    .await?;

    Ok(Json(HeartbeatResponse {
        next_heartbeat_seconds: outcome.next_heartbeat_seconds,
        pending_plans: outcome.pending_plans,
    }))
}

#[derive(Debug, Deserialize)]
struct LogFrameRequest {
    execution_id: Uuid,
    sequence: i64,
    severity: String,
    message: String,
    emitted_at: DateTime<Utc>,
}

async fn ingest_single_log(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<LogFrameRequest>,
) -> Result<StatusCode, AppError> {
    let agent = state.repo.get_agent(ctx.agent_id).await?;
    let severity: Severity = body
        .severity
        .parse()
        .map_err(AppError::BadRequest)?;
    state
        .repo
        .ingest_execution_log(
            NewExecutionLog {
                tenant_id: agent.tenant_id,
                execution_id: body.execution_id,
                sequence: body.sequence,
                severity,
                message: body.message,
                emitted_at: body.emitted_at,
            },
            Utc::now(),
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct LogBatchRequest {
    agent_id: Uuid,
    entries: Vec<LogFrameRequest>,
}

#[derive(Debug, Serialize)]
struct LogBatchResponse {
    accepted_frames: u32,
    dropped_frames: u32,
}

async fn ingest_batch_logs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<LogBatchRequest>,
) -> Result<Json<LogBatchResponse>, AppError> {
    if body.agent_id != ctx.agent_id {
        return Err(AppError::Forbidden(
            "agent_id does not match the authenticated certificate".to_owned(),
        ));
    }
    let agent = state.repo.get_agent(ctx.agent_id).await?;
    let now = Utc::now();
    let mut accepted = 0u32;
    let mut dropped = 0u32;
    for entry in body.entries {
        let Ok(severity) = entry.severity.parse::<Severity>() else {
            dropped = dropped.saturating_add(1);
            continue;
        };
        let stored = state
            .repo
            .ingest_execution_log(
                NewExecutionLog {
                    tenant_id: agent.tenant_id,
                    execution_id: entry.execution_id,
                    sequence: entry.sequence,
                    severity,
                    message: entry.message,
                    emitted_at: entry.emitted_at,
                },
                now,
            )
            .await?;
        if stored {
            accepted = accepted.saturating_add(1);
        } else {
            dropped = dropped.saturating_add(1);
        }
    }
    Ok(Json(LogBatchResponse {
        accepted_frames: accepted,
        dropped_frames: dropped,
    }))
}

#[derive(Debug, Serialize)]
struct PlansNextResponse {
    pending_plans: Vec<LeasedPlan>,
}

async fn plans_next(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
) -> Result<Json<PlansNextResponse>, AppError> {
    let agent = state.repo.get_agent(ctx.agent_id).await?;
    let leased = plan_engine::lease_pending_plans(
        &state.repo,
        &agent,
        state.config.max_pending_plans,
        state.config.plan_lease_ttl,
    )
    .await?;
    Ok(Json(PlansNextResponse {
        pending_plans: leased,
    }))
}

#[derive(Debug, Deserialize)]
struct ExecutionResultBody {
    operation_id: String,
    ok: bool,
    error_code: Option<String>,
    message: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ExecutionsResultRequest {
    plan_id: Option<Uuid>,
    execution_id: Option<Uuid>,
    results: Vec<ExecutionResultBody>,
}

async fn executions_result(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<ExecutionsResultRequest>,
) -> Result<StatusCode, AppError> {
    let agent = state.repo.get_agent(ctx.agent_id).await?;

    let plan_id = match (body.plan_id, body.execution_id) {
        (Some(id), _) => id,
        (None, Some(execution_id)) => {
            plan_engine::resolve_plan_id(&state.repo, execution_id).await?
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "one of plan_id or execution_id is required".to_owned(),
            ))
        }
    };

    let results = body
        .results
        .into_iter()
        .map(|r| ExecutionResultInput {
            operation_id: r.operation_id,
            ok: r.ok,
            error_code: r.error_code,
            message: r.message,
            finished_at: r.finished_at,
        })
        .collect();

    plan_engine::report_plan_result(&state.repo, &agent, plan_id, results).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct UnenrollRequest {
    agent_id: Uuid,
    reason: String,
}

async fn unenroll(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<UnenrollRequest>,
) -> Result<StatusCode, AppError> {
    if body.agent_id != ctx.agent_id {
        return Err(AppError::Forbidden(
            "agent_id does not match the authenticated certificate".to_owned(),
        ));
    }
    enrollment::unenroll(&state.repo, &state.ca, &state.crl, body.agent_id, body.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RenewRequest {
    agent_id: Uuid,
    csr_pem: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct RenewResponse {
    certificate_pem: String,
    ca_chain_pem: String,
    refresh_token: String,
}

async fn renew(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Json(body): Json<RenewRequest>,
) -> Result<Json<RenewResponse>, AppError> {
    if body.agent_id != ctx.agent_id {
        return Err(AppError::Forbidden(
            "agent_id does not match the authenticated certificate".to_owned(),
        ));
    }
    let renewed = enrollment::renew(
        &state.repo,
        &state.ca,
        body.agent_id,
        &body.csr_pem,
        &body.refresh_token,
        state.config.agent_cert_ttl,
    )
    .await?;

    Ok(Json(RenewResponse {
        certificate_pem: renewed.certificate_pem,
        ca_chain_pem: renewed.ca_chain_pem,
        refresh_token: renewed.refresh_token,
    }))
}
