//! API-key-authenticated control operations: submit plans, list
//! executions, fetch execution logs (`spec.md` §4.1, §6).

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use edgeplane_core::plan_engine;
use edgeplane_storage::{ApplyPlanInput, ExecutionState, NewPlanAction, OperationType, PlanAction, PlanWithActions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::ApiKeyContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sites/{site_id}/plans", post(submit_plan))
        .route("/sites/{site_id}/executions", get(list_executions))
        .route("/executions/{execution_id}/logs", get(execution_logs))
}

#[derive(Debug, Deserialize)]
struct PlanActionBody {
    operation_id: Option<String>,
    operation_type: OperationType,
    vm_id: Option<Uuid>,
    vcpu_count: Option<i32>,
    memory_mib: Option<i32>,
    #[serde(default, with = "base64_payload")]
    payload: Vec<u8>,
}

mod base64_payload {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Option::deserialize(deserializer)?.unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }

    #[allow(dead_code)]
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

#[derive(Debug, Deserialize)]
struct SubmitPlanRequest {
    idempotency_key: String,
    client_request_id: Option<String>,
    actions: Vec<PlanActionBody>,
}

#[derive(Debug, Serialize)]
struct SubmitPlanResponse {
    plan_id: Uuid,
    status: String,
    deduplicated: bool,
    actions: Vec<PlanActionView>,
}

#[derive(Debug, Serialize)]
struct PlanActionView {
    operation_id: String,
    operation_type: OperationType,
    vm_id: Option<Uuid>,
}

async fn submit_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(site_id): Path<Uuid>,
    Json(body): Json<SubmitPlanRequest>,
) -> Result<Json<SubmitPlanResponse>, AppError> {
    state.repo.get_site(ctx.tenant_id, site_id).await?;

    let actions = body
        .actions
        .into_iter()
        .map(|a| NewPlanAction {
            operation_id: a.operation_id,
            operation_type: a.operation_type,
            vm_id: a.vm_id,
            vcpu_count: a.vcpu_count,
            memory_mib: a.memory_mib,
            payload: a.payload,
        })
        .collect();

    let outcome = plan_engine::apply_plan(
        &state.repo,
        ApplyPlanInput {
            tenant_id: ctx.tenant_id,
            site_id,
            idempotency_key: body.idempotency_key,
            client_request_id: body.client_request_id,
            actions,
        },
    )
    .await?;

    let PlanWithActions { plan, actions, .. } = outcome.plan;
    Ok(Json(SubmitPlanResponse {
        plan_id: plan.id,
        status: plan.status.as_str().to_owned(),
        deduplicated: outcome.deduplicated,
        actions: actions.into_iter().map(plan_action_view).collect(),
    }))
}

fn plan_action_view(action: PlanAction) -> PlanActionView {
    PlanActionView {
        operation_id: action.operation_id,
        operation_type: action.operation_type,
        vm_id: action.vm_id,
    }
}

#[derive(Debug, Deserialize)]
struct ListExecutionsQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(site_id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Vec<edgeplane_storage::Execution>>, AppError> {
    state.repo.get_site(ctx.tenant_id, site_id).await?;

    let status = query
        .status
        .map(|s| s.parse::<ExecutionState>())
        .transpose()
        .map_err(AppError::BadRequest)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);

    let executions = state
        .repo
        .list_executions_for_site(ctx.tenant_id, site_id, status, limit)
        .await?;
    Ok(Json(executions))
}

async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Vec<edgeplane_storage::ExecutionLog>>, AppError> {
    let execution = state.repo.get_execution(execution_id).await?;
    if execution.tenant_id != ctx.tenant_id {
        return Err(AppError::NotFound("execution not found".to_owned()));
    }
    let logs = state
        .repo
        .list_execution_logs(ctx.tenant_id, execution_id)
        .await?;
    Ok(Json(logs))
}
