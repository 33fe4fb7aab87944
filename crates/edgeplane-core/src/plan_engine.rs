//! Plan engine: `ApplyPlan`, `LeasePendingPlans`, `ReportPlanResult`
//! (`spec.md` §4.1-§4.3).
//!
//! Thin validating wrappers around [`Repository`] — the actual atomic
//! algorithms live in the storage backend, since they are each a single
//! transaction. This layer's job is request-shape validation and the
//! structured logging `spec.md` §4.10 asks for.

use std::sync::Arc;
use std::time::Duration;

use edgeplane_storage::{
    Agent, ApplyPlanInput, ApplyPlanOutcome, Execution, ExecutionResultInput, LeasedPlan, Plan,
    Repository,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::PlanEngineError;

/// Applies a plan to a site (`spec.md` §4.1). Validates that at least one
/// action is present and that every action type is one the engine knows
/// about before handing off to the repository.
///
/// # Errors
///
/// Returns [`PlanEngineError::Validation`] if `input.actions` is empty, or
/// [`PlanEngineError::Repo`] if the repository call fails.
#[instrument(skip(repo, input), fields(site_id = %input.site_id, actions = input.actions.len()))]
pub async fn apply_plan(
    repo: &Arc<dyn Repository>,
    input: ApplyPlanInput,
) -> Result<ApplyPlanOutcome, PlanEngineError> {
    if input.actions.is_empty() {
        return Err(PlanEngineError::Validation(
            "a plan must contain at least one action".to_owned(),
        ));
    }
    if input.idempotency_key.trim().is_empty() {
        return Err(PlanEngineError::Validation(
            "idempotency_key must not be empty".to_owned(),
        ));
    }

    let outcome = repo.apply_plan(input).await?;
    info!(
        plan_id = %outcome.plan.plan.id,
        deduplicated = outcome.deduplicated,
        "plan applied"
    );
    Ok(outcome)
}

/// Leases pending/in-progress plans for an agent (`spec.md` §4.2).
///
/// # Errors
///
/// Returns [`PlanEngineError::Repo`] if the repository call fails.
#[instrument(skip(repo, agent), fields(agent_id = %agent.id))]
pub async fn lease_pending_plans(
    repo: &Arc<dyn Repository>,
    agent: &Agent,
    limit: i64,
    lease_ttl: Duration,
) -> Result<Vec<LeasedPlan>, PlanEngineError> {
    let now = chrono::Utc::now();
    let leased = repo.lease_pending_plans(agent, limit, lease_ttl, now).await?;
    if !leased.is_empty() {
        info!(count = leased.len(), "leased plans to agent");
    }
    Ok(leased)
}

/// Records execution outcomes for a plan (`spec.md` §4.3). `plan_id` must
/// already be resolved by the caller — from the request body directly, or
/// by looking an `execution_id` up via [`Repository::get_execution`] when
/// the caller only knows the execution.
///
/// Authorization is scoped to `(tenant, site)`, not current lease
/// ownership: a report that arrives after the lease TTL has expired (and
/// the plan has possibly been re-leased to another agent) is still
/// accepted, per `spec.md` §9's resolution of this as an open question —
/// rejecting it would strand in-flight work the agent legitimately
/// completed.
///
/// # Errors
///
/// Returns [`PlanEngineError::Validation`] if `results` is empty, or
/// [`PlanEngineError::Repo`] if the repository call fails.
#[instrument(skip(repo, agent, results), fields(agent_id = %agent.id, %plan_id))]
pub async fn report_plan_result(
    repo: &Arc<dyn Repository>,
    agent: &Agent,
    plan_id: Uuid,
    results: Vec<ExecutionResultInput>,
) -> Result<Plan, PlanEngineError> {
    if results.is_empty() {
        return Err(PlanEngineError::Validation(
            "results must not be empty".to_owned(),
        ));
    }
    let now = chrono::Utc::now();
    let plan = repo.report_plan_result(agent, plan_id, results, now).await?;
    info!(status = %plan.status, "plan result recorded");
    Ok(plan)
}

/// Resolves the owning plan id for a `/v1/executions/result` request that
/// supplies only an `execution_id`.
///
/// # Errors
///
/// Returns [`PlanEngineError::Repo`] if the execution does not exist.
pub async fn resolve_plan_id(
    repo: &Arc<dyn Repository>,
    execution_id: Uuid,
) -> Result<Uuid, PlanEngineError> {
    let execution: Execution = repo.get_execution(execution_id).await?;
    Ok(execution.plan_id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use edgeplane_storage::memory::InMemoryRepository;
    use edgeplane_storage::{NewAgent, Site, SiteConnectivity, Tenant};

    use super::*;

    /// Seeds a tenant/site pair into a fresh repository and returns it
    /// already upcast to the trait object this module's functions take.
    async fn seeded_repo() -> (Arc<dyn Repository>, Tenant, Site) {
        let concrete = InMemoryRepository::new();
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "acme".to_owned(),
            created_at: now,
        };
        let site = Site {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "site-1".to_owned(),
            connectivity_state: SiteConnectivity::Offline,
            last_heartbeat_at: None,
            created_at: now,
        };
        concrete.seed_tenant(tenant.clone()).await;
        concrete.seed_site(site.clone()).await;
        (Arc::new(concrete), tenant, site)
    }

    fn one_action() -> NewPlanAction {
        NewPlanAction {
            operation_id: None,
            operation_type: OperationType::Create,
            vm_id: None,
            vcpu_count: Some(1),
            memory_mib: Some(256),
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn apply_plan_rejects_empty_action_list() {
        let (repo, tenant, site) = seeded_repo().await;

        let result = apply_plan(
            &repo,
            ApplyPlanInput {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: Vec::new(),
            },
        )
        .await;

        assert!(matches!(result, Err(PlanEngineError::Validation(_))));
    }

    #[tokio::test]
    async fn apply_plan_rejects_blank_idempotency_key() {
        let (repo, tenant, site) = seeded_repo().await;

        let result = apply_plan(
            &repo,
            ApplyPlanInput {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "   ".to_owned(),
                client_request_id: None,
                actions: vec![one_action()],
            },
        )
        .await;

        assert!(matches!(result, Err(PlanEngineError::Validation(_))));
    }

    #[tokio::test]
    async fn report_plan_result_rejects_empty_results() {
        let (repo, tenant, site) = seeded_repo().await;
        let host = repo
            .upsert_host(tenant.id, site.id, "host-1", None, Utc::now())
            .await
            .unwrap();
        let agent = repo
            .create_agent(NewAgent {
                tenant_id: tenant.id,
                site_id: site.id,
                host_id: host.id,
                cert_serial: "serial-1".to_owned(),
                refresh_token_hash: "hash".to_owned(),
                agent_version: None,
                os: None,
                arch: None,
                kernel_version: None,
                labels: HashMap::new(),
            })
            .await
            .unwrap();

        let result = report_plan_result(&repo, &agent, Uuid::new_v4(), Vec::new()).await;

        assert!(matches!(result, Err(PlanEngineError::Validation(_))));
    }

    #[tokio::test]
    async fn resolve_plan_id_follows_execution_to_its_plan() {
        let (repo, tenant, site) = seeded_repo().await;

        let outcome = apply_plan(
            &repo,
            ApplyPlanInput {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![one_action()],
            },
        )
        .await
        .unwrap();
        let execution_id = outcome.plan.executions[0].id;

        let plan_id = resolve_plan_id(&repo, execution_id).await.unwrap();

        assert_eq!(plan_id, outcome.plan.plan.id);
    }
}
