//! Persistence for the edge fleet control plane.
//!
//! [`Repository`] is a capability set, not an inheritance root (per the
//! design notes in `spec.md` §9): two implementations satisfy it, a durable
//! relational store ([`postgres::PostgresRepository`], behind the
//! `postgres-backend` feature) and an in-memory test double
//! ([`memory::InMemoryRepository`]). Each method that corresponds to a named
//! algorithm in the control plane spec (`apply_plan`, `lease_pending_plans`,
//! `report_plan_result`, `process_heartbeat`) runs as one atomic unit in
//! both implementations.

pub mod error;
pub mod memory;
pub mod models;
#[cfg(feature = "postgres-backend")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use error::RepoError;
pub use models::*;

/// The persistence contract the plan engine, heartbeat ingestor, enrollment
/// flow, CRL manager, and offline sweeper are built against.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // --- Tenants / sites / hosts -----------------------------------------

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, RepoError>;

    async fn get_site(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Site, RepoError>;

    async fn upsert_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
        facts: Option<HostFacts>,
        now: DateTime<Utc>,
    ) -> Result<Host, RepoError>;

    // --- Agents -----------------------------------------------------------

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, RepoError>;

    /// Returns the currently-active (not `UNENROLLED`) agent for this host,
    /// if any. Used to reject re-enrollment of an already-enrolled host.
    async fn find_active_agent_by_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
    ) -> Result<Option<Agent>, RepoError>;

    async fn create_agent(&self, new_agent: NewAgent) -> Result<Agent, RepoError>;

    /// Replaces an agent's identity material: used by renew (new cert
    /// serial + refresh-token hash) and unenroll (both cleared).
    async fn update_agent_identity(
        &self,
        agent_id: Uuid,
        cert_serial: Option<String>,
        refresh_token_hash: Option<String>,
        state: AgentState,
    ) -> Result<Agent, RepoError>;

    /// Runs the offline sweep (`spec.md` §4.8) in one pass: marks every
    /// `ONLINE`/`DEGRADED` agent stale as of `cutoff` as `OFFLINE`, then
    /// recomputes every affected site's connectivity. Returns the number of
    /// agents transitioned.
    async fn sweep_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;

    // --- API keys / enrollment tokens -------------------------------------

    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, RepoError>;

    async fn create_enrollment_token(
        &self,
        new_token: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, RepoError>;

    /// Atomically sets `used_at` where it is still null and the token has
    /// not expired; fails if the token is unknown, used, or expired.
    async fn consume_enrollment_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentToken, RepoError>;

    // --- Plan engine --------------------------------------------------------

    /// `spec.md` §4.1 `ApplyPlan`. Atomic: either returns the plan created
    /// under a fresh `idempotency_key`, or the existing one with
    /// `deduplicated = true`.
    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanOutcome, RepoError>;

    async fn get_plan(&self, tenant_id: Uuid, plan_id: Uuid) -> Result<PlanWithActions, RepoError>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, RepoError>;

    /// `spec.md` §4.2 `LeasePendingPlans`.
    async fn lease_pending_plans(
        &self,
        agent: &Agent,
        limit: i64,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedPlan>, RepoError>;

    /// `spec.md` §4.3 `ReportPlanResult`. `plan_id` is resolved by the
    /// caller (from the request, or from an `execution_id` lookup) before
    /// this is called.
    async fn report_plan_result(
        &self,
        agent: &Agent,
        plan_id: Uuid,
        results: Vec<ExecutionResultInput>,
        now: DateTime<Utc>,
    ) -> Result<Plan, RepoError>;

    /// `spec.md` §4.4 steps 1-6: identity check is the caller's
    /// responsibility (CRL + cert serial match happen before this is
    /// called); this performs the sequence/state/host/site/VM upserts and
    /// applies `execution_updates`, atomically.
    async fn process_heartbeat(
        &self,
        input: HeartbeatInput,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, RepoError>;

    // --- Execution logs -----------------------------------------------------

    /// Returns `true` if the frame was newly stored, `false` if it was a
    /// duplicate `(tenant, execution_id, sequence)` and was dropped.
    async fn ingest_execution_log(
        &self,
        log: NewExecutionLog,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>, RepoError>;

    async fn list_executions_for_site(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        status: Option<ExecutionState>,
        limit: i64,
    ) -> Result<Vec<Execution>, RepoError>;

    // --- CRL ------------------------------------------------------------

    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, RepoError>;

    async fn insert_crl_entry(
        &self,
        entry: NewCrlEntry,
        now: DateTime<Utc>,
    ) -> Result<CrlEntry, RepoError>;

    async fn is_revoked_durable(&self, serial: &str) -> Result<bool, RepoError>;
}
