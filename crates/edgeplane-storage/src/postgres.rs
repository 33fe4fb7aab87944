//! Durable [`Repository`] backed by Postgres via `sqlx`.
//!
//! Every method that corresponds to a named multi-step algorithm in
//! `spec.md` (`apply_plan`, `lease_pending_plans`, `report_plan_result`,
//! `process_heartbeat`, `sweep_offline_agents`) runs inside one
//! `pool.begin()` / `tx.commit()` pair. Lease acquisition uses
//! `SELECT ... FOR UPDATE SKIP LOCKED` so two agents racing for the same
//! plan never both win.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::RepoError;
use crate::models::*;
use crate::Repository;

/// A `Repository` backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connects and runs the (idempotent) schema bootstrap. Production
    /// deployments are expected to manage schema via a linear migration
    /// history (`spec.md` §6); this mirrors that DDL so the crate is
    /// runnable standalone.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Backend`] if the pool cannot be established or
    /// the schema cannot be created.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepoError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| RepoError::Backend(format!("connect: {e}")))?;
        let repo = Self { pool };
        repo.bootstrap_schema().await?;
        Ok(repo)
    }

    async fn bootstrap_schema(&self) -> Result<(), RepoError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS sites (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    name TEXT NOT NULL,
    connectivity_state TEXT NOT NULL,
    last_heartbeat_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS hosts (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    site_id UUID NOT NULL REFERENCES sites(id),
    hostname TEXT NOT NULL,
    cpu_cores INT NOT NULL DEFAULT 0,
    memory_bytes BIGINT NOT NULL DEFAULT 0,
    storage_bytes BIGINT NOT NULL DEFAULT 0,
    kvm_capable BOOLEAN NOT NULL DEFAULT FALSE,
    last_facts_at TIMESTAMPTZ,
    UNIQUE (tenant_id, site_id, hostname)
);
CREATE TABLE IF NOT EXISTS agents (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    site_id UUID NOT NULL,
    host_id UUID NOT NULL REFERENCES hosts(id),
    state TEXT NOT NULL,
    cert_serial TEXT,
    refresh_token_hash TEXT,
    heartbeat_seq BIGINT NOT NULL DEFAULT 0,
    last_heartbeat_at TIMESTAMPTZ,
    agent_version TEXT,
    os TEXT,
    arch TEXT,
    kernel_version TEXT,
    labels JSONB NOT NULL DEFAULT '{}'::jsonb
);
CREATE TABLE IF NOT EXISTS api_keys (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    label TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TIMESTAMPTZ,
    revoked BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollment_tokens (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    site_id UUID NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TIMESTAMPTZ NOT NULL,
    used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS plans (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    site_id UUID NOT NULL,
    idempotency_key TEXT NOT NULL,
    client_request_id TEXT,
    plan_version BIGINT NOT NULL,
    status TEXT NOT NULL,
    leased_by_agent_id UUID,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    UNIQUE (tenant_id, idempotency_key)
);
CREATE TABLE IF NOT EXISTS plan_actions (
    plan_id UUID NOT NULL REFERENCES plans(id),
    operation_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    vm_id UUID,
    payload BYTEA NOT NULL DEFAULT '',
    PRIMARY KEY (plan_id, operation_id)
);
CREATE TABLE IF NOT EXISTS executions (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    plan_id UUID NOT NULL REFERENCES plans(id),
    operation_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    vm_id UUID,
    state TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    agent_id UUID,
    host_id UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    UNIQUE (plan_id, operation_id)
);
CREATE INDEX IF NOT EXISTS executions_plan_id_idx ON executions(plan_id);
CREATE TABLE IF NOT EXISTS execution_logs (
    tenant_id UUID NOT NULL,
    execution_id UUID NOT NULL,
    sequence BIGINT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    emitted_at TIMESTAMPTZ NOT NULL,
    ingested_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant_id, execution_id, sequence)
);
CREATE TABLE IF NOT EXISTS micro_vms (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    site_id UUID NOT NULL,
    state TEXT NOT NULL,
    vcpu_count INT NOT NULL,
    memory_mib INT NOT NULL,
    host_id UUID,
    last_transition_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS crl_entries (
    serial TEXT PRIMARY KEY,
    revoked_at TIMESTAMPTZ NOT NULL,
    reason TEXT NOT NULL,
    agent_id UUID NOT NULL
);
";

fn row_to_tenant(row: &sqlx::postgres::PgRow) -> Result<Tenant, RepoError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_site(row: &sqlx::postgres::PgRow) -> Result<Site, RepoError> {
    let connectivity: String = row.try_get("connectivity_state")?;
    Ok(Site {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        connectivity_state: SiteConnectivity::from_str(&connectivity)
            .map_err(RepoError::Backend)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_host(row: &sqlx::postgres::PgRow) -> Result<Host, RepoError> {
    Ok(Host {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        site_id: row.try_get("site_id")?,
        hostname: row.try_get("hostname")?,
        facts: HostFacts {
            cpu_cores: row.try_get("cpu_cores")?,
            memory_bytes: row.try_get("memory_bytes")?,
            storage_bytes: row.try_get("storage_bytes")?,
            kvm_capable: row.try_get("kvm_capable")?,
        },
        last_facts_at: row.try_get("last_facts_at")?,
    })
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Result<Agent, RepoError> {
    let state: String = row.try_get("state")?;
    let labels_json: serde_json::Value = row.try_get("labels")?;
    let labels: HashMap<String, String> = serde_json::from_value(labels_json).unwrap_or_default();
    Ok(Agent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        site_id: row.try_get("site_id")?,
        host_id: row.try_get("host_id")?,
        state: AgentState::from_str(&state).map_err(RepoError::Backend)?,
        cert_serial: row.try_get("cert_serial")?,
        refresh_token_hash: row.try_get("refresh_token_hash")?,
        heartbeat_seq: row.try_get("heartbeat_seq")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        agent_version: row.try_get("agent_version")?,
        os: row.try_get("os")?,
        arch: row.try_get("arch")?,
        kernel_version: row.try_get("kernel_version")?,
        labels,
    })
}

fn row_to_api_key(row: &sqlx::postgres::PgRow) -> Result<ApiKey, RepoError> {
    Ok(ApiKey {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        label: row.try_get("label")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_enrollment_token(row: &sqlx::postgres::PgRow) -> Result<EnrollmentToken, RepoError> {
    Ok(EnrollmentToken {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        site_id: row.try_get("site_id")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_plan(row: &sqlx::postgres::PgRow) -> Result<Plan, RepoError> {
    let status: String = row.try_get("status")?;
    Ok(Plan {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        site_id: row.try_get("site_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        client_request_id: row.try_get("client_request_id")?,
        plan_version: row.try_get("plan_version")?,
        status: PlanStatus::from_str(&status).map_err(RepoError::Backend)?,
        leased_by_agent_id: row.try_get("leased_by_agent_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_plan_action(row: &sqlx::postgres::PgRow) -> Result<PlanAction, RepoError> {
    let op_type: String = row.try_get("operation_type")?;
    Ok(PlanAction {
        plan_id: row.try_get("plan_id")?,
        operation_id: row.try_get("operation_id")?,
        operation_type: OperationType::from_str(&op_type).map_err(RepoError::Backend)?,
        vm_id: row.try_get("vm_id")?,
        payload: row.try_get("payload")?,
    })
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, RepoError> {
    let op_type: String = row.try_get("operation_type")?;
    let state: String = row.try_get("state")?;
    Ok(Execution {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        plan_id: row.try_get("plan_id")?,
        operation_id: row.try_get("operation_id")?,
        operation_type: OperationType::from_str(&op_type).map_err(RepoError::Backend)?,
        vm_id: row.try_get("vm_id")?,
        state: ExecutionState::from_str(&state).map_err(RepoError::Backend)?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        agent_id: row.try_get("agent_id")?,
        host_id: row.try_get("host_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_execution_log(row: &sqlx::postgres::PgRow) -> Result<ExecutionLog, RepoError> {
    let severity: String = row.try_get("severity")?;
    Ok(ExecutionLog {
        tenant_id: row.try_get("tenant_id")?,
        execution_id: row.try_get("execution_id")?,
        sequence: row.try_get("sequence")?,
        severity: Severity::from_str(&severity).map_err(RepoError::Backend)?,
        message: row.try_get("message")?,
        emitted_at: row.try_get("emitted_at")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn row_to_micro_vm(row: &sqlx::postgres::PgRow) -> Result<MicroVm, RepoError> {
    let state: String = row.try_get("state")?;
    Ok(MicroVm {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        site_id: row.try_get("site_id")?,
        state: MicroVmState::from_str(&state).map_err(RepoError::Backend)?,
        vcpu_count: row.try_get("vcpu_count")?,
        memory_mib: row.try_get("memory_mib")?,
        host_id: row.try_get("host_id")?,
        last_transition_at: row.try_get("last_transition_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_crl_entry(row: &sqlx::postgres::PgRow) -> Result<CrlEntry, RepoError> {
    Ok(CrlEntry {
        serial: row.try_get("serial")?,
        revoked_at: row.try_get("revoked_at")?,
        reason: row.try_get("reason")?,
        agent_id: row.try_get("agent_id")?,
    })
}

/// Status roll-up (`spec.md` §4.3): a pure function of a plan's executions.
fn roll_up_status(executions: &[Execution]) -> PlanStatus {
    if executions.iter().any(|e| e.state == ExecutionState::Failed) {
        return PlanStatus::Failed;
    }
    if !executions.iter().any(|e| e.state.is_active()) {
        return PlanStatus::Succeeded;
    }
    if executions
        .iter()
        .any(|e| e.state == ExecutionState::InProgress)
        || (executions
            .iter()
            .any(|e| e.state == ExecutionState::Succeeded)
            && executions.iter().any(|e| e.state.is_active()))
    {
        return PlanStatus::InProgress;
    }
    PlanStatus::Pending
}

enum VmTransition {
    SetState(MicroVmState),
    Delete,
    Unchanged,
}

fn derived_vm_transition(state: ExecutionState, op: OperationType) -> VmTransition {
    match (state, op) {
        (ExecutionState::Failed, _) => VmTransition::SetState(MicroVmState::Error),
        (ExecutionState::Succeeded, OperationType::Create) => {
            VmTransition::SetState(MicroVmState::Stopped)
        }
        (ExecutionState::Succeeded, OperationType::Start) => {
            VmTransition::SetState(MicroVmState::Running)
        }
        (ExecutionState::Succeeded, OperationType::Stop) => {
            VmTransition::SetState(MicroVmState::Stopped)
        }
        (ExecutionState::Succeeded, OperationType::Delete) => VmTransition::Delete,
        _ => VmTransition::Unchanged,
    }
}

async fn apply_vm_transition(
    tx: &mut sqlx::PgConnection,
    execution: &Execution,
    now: DateTime<Utc>,
) -> Result<(), RepoError> {
    let Some(vm_id) = execution.vm_id else {
        return Ok(());
    };
    match derived_vm_transition(execution.state, execution.operation_type) {
        VmTransition::SetState(state) => {
            sqlx::query(
                "UPDATE micro_vms SET state = $1, last_transition_at = $2 WHERE id = $3",
            )
            .bind(state.as_str())
            .bind(now)
            .bind(vm_id)
            .execute(tx)
            .await?;
        }
        VmTransition::Delete => {
            sqlx::query("DELETE FROM micro_vms WHERE id = $1")
                .bind(vm_id)
                .execute(tx)
                .await?;
        }
        VmTransition::Unchanged => {}
    }
    Ok(())
}

/// Applies one outcome to an execution row if it is not already terminal,
/// returning the updated execution if a mutation occurred.
async fn apply_result_and_fetch(
    tx: &mut sqlx::PgConnection,
    execution_id: Uuid,
    ok: bool,
    error_code: Option<String>,
    message: Option<String>,
    agent_id: Uuid,
    host_id: Uuid,
    finished_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<Execution>, RepoError> {
    let row = sqlx::query("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let execution = row_to_execution(&row)?;
    if execution.state.is_terminal() {
        return Ok(None);
    }

    let completion = finished_at.unwrap_or(now);
    let started_at = execution.started_at.unwrap_or(completion);
    let (state, error_code, error_message) = if ok {
        (ExecutionState::Succeeded, None, None)
    } else {
        (
            ExecutionState::Failed,
            Some(error_code.unwrap_or_else(|| "ACTION_FAILED".to_owned())),
            Some(message.unwrap_or_else(|| "action failed".to_owned())),
        )
    };

    sqlx::query(
        "UPDATE executions SET state = $1, error_code = $2, error_message = $3, agent_id = $4, \
         host_id = $5, started_at = $6, completed_at = $7, updated_at = $8 WHERE id = $9",
    )
    .bind(state.as_str())
    .bind(&error_code)
    .bind(&error_message)
    .bind(agent_id)
    .bind(host_id)
    .bind(started_at)
    .bind(completion)
    .bind(now)
    .bind(execution_id)
    .execute(&mut *tx)
    .await?;

    Ok(Some(Execution {
        state,
        error_code,
        error_message,
        agent_id: Some(agent_id),
        host_id: Some(host_id),
        started_at: Some(started_at),
        completed_at: Some(completion),
        updated_at: now,
        ..execution
    }))
}

async fn reroll_plan(
    tx: &mut sqlx::PgConnection,
    plan_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Plan, RepoError> {
    let rows = sqlx::query("SELECT * FROM executions WHERE plan_id = $1")
        .bind(plan_id)
        .fetch_all(&mut *tx)
        .await?;
    let executions = rows
        .iter()
        .map(row_to_execution)
        .collect::<Result<Vec<_>, _>>()?;
    let status = roll_up_status(&executions);

    let row = if status.is_terminal() {
        sqlx::query(
            "UPDATE plans SET status = $1, leased_by_agent_id = NULL, lease_expires_at = NULL, \
             completed_at = $2 WHERE id = $3 RETURNING *",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(plan_id)
        .fetch_one(&mut *tx)
        .await?
    } else {
        sqlx::query("UPDATE plans SET status = $1 WHERE id = $2 RETURNING *")
            .bind(status.as_str())
            .bind(plan_id)
            .fetch_one(&mut *tx)
            .await?
    };
    row_to_plan(&row)
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, RepoError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("tenant {tenant_id} not found")))?;
        row_to_tenant(&row)
    }

    async fn get_site(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Site, RepoError> {
        let row = sqlx::query("SELECT * FROM sites WHERE id = $1")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("site {site_id} not found")))?;
        let site = row_to_site(&row)?;
        if site.tenant_id != tenant_id {
            return Err(RepoError::Unauthorized(
                "site does not belong to tenant".to_owned(),
            ));
        }
        Ok(site)
    }

    async fn upsert_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
        facts: Option<HostFacts>,
        now: DateTime<Utc>,
    ) -> Result<Host, RepoError> {
        let facts = facts.unwrap_or_default();
        let row = sqlx::query(
            "INSERT INTO hosts (id, tenant_id, site_id, hostname, cpu_cores, memory_bytes, \
             storage_bytes, kvm_capable, last_facts_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (tenant_id, site_id, hostname) DO UPDATE SET \
             cpu_cores = EXCLUDED.cpu_cores, memory_bytes = EXCLUDED.memory_bytes, \
             storage_bytes = EXCLUDED.storage_bytes, kvm_capable = EXCLUDED.kvm_capable, \
             last_facts_at = EXCLUDED.last_facts_at \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(site_id)
        .bind(hostname)
        .bind(facts.cpu_cores)
        .bind(facts.memory_bytes)
        .bind(facts.storage_bytes)
        .bind(facts.kvm_capable)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row_to_host(&row)
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, RepoError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("agent {agent_id} not found")))?;
        row_to_agent(&row)
    }

    async fn find_active_agent_by_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
    ) -> Result<Option<Agent>, RepoError> {
        let row = sqlx::query(
            "SELECT a.* FROM agents a JOIN hosts h ON a.host_id = h.id \
             WHERE h.tenant_id = $1 AND h.site_id = $2 AND h.hostname = $3 \
             AND a.state <> 'UNENROLLED'",
        )
        .bind(tenant_id)
        .bind(site_id)
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn create_agent(&self, new_agent: NewAgent) -> Result<Agent, RepoError> {
        let labels_json = serde_json::to_value(&new_agent.labels)
            .map_err(|e| RepoError::InvalidInput(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO agents (id, tenant_id, site_id, host_id, state, cert_serial, \
             refresh_token_hash, heartbeat_seq, agent_version, os, arch, kernel_version, labels) \
             VALUES ($1, $2, $3, $4, 'ONLINE', $5, $6, 0, $7, $8, $9, $10, $11) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_agent.tenant_id)
        .bind(new_agent.site_id)
        .bind(new_agent.host_id)
        .bind(new_agent.cert_serial)
        .bind(new_agent.refresh_token_hash)
        .bind(new_agent.agent_version)
        .bind(new_agent.os)
        .bind(new_agent.arch)
        .bind(new_agent.kernel_version)
        .bind(labels_json)
        .fetch_one(&self.pool)
        .await?;
        row_to_agent(&row)
    }

    async fn update_agent_identity(
        &self,
        agent_id: Uuid,
        cert_serial: Option<String>,
        refresh_token_hash: Option<String>,
        state: AgentState,
    ) -> Result<Agent, RepoError> {
        let row = sqlx::query(
            "UPDATE agents SET cert_serial = $1, refresh_token_hash = $2, state = $3 \
             WHERE id = $4 RETURNING *",
        )
        .bind(cert_serial)
        .bind(refresh_token_hash)
        .bind(state.as_str())
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepoError::NotFound(format!("agent {agent_id} not found")))?;
        row_to_agent(&row)
    }

    async fn sweep_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE agents SET state = 'OFFLINE' \
             WHERE state IN ('ONLINE', 'DEGRADED') \
             AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let transitioned = result.rows_affected();

        let site_rows = sqlx::query("SELECT DISTINCT site_id FROM agents")
            .fetch_all(&mut *tx)
            .await?;
        for row in site_rows {
            let site_id: Uuid = row.try_get("site_id")?;
            let any_online: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM agents WHERE site_id = $1 AND state = 'ONLINE')",
            )
            .bind(site_id)
            .fetch_one(&mut *tx)
            .await?;
            let max_heartbeat: Option<DateTime<Utc>> =
                sqlx::query_scalar("SELECT MAX(last_heartbeat_at) FROM agents WHERE site_id = $1")
                    .bind(site_id)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query(
                "UPDATE sites SET connectivity_state = $1, \
                 last_heartbeat_at = COALESCE($2, last_heartbeat_at) WHERE id = $3",
            )
            .bind(if any_online {
                SiteConnectivity::Online.as_str()
            } else {
                SiteConnectivity::Offline.as_str()
            })
            .bind(max_heartbeat)
            .bind(site_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(transitioned)
    }

    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, RepoError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_api_key).transpose()
    }

    async fn create_enrollment_token(
        &self,
        new_token: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, RepoError> {
        let row = sqlx::query(
            "INSERT INTO enrollment_tokens (id, tenant_id, site_id, token_hash, expires_at, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_token.tenant_id)
        .bind(new_token.site_id)
        .bind(new_token.token_hash)
        .bind(new_token.expires_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        row_to_enrollment_token(&row)
    }

    async fn consume_enrollment_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentToken, RepoError> {
        let row = sqlx::query(
            "UPDATE enrollment_tokens SET used_at = $1 \
             WHERE token_hash = $2 AND used_at IS NULL AND expires_at > $1 RETURNING *",
        )
        .bind(now)
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            RepoError::Unauthorized("enrollment token unknown, used, or expired".to_owned())
        })?;
        row_to_enrollment_token(&row)
    }

    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanOutcome, RepoError> {
        let mut tx = self.pool.begin().await?;

        let site_row = sqlx::query("SELECT * FROM sites WHERE id = $1 FOR UPDATE")
            .bind(input.site_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("site {} not found", input.site_id)))?;
        let site = row_to_site(&site_row)?;
        if site.tenant_id != input.tenant_id {
            return Err(RepoError::Unauthorized(
                "site does not belong to tenant".to_owned(),
            ));
        }

        if let Some(existing) = sqlx::query("SELECT * FROM plans WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(input.tenant_id)
            .bind(&input.idempotency_key)
            .fetch_optional(&mut *tx)
            .await?
        {
            let plan = row_to_plan(&existing)?;
            let action_rows = sqlx::query("SELECT * FROM plan_actions WHERE plan_id = $1")
                .bind(plan.id)
                .fetch_all(&mut *tx)
                .await?;
            let actions = action_rows
                .iter()
                .map(row_to_plan_action)
                .collect::<Result<Vec<_>, _>>()?;
            let execution_rows = sqlx::query("SELECT * FROM executions WHERE plan_id = $1")
                .bind(plan.id)
                .fetch_all(&mut *tx)
                .await?;
            let executions = execution_rows
                .iter()
                .map(row_to_execution)
                .collect::<Result<Vec<_>, _>>()?;
            tx.commit().await?;
            return Ok(ApplyPlanOutcome {
                plan: PlanWithActions {
                    plan,
                    actions,
                    executions,
                },
                deduplicated: true,
            });
        }

        let next_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(plan_version), 0) + 1 FROM plans WHERE site_id = $1",
        )
        .bind(input.site_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        let plan_id = Uuid::new_v4();
        let plan_row = sqlx::query(
            "INSERT INTO plans (id, tenant_id, site_id, idempotency_key, client_request_id, \
             plan_version, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7) RETURNING *",
        )
        .bind(plan_id)
        .bind(input.tenant_id)
        .bind(input.site_id)
        .bind(&input.idempotency_key)
        .bind(&input.client_request_id)
        .bind(next_version)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let plan = row_to_plan(&plan_row)?;

        let mut actions = Vec::with_capacity(input.actions.len());
        let mut executions = Vec::with_capacity(input.actions.len());
        for action in input.actions {
            let operation_id = action
                .operation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let vm_id = if action.operation_type == OperationType::Create && action.vm_id.is_none()
            {
                let vm_id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO micro_vms (id, tenant_id, site_id, state, vcpu_count, \
                     memory_mib, last_transition_at, created_at) \
                     VALUES ($1, $2, $3, 'CREATING', $4, $5, $6, $6)",
                )
                .bind(vm_id)
                .bind(input.tenant_id)
                .bind(input.site_id)
                .bind(action.vcpu_count.unwrap_or(1).max(1))
                .bind(action.memory_mib.unwrap_or(128).max(128))
                .bind(now)
                .execute(&mut *tx)
                .await?;
                Some(vm_id)
            } else {
                action.vm_id
            };

            sqlx::query(
                "INSERT INTO plan_actions (plan_id, operation_id, operation_type, vm_id, payload) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(plan_id)
            .bind(&operation_id)
            .bind(action.operation_type.as_str())
            .bind(vm_id)
            .bind(&action.payload)
            .execute(&mut *tx)
            .await?;

            let execution_id = Uuid::new_v4();
            let execution_row = sqlx::query(
                "INSERT INTO executions (id, tenant_id, plan_id, operation_id, operation_type, \
                 vm_id, state, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7, $7) RETURNING *",
            )
            .bind(execution_id)
            .bind(input.tenant_id)
            .bind(plan_id)
            .bind(&operation_id)
            .bind(action.operation_type.as_str())
            .bind(vm_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            actions.push(PlanAction {
                plan_id,
                operation_id,
                operation_type: action.operation_type,
                vm_id,
                payload: action.payload,
            });
            executions.push(row_to_execution(&execution_row)?);
        }

        tx.commit().await?;
        Ok(ApplyPlanOutcome {
            plan: PlanWithActions {
                plan,
                actions,
                executions,
            },
            deduplicated: false,
        })
    }

    async fn get_plan(&self, tenant_id: Uuid, plan_id: Uuid) -> Result<PlanWithActions, RepoError> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("plan {plan_id} not found")))?;
        let plan = row_to_plan(&row)?;
        if plan.tenant_id != tenant_id {
            return Err(RepoError::NotFound(format!("plan {plan_id} not found")));
        }
        let action_rows = sqlx::query("SELECT * FROM plan_actions WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;
        let actions = action_rows
            .iter()
            .map(row_to_plan_action)
            .collect::<Result<Vec<_>, _>>()?;
        let execution_rows = sqlx::query("SELECT * FROM executions WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;
        let executions = execution_rows
            .iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PlanWithActions {
            plan,
            actions,
            executions,
        })
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, RepoError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("execution {execution_id} not found")))?;
        row_to_execution(&row)
    }

    async fn lease_pending_plans(
        &self,
        agent: &Agent,
        limit: i64,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedPlan>, RepoError> {
        let mut tx = self.pool.begin().await?;

        let candidate_rows = sqlx::query(
            "SELECT * FROM plans WHERE tenant_id = $1 AND site_id = $2 \
             AND status IN ('PENDING', 'IN_PROGRESS') \
             AND (leased_by_agent_id = $3 OR lease_expires_at IS NULL OR lease_expires_at <= $4) \
             ORDER BY created_at ASC \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(agent.tenant_id)
        .bind(agent.site_id)
        .bind(agent.id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let lease_expires_at = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| RepoError::InvalidInput(e.to_string()))?;

        let mut leased = Vec::new();
        for row in candidate_rows {
            if leased.len() >= limit as usize {
                break;
            }
            let plan = row_to_plan(&row)?;
            let active_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM executions WHERE plan_id = $1 \
                 AND state IN ('PENDING', 'IN_PROGRESS')",
            )
            .bind(plan.id)
            .fetch_one(&mut *tx)
            .await?;
            if active_count == 0 {
                continue;
            }

            let new_status = if plan.status == PlanStatus::Pending {
                PlanStatus::InProgress
            } else {
                plan.status
            };
            let updated_row = sqlx::query(
                "UPDATE plans SET leased_by_agent_id = $1, lease_expires_at = $2, status = $3, \
                 started_at = COALESCE(started_at, $4) WHERE id = $5 RETURNING *",
            )
            .bind(agent.id)
            .bind(lease_expires_at)
            .bind(new_status.as_str())
            .bind(now)
            .bind(plan.id)
            .fetch_one(&mut *tx)
            .await?;
            let plan = row_to_plan(&updated_row)?;

            let action_rows = sqlx::query(
                "SELECT pa.* FROM plan_actions pa JOIN executions e \
                 ON e.plan_id = pa.plan_id AND e.operation_id = pa.operation_id \
                 WHERE pa.plan_id = $1 AND e.state IN ('PENDING', 'IN_PROGRESS')",
            )
            .bind(plan.id)
            .fetch_all(&mut *tx)
            .await?;
            let actions = action_rows
                .iter()
                .map(row_to_plan_action)
                .collect::<Result<Vec<_>, _>>()?;

            leased.push(LeasedPlan {
                lease_id: plan.id,
                plan,
                actions,
            });
        }

        tx.commit().await?;
        Ok(leased)
    }

    async fn report_plan_result(
        &self,
        agent: &Agent,
        plan_id: Uuid,
        results: Vec<ExecutionResultInput>,
        now: DateTime<Utc>,
    ) -> Result<Plan, RepoError> {
        let mut tx = self.pool.begin().await?;

        let plan_row = sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("plan {plan_id} not found")))?;
        let plan = row_to_plan(&plan_row)?;
        if plan.tenant_id != agent.tenant_id || plan.site_id != agent.site_id {
            return Err(RepoError::Unauthorized(
                "agent does not own this plan's tenant/site".to_owned(),
            ));
        }

        for result in results {
            let execution_id: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM executions WHERE plan_id = $1 AND operation_id = $2",
            )
            .bind(plan_id)
            .bind(&result.operation_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(execution_id) = execution_id else {
                continue;
            };
            if let Some(execution) = apply_result_and_fetch(
                &mut tx,
                execution_id,
                result.ok,
                result.error_code,
                result.message,
                agent.id,
                agent.host_id,
                result.finished_at,
                now,
            )
            .await?
            {
                apply_vm_transition(&mut tx, &execution, now).await?;
            }
        }

        let plan = reroll_plan(&mut tx, plan_id, now).await?;
        tx.commit().await?;
        Ok(plan)
    }

    async fn process_heartbeat(
        &self,
        input: HeartbeatInput,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, RepoError> {
        let mut tx = self.pool.begin().await?;

        let agent_row = sqlx::query("SELECT * FROM agents WHERE id = $1 FOR UPDATE")
            .bind(input.agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("agent {} not found", input.agent_id)))?;
        let agent = row_to_agent(&agent_row)?;
        if agent.cert_serial.as_deref() != Some(input.presented_cert_serial.as_str()) {
            return Err(RepoError::Unauthorized(
                "presented certificate serial does not match agent record".to_owned(),
            ));
        }

        let new_seq = agent.heartbeat_seq.max(input.heartbeat_seq);
        let updated_agent_row = sqlx::query(
            "UPDATE agents SET heartbeat_seq = $1, state = 'ONLINE', last_heartbeat_at = $2, \
             agent_version = COALESCE($3, agent_version), os = COALESCE($4, os), \
             arch = COALESCE($5, arch), kernel_version = COALESCE($6, kernel_version) \
             WHERE id = $7 RETURNING *",
        )
        .bind(new_seq)
        .bind(now)
        .bind(input.agent_version)
        .bind(input.os)
        .bind(input.arch)
        .bind(input.kernel_version)
        .bind(input.agent_id)
        .fetch_one(&mut *tx)
        .await?;
        let mut agent = row_to_agent(&updated_agent_row)?;

        if let Some(facts) = input.host_facts {
            sqlx::query(
                "UPDATE hosts SET cpu_cores = $1, memory_bytes = $2, storage_bytes = $3, \
                 kvm_capable = $4, last_facts_at = $5 WHERE id = $6",
            )
            .bind(facts.cpu_cores)
            .bind(facts.memory_bytes)
            .bind(facts.storage_bytes)
            .bind(facts.kvm_capable)
            .bind(now)
            .bind(agent.host_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE sites SET connectivity_state = 'ONLINE', last_heartbeat_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(agent.site_id)
        .execute(&mut *tx)
        .await?;

        for reported in input.micro_vms {
            let state = reported
                .state
                .parse::<MicroVmState>()
                .unwrap_or(MicroVmState::Error);
            let vcpu_count = reported.vcpu_count.unwrap_or(1).max(1);
            let memory_mib = reported.memory_mib.unwrap_or(256).max(256);
            sqlx::query(
                "INSERT INTO micro_vms (id, tenant_id, site_id, state, vcpu_count, memory_mib, \
                 host_id, last_transition_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
                 ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, \
                 vcpu_count = EXCLUDED.vcpu_count, memory_mib = EXCLUDED.memory_mib, \
                 host_id = COALESCE(EXCLUDED.host_id, micro_vms.host_id), \
                 last_transition_at = EXCLUDED.last_transition_at",
            )
            .bind(reported.id)
            .bind(agent.tenant_id)
            .bind(agent.site_id)
            .bind(state.as_str())
            .bind(vcpu_count)
            .bind(memory_mib)
            .bind(reported.host_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let mut touched_plan_ids = std::collections::HashSet::new();
        for update in input.execution_updates {
            if let Some(execution) = apply_result_and_fetch(
                &mut tx,
                update.execution_id,
                update.ok,
                update.error_code,
                update.message,
                agent.id,
                agent.host_id,
                update.finished_at,
                now,
            )
            .await?
            {
                if execution.tenant_id == agent.tenant_id {
                    let plan_site_id: Option<Uuid> =
                        sqlx::query_scalar("SELECT site_id FROM plans WHERE id = $1")
                            .bind(execution.plan_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    if plan_site_id == Some(agent.site_id) {
                        apply_vm_transition(&mut tx, &execution, now).await?;
                        touched_plan_ids.insert(execution.plan_id);
                    }
                }
            }
        }

        for plan_id in &touched_plan_ids {
            reroll_plan(&mut tx, *plan_id, now).await?;
        }

        agent.heartbeat_seq = new_seq;
        tx.commit().await?;
        Ok(HeartbeatOutcome {
            agent,
            touched_plan_ids: touched_plan_ids.into_iter().collect(),
        })
    }

    async fn ingest_execution_log(
        &self,
        log: NewExecutionLog,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "INSERT INTO execution_logs (tenant_id, execution_id, sequence, severity, message, \
             emitted_at, ingested_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, execution_id, sequence) DO NOTHING",
        )
        .bind(log.tenant_id)
        .bind(log.execution_id)
        .bind(log.sequence)
        .bind(log.severity.as_str())
        .bind(&log.message)
        .bind(log.emitted_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>, RepoError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_logs WHERE tenant_id = $1 AND execution_id = $2 \
             ORDER BY sequence ASC",
        )
        .bind(tenant_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_execution_log).collect()
    }

    async fn list_executions_for_site(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        status: Option<ExecutionState>,
        limit: i64,
    ) -> Result<Vec<Execution>, RepoError> {
        let rows = sqlx::query(
            "SELECT e.* FROM executions e JOIN plans p ON e.plan_id = p.id \
             WHERE p.tenant_id = $1 AND p.site_id = $2 \
             AND ($3::TEXT IS NULL OR e.state = $3) \
             ORDER BY e.created_at ASC LIMIT $4",
        )
        .bind(tenant_id)
        .bind(site_id)
        .bind(status.map(ExecutionState::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, RepoError> {
        let rows = sqlx::query("SELECT * FROM crl_entries")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_crl_entry).collect()
    }

    async fn insert_crl_entry(
        &self,
        entry: NewCrlEntry,
        now: DateTime<Utc>,
    ) -> Result<CrlEntry, RepoError> {
        let row = sqlx::query(
            "INSERT INTO crl_entries (serial, revoked_at, reason, agent_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (serial) DO UPDATE SET revoked_at = EXCLUDED.revoked_at \
             RETURNING *",
        )
        .bind(&entry.serial)
        .bind(now)
        .bind(&entry.reason)
        .bind(entry.agent_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_crl_entry(&row)
    }

    async fn is_revoked_durable(&self, serial: &str) -> Result<bool, RepoError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM crl_entries WHERE serial = $1)")
                .bind(serial)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}
