//! In-memory [`Repository`] implementation for tests.
//!
//! All tables live behind one [`tokio::sync::Mutex`] — coarser than the
//! row-level locking a durable backend gives you, which is exactly the
//! documented limitation in `spec.md` §9: this backend does not enforce the
//! `(tenant, idempotency_key)` unique index under true parallelism, it just
//! never releases the lock long enough for two writers to race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::RepoError;
use crate::models::*;
use crate::Repository;

#[derive(Default)]
struct Tables {
    tenants: HashMap<Uuid, Tenant>,
    sites: HashMap<Uuid, Site>,
    hosts: HashMap<Uuid, Host>,
    host_index: HashMap<(Uuid, Uuid, String), Uuid>,
    agents: HashMap<Uuid, Agent>,
    api_keys: HashMap<Uuid, ApiKey>,
    enrollment_tokens: HashMap<Uuid, EnrollmentToken>,
    plans: HashMap<Uuid, Plan>,
    idempotency_index: HashMap<(Uuid, String), Uuid>,
    plan_actions: HashMap<Uuid, Vec<PlanAction>>,
    executions: HashMap<Uuid, Execution>,
    micro_vms: HashMap<Uuid, MicroVm>,
    execution_logs: HashMap<(Uuid, Uuid, i64), ExecutionLog>,
    crl: HashMap<String, CrlEntry>,
}

/// In-memory, single-process [`Repository`]. Cheap to clone: clones share
/// the same underlying tables.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a tenant. Tenant provisioning is an external collaborator
    /// (`spec.md` §1); tests and local bootstrapping use this directly.
    pub async fn seed_tenant(&self, tenant: Tenant) {
        self.tables.lock().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn seed_site(&self, site: Site) {
        self.tables.lock().await.sites.insert(site.id, site);
    }

    pub async fn seed_api_key(&self, key: ApiKey) {
        self.tables.lock().await.api_keys.insert(key.id, key);
    }
}

fn execution_state_for_result(result_ok: bool) -> ExecutionState {
    if result_ok {
        ExecutionState::Succeeded
    } else {
        ExecutionState::Failed
    }
}

/// Status roll-up (`spec.md` §4.3): a pure function of a plan's executions.
fn roll_up_status(executions: &[&Execution]) -> PlanStatus {
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

/// Derived micro-VM transition (`spec.md` §4.5) for one terminal execution.
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

/// Applies one outcome to an execution if it is not already terminal
/// (`spec.md` invariant 5: terminal states are sticky). Returns `true` if
/// the execution was mutated.
fn apply_result_to_execution(
    execution: &mut Execution,
    ok: bool,
    error_code: Option<String>,
    message: Option<String>,
    agent_id: Uuid,
    host_id: Option<Uuid>,
    finished_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if execution.state.is_terminal() {
        return false;
    }
    execution.agent_id = Some(agent_id);
    execution.host_id = host_id;
    let completion = finished_at.unwrap_or(now);
    if execution.started_at.is_none() {
        execution.started_at = Some(completion);
    }
    if ok {
        execution.state = ExecutionState::Succeeded;
        execution.error_code = None;
        execution.error_message = None;
    } else {
        execution.state = ExecutionState::Failed;
        execution.error_code = Some(error_code.unwrap_or_else(|| "ACTION_FAILED".to_owned()));
        execution.error_message = Some(message.unwrap_or_else(|| "action failed".to_owned()));
    }
    execution.completed_at = Some(completion);
    execution.updated_at = now;
    true
}

impl Tables {
    fn apply_vm_transition_for(&mut self, execution: &Execution, now: DateTime<Utc>) {
        let Some(vm_id) = execution.vm_id else {
            return;
        };
        match derived_vm_transition(execution.state, execution.operation_type) {
            VmTransition::SetState(state) => {
                if let Some(vm) = self.micro_vms.get_mut(&vm_id) {
                    vm.state = state;
                    vm.last_transition_at = now;
                }
            }
            VmTransition::Delete => {
                self.micro_vms.remove(&vm_id);
            }
            VmTransition::Unchanged => {}
        }
    }

    fn reroll_plan(&mut self, plan_id: Uuid, now: DateTime<Utc>) -> Result<Plan, RepoError> {
        let executions: Vec<Execution> = self
            .executions
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        let refs: Vec<&Execution> = executions.iter().collect();
        let status = roll_up_status(&refs);
        let plan = self
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| RepoError::NotFound(format!("plan {plan_id} not found")))?;
        plan.status = status;
        if status.is_terminal() {
            plan.leased_by_agent_id = None;
            plan.lease_expires_at = None;
            plan.completed_at = Some(now);
        }
        Ok(plan.clone())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, RepoError> {
        let tables = self.tables.lock().await;
        tables
            .tenants
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("tenant {tenant_id} not found")))
    }

    async fn get_site(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Site, RepoError> {
        let tables = self.tables.lock().await;
        let site = tables
            .sites
            .get(&site_id)
            .ok_or_else(|| RepoError::NotFound(format!("site {site_id} not found")))?;
        if site.tenant_id != tenant_id {
            return Err(RepoError::Unauthorized(
                "site does not belong to tenant".to_owned(),
            ));
        }
        Ok(site.clone())
    }

    async fn upsert_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
        facts: Option<HostFacts>,
        now: DateTime<Utc>,
    ) -> Result<Host, RepoError> {
        let mut tables = self.tables.lock().await;
        let key = (tenant_id, site_id, hostname.to_owned());
        if let Some(existing_id) = tables.host_index.get(&key).copied() {
            let host = tables
                .hosts
                .get_mut(&existing_id)
                .ok_or_else(|| RepoError::Backend("host index out of sync".to_owned()))?;
            if let Some(facts) = facts {
                host.facts = facts;
                host.last_facts_at = Some(now);
            }
            return Ok(host.clone());
        }
        let host = Host {
            id: Uuid::new_v4(),
            tenant_id,
            site_id,
            hostname: hostname.to_owned(),
            facts: facts.unwrap_or_default(),
            last_facts_at: facts.map(|_| now),
        };
        tables.host_index.insert(key, host.id);
        tables.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, RepoError> {
        let tables = self.tables.lock().await;
        tables
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("agent {agent_id} not found")))
    }

    async fn find_active_agent_by_host(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        hostname: &str,
    ) -> Result<Option<Agent>, RepoError> {
        let tables = self.tables.lock().await;
        let Some(host_id) = tables
            .host_index
            .get(&(tenant_id, site_id, hostname.to_owned()))
            .copied()
        else {
            return Ok(None);
        };
        Ok(tables
            .agents
            .values()
            .find(|a| a.host_id == host_id && a.state != AgentState::Unenrolled)
            .cloned())
    }

    async fn create_agent(&self, new_agent: NewAgent) -> Result<Agent, RepoError> {
        let mut tables = self.tables.lock().await;
        let agent = Agent {
            id: Uuid::new_v4(),
            tenant_id: new_agent.tenant_id,
            site_id: new_agent.site_id,
            host_id: new_agent.host_id,
            state: AgentState::Online,
            cert_serial: Some(new_agent.cert_serial),
            refresh_token_hash: Some(new_agent.refresh_token_hash),
            heartbeat_seq: 0,
            last_heartbeat_at: None,
            agent_version: new_agent.agent_version,
            os: new_agent.os,
            arch: new_agent.arch,
            kernel_version: new_agent.kernel_version,
            labels: new_agent.labels,
        };
        tables.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn update_agent_identity(
        &self,
        agent_id: Uuid,
        cert_serial: Option<String>,
        refresh_token_hash: Option<String>,
        state: AgentState,
    ) -> Result<Agent, RepoError> {
        let mut tables = self.tables.lock().await;
        let agent = tables
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| RepoError::NotFound(format!("agent {agent_id} not found")))?;
        agent.cert_serial = cert_serial;
        agent.refresh_token_hash = refresh_token_hash;
        agent.state = state;
        Ok(agent.clone())
    }

    async fn sweep_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut tables = self.tables.lock().await;
        let mut transitioned = 0u64;
        let mut touched_sites: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
        for agent in tables.agents.values_mut() {
            if matches!(agent.state, AgentState::Online | AgentState::Degraded)
                && agent.last_heartbeat_at.is_none_or(|t| t < cutoff)
            {
                agent.state = AgentState::Offline;
                transitioned += 1;
            }
            touched_sites.insert(agent.site_id);
        }
        for site_id in touched_sites {
            let any_online = tables
                .agents
                .values()
                .any(|a| a.site_id == site_id && a.state == AgentState::Online);
            let max_heartbeat = tables
                .agents
                .values()
                .filter(|a| a.site_id == site_id)
                .filter_map(|a| a.last_heartbeat_at)
                .max();
            if let Some(site) = tables.sites.get_mut(&site_id) {
                site.connectivity_state = if any_online {
                    SiteConnectivity::Online
                } else {
                    SiteConnectivity::Offline
                };
                if let Some(max_heartbeat) = max_heartbeat {
                    site.last_heartbeat_at = Some(max_heartbeat);
                }
            }
        }
        Ok(transitioned)
    }

    async fn find_api_key_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .api_keys
            .values()
            .find(|k| k.token_hash == token_hash)
            .cloned())
    }

    async fn create_enrollment_token(
        &self,
        new_token: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, RepoError> {
        let mut tables = self.tables.lock().await;
        let token = EnrollmentToken {
            id: Uuid::new_v4(),
            tenant_id: new_token.tenant_id,
            site_id: new_token.site_id,
            token_hash: new_token.token_hash,
            expires_at: new_token.expires_at,
            used_at: None,
            created_at: Utc::now(),
        };
        tables.enrollment_tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn consume_enrollment_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentToken, RepoError> {
        let mut tables = self.tables.lock().await;
        let token = tables
            .enrollment_tokens
            .values_mut()
            .find(|t| t.token_hash == token_hash)
            .ok_or_else(|| RepoError::Unauthorized("enrollment token not found".to_owned()))?;
        if token.used_at.is_some() {
            return Err(RepoError::Unauthorized(
                "enrollment token already used".to_owned(),
            ));
        }
        if token.expires_at <= now {
            return Err(RepoError::Unauthorized("enrollment token expired".to_owned()));
        }
        token.used_at = Some(now);
        Ok(token.clone())
    }

    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanOutcome, RepoError> {
        let mut tables = self.tables.lock().await;

        let site = tables
            .sites
            .get(&input.site_id)
            .ok_or_else(|| RepoError::NotFound(format!("site {} not found", input.site_id)))?
            .clone();
        if site.tenant_id != input.tenant_id {
            return Err(RepoError::Unauthorized(
                "site does not belong to tenant".to_owned(),
            ));
        }

        let idem_key = (input.tenant_id, input.idempotency_key.clone());
        if let Some(&existing_plan_id) = tables.idempotency_index.get(&idem_key) {
            let plan = tables
                .plans
                .get(&existing_plan_id)
                .ok_or_else(|| RepoError::Backend("idempotency index out of sync".to_owned()))?
                .clone();
            let actions = tables
                .plan_actions
                .get(&existing_plan_id)
                .cloned()
                .unwrap_or_default();
            let executions = tables
                .executions
                .values()
                .filter(|e| e.plan_id == existing_plan_id)
                .cloned()
                .collect();
            return Ok(ApplyPlanOutcome {
                plan: PlanWithActions {
                    plan,
                    actions,
                    executions,
                },
                deduplicated: true,
            });
        }

        let next_version = tables
            .plans
            .values()
            .filter(|p| p.site_id == input.site_id)
            .map(|p| p.plan_version)
            .max()
            .unwrap_or(0)
            + 1;

        let now = Utc::now();
        let plan = Plan {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            site_id: input.site_id,
            idempotency_key: input.idempotency_key.clone(),
            client_request_id: input.client_request_id,
            plan_version: next_version,
            status: PlanStatus::Pending,
            leased_by_agent_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        let mut actions = Vec::with_capacity(input.actions.len());
        let mut executions = Vec::with_capacity(input.actions.len());
        for action in input.actions {
            let operation_id = action
                .operation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let vm_id = if action.operation_type == OperationType::Create && action.vm_id.is_none()
            {
                let vm_id = Uuid::new_v4();
                let vm = MicroVm {
                    id: vm_id,
                    tenant_id: input.tenant_id,
                    site_id: input.site_id,
                    state: MicroVmState::Creating,
                    vcpu_count: action.vcpu_count.unwrap_or(1).max(1),
                    memory_mib: action.memory_mib.unwrap_or(128).max(128),
                    host_id: None,
                    last_transition_at: now,
                    created_at: now,
                };
                tables.micro_vms.insert(vm_id, vm);
                Some(vm_id)
            } else {
                action.vm_id
            };

            let plan_action = PlanAction {
                plan_id: plan.id,
                operation_id: operation_id.clone(),
                operation_type: action.operation_type,
                vm_id,
                payload: action.payload,
            };
            let execution = Execution {
                id: Uuid::new_v4(),
                tenant_id: input.tenant_id,
                plan_id: plan.id,
                operation_id,
                operation_type: action.operation_type,
                vm_id,
                state: ExecutionState::Pending,
                error_code: None,
                error_message: None,
                agent_id: None,
                host_id: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            };
            tables.executions.insert(execution.id, execution.clone());
            actions.push(plan_action);
            executions.push(execution);
        }
        tables.plan_actions.insert(plan.id, actions.clone());
        tables.idempotency_index.insert(idem_key, plan.id);
        tables.plans.insert(plan.id, plan.clone());

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
        let tables = self.tables.lock().await;
        let plan = tables
            .plans
            .get(&plan_id)
            .ok_or_else(|| RepoError::NotFound(format!("plan {plan_id} not found")))?;
        if plan.tenant_id != tenant_id {
            return Err(RepoError::NotFound(format!("plan {plan_id} not found")));
        }
        let actions = tables.plan_actions.get(&plan_id).cloned().unwrap_or_default();
        let executions = tables
            .executions
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        Ok(PlanWithActions {
            plan: plan.clone(),
            actions,
            executions,
        })
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, RepoError> {
        let tables = self.tables.lock().await;
        tables
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("execution {execution_id} not found")))
    }

    async fn lease_pending_plans(
        &self,
        agent: &Agent,
        limit: i64,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedPlan>, RepoError> {
        let mut tables = self.tables.lock().await;

        let mut candidates: Vec<Uuid> = tables
            .plans
            .values()
            .filter(|p| {
                p.tenant_id == agent.tenant_id
                    && p.site_id == agent.site_id
                    && matches!(p.status, PlanStatus::Pending | PlanStatus::InProgress)
                    && (p.leased_by_agent_id == Some(agent.id)
                        || p.lease_expires_at.is_none()
                        || p.lease_expires_at.is_some_and(|exp| exp <= now))
            })
            .map(|p| p.id)
            .collect();
        candidates.sort_by_key(|id| tables.plans[id].created_at);

        let mut leased = Vec::new();
        for plan_id in candidates {
            if leased.len() >= limit as usize {
                break;
            }
            let has_active_execution = tables
                .executions
                .values()
                .any(|e| e.plan_id == plan_id && e.state.is_active());
            if !has_active_execution {
                continue;
            }
            let lease_expires_at = now
                + chrono::Duration::from_std(lease_ttl)
                    .map_err(|e| RepoError::InvalidInput(e.to_string()))?;
            let plan = tables
                .plans
                .get_mut(&plan_id)
                .ok_or_else(|| RepoError::Backend("plan vanished under lock".to_owned()))?;
            plan.leased_by_agent_id = Some(agent.id);
            plan.lease_expires_at = Some(lease_expires_at);
            if plan.status == PlanStatus::Pending {
                plan.status = PlanStatus::InProgress;
                if plan.started_at.is_none() {
                    plan.started_at = Some(now);
                }
            }
            let plan_snapshot = plan.clone();
            let actions: Vec<PlanAction> = tables
                .plan_actions
                .get(&plan_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|a| {
                    tables
                        .executions
                        .values()
                        .any(|e| e.plan_id == plan_id && e.operation_id == a.operation_id && e.state.is_active())
                })
                .collect();
            leased.push(LeasedPlan {
                lease_id: plan_id,
                plan: plan_snapshot,
                actions,
            });
        }
        Ok(leased)
    }

    async fn report_plan_result(
        &self,
        agent: &Agent,
        plan_id: Uuid,
        results: Vec<ExecutionResultInput>,
        now: DateTime<Utc>,
    ) -> Result<Plan, RepoError> {
        let mut tables = self.tables.lock().await;
        {
            let plan = tables
                .plans
                .get(&plan_id)
                .ok_or_else(|| RepoError::NotFound(format!("plan {plan_id} not found")))?;
            if plan.tenant_id != agent.tenant_id || plan.site_id != agent.site_id {
                return Err(RepoError::Unauthorized(
                    "agent does not own this plan's tenant/site".to_owned(),
                ));
            }
        }

        for result in results {
            let execution_id = tables
                .executions
                .values()
                .find(|e| e.plan_id == plan_id && e.operation_id == result.operation_id)
                .map(|e| e.id);
            let Some(execution_id) = execution_id else {
                continue;
            };
            let mutated_state = {
                let execution = tables
                    .executions
                    .get_mut(&execution_id)
                    .ok_or_else(|| RepoError::Backend("execution vanished under lock".to_owned()))?;
                let mutated = apply_result_to_execution(
                    execution,
                    result.ok,
                    result.error_code,
                    result.message,
                    agent.id,
                    Some(agent.host_id),
                    result.finished_at,
                    now,
                );
                mutated.then(|| execution.clone())
            };
            if let Some(execution) = mutated_state {
                tables.apply_vm_transition_for(&execution, now);
            }
        }

        tables.reroll_plan(plan_id, now)
    }

    async fn process_heartbeat(
        &self,
        input: HeartbeatInput,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, RepoError> {
        let mut tables = self.tables.lock().await;

        let agent = tables
            .agents
            .get(&input.agent_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("agent {} not found", input.agent_id)))?;
        if agent.cert_serial.as_deref() != Some(input.presented_cert_serial.as_str()) {
            return Err(RepoError::Unauthorized(
                "presented certificate serial does not match agent record".to_owned(),
            ));
        }

        {
            let agent_mut = tables
                .agents
                .get_mut(&input.agent_id)
                .ok_or_else(|| RepoError::Backend("agent vanished under lock".to_owned()))?;
            agent_mut.heartbeat_seq = agent_mut.heartbeat_seq.max(input.heartbeat_seq);
            agent_mut.state = AgentState::Online;
            agent_mut.last_heartbeat_at = Some(now);
            if input.agent_version.is_some() {
                agent_mut.agent_version = input.agent_version;
            }
            if input.os.is_some() {
                agent_mut.os = input.os;
            }
            if input.arch.is_some() {
                agent_mut.arch = input.arch;
            }
            if input.kernel_version.is_some() {
                agent_mut.kernel_version = input.kernel_version;
            }
        }

        if let Some(facts) = input.host_facts {
            if let Some(host) = tables.hosts.get_mut(&agent.host_id) {
                host.facts = facts;
                host.last_facts_at = Some(now);
            }
        }

        if let Some(site) = tables.sites.get_mut(&agent.site_id) {
            site.connectivity_state = SiteConnectivity::Online;
            site.last_heartbeat_at = Some(now);
        }

        for reported in input.micro_vms {
            let state = reported
                .state
                .parse::<MicroVmState>()
                .unwrap_or(MicroVmState::Error);
            let vcpu_count = reported.vcpu_count.unwrap_or(1).max(1);
            let memory_mib = reported.memory_mib.unwrap_or(256).max(256);
            tables
                .micro_vms
                .entry(reported.id)
                .and_modify(|vm| {
                    vm.state = state;
                    vm.vcpu_count = vcpu_count;
                    vm.memory_mib = memory_mib;
                    if reported.host_id.is_some() {
                        vm.host_id = reported.host_id;
                    }
                    vm.last_transition_at = now;
                })
                .or_insert_with(|| MicroVm {
                    id: reported.id,
                    tenant_id: agent.tenant_id,
                    site_id: agent.site_id,
                    state,
                    vcpu_count,
                    memory_mib,
                    host_id: reported.host_id,
                    last_transition_at: now,
                    created_at: now,
                });
        }

        let mut touched_plan_ids = std::collections::HashSet::new();
        for update in input.execution_updates {
            let Some(execution) = tables.executions.get(&update.execution_id).cloned() else {
                continue;
            };
            if execution.tenant_id != agent.tenant_id {
                continue;
            }
            let owning_plan_site = tables.plans.get(&execution.plan_id).map(|p| p.site_id);
            if owning_plan_site != Some(agent.site_id) {
                continue;
            }
            let mutated_execution = {
                let execution_mut = tables
                    .executions
                    .get_mut(&update.execution_id)
                    .ok_or_else(|| RepoError::Backend("execution vanished under lock".to_owned()))?;
                let mutated = apply_result_to_execution(
                    execution_mut,
                    update.ok,
                    update.error_code,
                    update.message,
                    agent.id,
                    Some(agent.host_id),
                    update.finished_at,
                    now,
                );
                mutated.then(|| execution_mut.clone())
            };
            if let Some(execution) = mutated_execution {
                tables.apply_vm_transition_for(&execution, now);
                touched_plan_ids.insert(execution.plan_id);
            }
        }

        for plan_id in &touched_plan_ids {
            tables.reroll_plan(*plan_id, now)?;
        }

        let agent = tables
            .agents
            .get(&input.agent_id)
            .cloned()
            .ok_or_else(|| RepoError::Backend("agent vanished under lock".to_owned()))?;
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
        let mut tables = self.tables.lock().await;
        let key = (log.tenant_id, log.execution_id, log.sequence);
        if tables.execution_logs.contains_key(&key) {
            return Ok(false);
        }
        tables.execution_logs.insert(
            key,
            ExecutionLog {
                tenant_id: log.tenant_id,
                execution_id: log.execution_id,
                sequence: log.sequence,
                severity: log.severity,
                message: log.message,
                emitted_at: log.emitted_at,
                ingested_at: now,
            },
        );
        Ok(true)
    }

    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>, RepoError> {
        let tables = self.tables.lock().await;
        let mut logs: Vec<ExecutionLog> = tables
            .execution_logs
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.execution_id == execution_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.sequence);
        Ok(logs)
    }

    async fn list_executions_for_site(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        status: Option<ExecutionState>,
        limit: i64,
    ) -> Result<Vec<Execution>, RepoError> {
        let tables = self.tables.lock().await;
        let plan_ids: std::collections::HashSet<Uuid> = tables
            .plans
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.site_id == site_id)
            .map(|p| p.id)
            .collect();
        let mut executions: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| plan_ids.contains(&e.plan_id))
            .filter(|e| status.is_none_or(|s| e.state == s))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables.crl.values().cloned().collect())
    }

    async fn insert_crl_entry(
        &self,
        entry: NewCrlEntry,
        now: DateTime<Utc>,
    ) -> Result<CrlEntry, RepoError> {
        let mut tables = self.tables.lock().await;
        let entry = CrlEntry {
            serial: entry.serial,
            revoked_at: now,
            reason: entry.reason,
            agent_id: entry.agent_id,
        };
        tables.crl.insert(entry.serial.clone(), entry.clone());
        Ok(entry)
    }

    async fn is_revoked_durable(&self, serial: &str) -> Result<bool, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables.crl.contains_key(serial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tenant_and_site() -> (Tenant, Site) {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tenant_id = Uuid::new_v4();
        let tenant = Tenant {
            id: tenant_id,
            name: "acme".to_owned(),
            created_at: now,
        };
        let site = Site {
            id: Uuid::new_v4(),
            tenant_id,
            name: "site-1".to_owned(),
            connectivity_state: SiteConnectivity::Offline,
            last_heartbeat_at: None,
            created_at: now,
        };
        (tenant, site)
    }

    #[tokio::test]
    async fn apply_plan_is_idempotent() {
        let repo = InMemoryRepository::new();
        let (tenant, site) = sample_tenant_and_site();
        repo.seed_tenant(tenant.clone()).await;
        repo.seed_site(site.clone()).await;

        let input = ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "plan-1".to_owned(),
            client_request_id: None,
            actions: vec![NewPlanAction {
                operation_id: None,
                operation_type: OperationType::Create,
                vm_id: None,
                vcpu_count: Some(1),
                memory_mib: Some(256),
                payload: Vec::new(),
            }],
        };

        let first = repo.apply_plan(input.clone()).await.unwrap();
        assert!(!first.deduplicated);
        let second = repo.apply_plan(input).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.plan.plan.id, second.plan.plan.id);
        assert_eq!(first.plan.executions.len(), second.plan.executions.len());
    }

    #[tokio::test]
    async fn plan_version_is_monotonic_per_site() {
        let repo = InMemoryRepository::new();
        let (tenant, site) = sample_tenant_and_site();
        repo.seed_tenant(tenant.clone()).await;
        repo.seed_site(site.clone()).await;

        for i in 0..3 {
            let outcome = repo
                .apply_plan(ApplyPlanInput {
                    tenant_id: tenant.id,
                    site_id: site.id,
                    idempotency_key: format!("plan-{i}"),
                    client_request_id: None,
                    actions: vec![NewPlanAction {
                        operation_id: None,
                        operation_type: OperationType::Execute,
                        vm_id: None,
                        vcpu_count: None,
                        memory_mib: None,
                        payload: Vec::new(),
                    }],
                })
                .await
                .unwrap();
            assert_eq!(outcome.plan.plan.plan_version, i64::from(i) + 1);
        }
    }

    #[tokio::test]
    async fn terminal_execution_state_is_sticky() {
        let repo = InMemoryRepository::new();
        let (tenant, site) = sample_tenant_and_site();
        repo.seed_tenant(tenant.clone()).await;
        repo.seed_site(site.clone()).await;
        let now = site.created_at;

        let outcome = repo
            .apply_plan(ApplyPlanInput {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![NewPlanAction {
                    operation_id: Some("op-1".to_owned()),
                    operation_type: OperationType::Execute,
                    vm_id: None,
                    vcpu_count: None,
                    memory_mib: None,
                    payload: Vec::new(),
                }],
            })
            .await
            .unwrap();
        let plan_id = outcome.plan.plan.id;

        let host = repo
            .upsert_host(tenant.id, site.id, "edge-1", None, now)
            .await
            .unwrap();
        let agent = repo
            .create_agent(NewAgent {
                tenant_id: tenant.id,
                site_id: site.id,
                host_id: host.id,
                cert_serial: "serial-1".to_owned(),
                refresh_token_hash: "hash-1".to_owned(),
                agent_version: None,
                os: None,
                arch: None,
                kernel_version: None,
                labels: HashMap::new(),
            })
            .await
            .unwrap();

        let plan = repo
            .report_plan_result(
                &agent,
                plan_id,
                vec![ExecutionResultInput {
                    operation_id: "op-1".to_owned(),
                    ok: true,
                    error_code: None,
                    message: None,
                    finished_at: None,
                }],
                now,
            )
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Succeeded);

        // A second, contradictory report must not flip the terminal state.
        let plan_after = repo
            .report_plan_result(
                &agent,
                plan_id,
                vec![ExecutionResultInput {
                    operation_id: "op-1".to_owned(),
                    ok: false,
                    error_code: Some("RETRY".to_owned()),
                    message: None,
                    finished_at: None,
                }],
                now,
            )
            .await
            .unwrap();
        assert_eq!(plan_after.status, PlanStatus::Succeeded);
    }

    #[tokio::test]
    async fn duplicate_log_frame_is_dropped() {
        let repo = InMemoryRepository::new();
        let (tenant, _site) = sample_tenant_and_site();
        let execution_id = Uuid::new_v4();
        let now = tenant.created_at;

        let first = repo
            .ingest_execution_log(
                NewExecutionLog {
                    tenant_id: tenant.id,
                    execution_id,
                    sequence: 1,
                    severity: Severity::Info,
                    message: "started".to_owned(),
                    emitted_at: now,
                },
                now,
            )
            .await
            .unwrap();
        let second = repo
            .ingest_execution_log(
                NewExecutionLog {
                    tenant_id: tenant.id,
                    execution_id,
                    sequence: 1,
                    severity: Severity::Info,
                    message: "started-retry".to_owned(),
                    emitted_at: now,
                },
                now,
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let repo = InMemoryRepository::new();
        let (tenant, _site) = sample_tenant_and_site();
        let clone = repo.clone();
        clone.seed_tenant(tenant.clone()).await;
        assert!(repo.get_tenant(tenant.id).await.is_ok());
    }
}
