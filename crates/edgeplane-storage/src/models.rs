//! Row types for the fleet control plane's data model.
//!
//! These mirror `spec.md` §3 directly: a tenant owns sites, sites own hosts
//! and agents, plans are site-scoped batches of actions each with exactly
//! one execution, and micro-VMs are derived state driven by execution
//! outcomes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical isolation boundary. Immutable identity once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres-backend", derive(sqlx::FromRow))]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Connectivity state of a [`Site`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteConnectivity {
    Online,
    Offline,
}

impl SiteConnectivity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }
}

impl std::str::FromStr for SiteConnectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            other => Err(format!("unknown site connectivity state: {other}")),
        }
    }
}

impl std::fmt::Display for SiteConnectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical location under a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub connectivity_state: SiteConnectivity,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Capacity facts reported by a host's agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostFacts {
    pub cpu_cores: i32,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
    pub kvm_capable: bool,
}

/// A machine within a site, unique by `(tenant, site, hostname)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub hostname: String,
    pub facts: HostFacts,
    pub last_facts_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    Online,
    Degraded,
    Offline,
    Unenrolled,
}

impl AgentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
            Self::Unenrolled => "UNENROLLED",
        }
    }
}

impl std::str::FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(Self::Online),
            "DEGRADED" => Ok(Self::Degraded),
            "OFFLINE" => Ok(Self::Offline),
            "UNENROLLED" => Ok(Self::Unenrolled),
            other => Err(format!("unknown agent state: {other}")),
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent software instance running on a [`Host`].
///
/// `refresh_token_hash` and `cert_serial` are `None` once unenrolled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub state: AgentState,
    pub cert_serial: Option<String>,
    #[serde(skip)]
    pub refresh_token_hash: Option<String>,
    pub heartbeat_seq: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub agent_version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub kernel_version: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Tenant-scoped bearer credential for control-plane API operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    #[serde(skip)]
    pub token_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Tenant+site-scoped, one-time, time-limited credential for initial
/// agent provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    #[serde(skip)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a [`Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl PlanStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown plan status: {other}")),
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The enumerated set of operations a [`PlanAction`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Start,
    Stop,
    Delete,
    Pause,
    Resume,
    Snapshot,
    Execute,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Delete => "DELETE",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Snapshot => "SNAPSHOT",
            Self::Execute => "EXECUTE",
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "START" => Ok(Self::Start),
            "STOP" => Ok(Self::Stop),
            "DELETE" => Ok(Self::Delete),
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "SNAPSHOT" => Ok(Self::Snapshot),
            "EXECUTE" => Ok(Self::Execute),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A site-scoped work batch: `spec.md` §3 `Plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub client_request_id: Option<String>,
    pub plan_version: i64,
    pub status: PlanStatus,
    pub leased_by_agent_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One operation inside a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAction {
    pub plan_id: Uuid,
    pub operation_id: String,
    pub operation_type: OperationType,
    pub vm_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

/// Lifecycle state of an [`Execution`]. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ExecutionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown execution state: {other}")),
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one per [`PlanAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub operation_id: String,
    pub operation_type: OperationType,
    pub vm_id: Option<Uuid>,
    pub state: ExecutionState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub agent_id: Option<Uuid>,
    pub host_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Severity of an [`ExecutionLog`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown log severity: {other}")),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(tenant, execution_id, sequence)` uniquely identifies a log frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub sequence: i64,
    pub severity: Severity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

/// Lifecycle state of a [`MicroVm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MicroVmState {
    Creating,
    Stopped,
    Running,
    Deleting,
    Error,
}

impl MicroVmState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Deleting => "DELETING",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for MicroVmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATING" => Ok(Self::Creating),
            "STOPPED" => Ok(Self::Stopped),
            "RUNNING" => Ok(Self::Running),
            "DELETING" => Ok(Self::Deleting),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown micro-VM state: {other}")),
        }
    }
}

impl std::fmt::Display for MicroVmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(tenant, site, id)` addresses a micro-VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroVm {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub state: MicroVmState,
    pub vcpu_count: i32,
    pub memory_mib: i32,
    pub host_id: Option<Uuid>,
    pub last_transition_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// `(serial, revoked_at, reason, agent_id)` — one revoked certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
    pub agent_id: Uuid,
}

/// A plan and the subset of its actions a lease call should deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanWithActions {
    pub plan: Plan,
    pub actions: Vec<PlanAction>,
    pub executions: Vec<Execution>,
}

/// Input to [`crate::Repository::apply_plan`]: `spec.md` §4.1.
#[derive(Debug, Clone)]
pub struct ApplyPlanInput {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub client_request_id: Option<String>,
    pub actions: Vec<NewPlanAction>,
}

/// One action as submitted by a client, before `operation_id` assignment.
#[derive(Debug, Clone)]
pub struct NewPlanAction {
    pub operation_id: Option<String>,
    pub operation_type: OperationType,
    pub vm_id: Option<Uuid>,
    pub vcpu_count: Option<i32>,
    pub memory_mib: Option<i32>,
    pub payload: Vec<u8>,
}

/// The outcome of `apply_plan`: either a freshly created plan, or the
/// existing one found under the same idempotency key.
#[derive(Debug, Clone)]
pub struct ApplyPlanOutcome {
    pub plan: PlanWithActions,
    pub deduplicated: bool,
}

/// One agent-reported outcome for an [`Execution`]: `spec.md` §4.3.
#[derive(Debug, Clone)]
pub struct ExecutionResultInput {
    pub operation_id: String,
    pub ok: bool,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A newly enrolled agent: `spec.md` §4.6 `Enroll`.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub cert_serial: String,
    pub refresh_token_hash: String,
    pub agent_version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub kernel_version: Option<String>,
    pub labels: HashMap<String, String>,
}

/// A reported micro-VM in a heartbeat payload, before normalization.
#[derive(Debug, Clone)]
pub struct ReportedMicroVm {
    pub id: Uuid,
    pub state: String,
    pub vcpu_count: Option<i32>,
    pub memory_mib: Option<i32>,
    pub host_id: Option<Uuid>,
}

/// A log frame as submitted, before dedup: `spec.md` §3 `ExecutionLog`.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub sequence: i64,
    pub severity: Severity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

/// A fresh enrollment token to be stored as a hash: `spec.md` §4.6.
#[derive(Debug, Clone)]
pub struct NewEnrollmentToken {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// A fresh CRL entry: `spec.md` §3 `CRL Entry`.
#[derive(Debug, Clone)]
pub struct NewCrlEntry {
    pub serial: String,
    pub reason: String,
    pub agent_id: Uuid,
}

/// One execution-state update embedded directly in a heartbeat payload.
///
/// Unlike [`ExecutionResultInput`] (scoped by an enclosing `plan_id` at
/// `/v1/executions/result`), a heartbeat carries no enclosing plan, so each
/// update names its execution directly.
#[derive(Debug, Clone)]
pub struct HeartbeatExecutionUpdate {
    pub execution_id: Uuid,
    pub ok: bool,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Input to `process_heartbeat`: `spec.md` §4.4, steps 1-6.
#[derive(Debug, Clone)]
pub struct HeartbeatInput {
    pub agent_id: Uuid,
    pub presented_cert_serial: String,
    pub heartbeat_seq: i64,
    pub agent_version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub kernel_version: Option<String>,
    pub host_facts: Option<HostFacts>,
    pub micro_vms: Vec<ReportedMicroVm>,
    pub execution_updates: Vec<HeartbeatExecutionUpdate>,
}

/// Result of `process_heartbeat`: the up-to-date agent record plus the set
/// of plan ids touched by `execution_updates`, so the caller can run
/// `lease_pending_plans` next (`spec.md` §4.4 step 7).
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub agent: Agent,
    pub touched_plan_ids: Vec<Uuid>,
}

/// Result of leasing plans for one agent: `spec.md` §4.2.
///
/// `lease_id` is the opaque handle returned to the agent; it is the plan id
/// itself, not a distinct identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedPlan {
    pub lease_id: Uuid,
    pub plan: Plan,
    pub actions: Vec<PlanAction>,
}
