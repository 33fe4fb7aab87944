//! Heartbeat ingestor (`spec.md` §4.4).
//!
//! Runs the identity check (CRL + certificate serial match) that the
//! repository's `process_heartbeat` deliberately leaves to its caller, then
//! performs the state upserts, then leases any pending plans for the same
//! agent in one follow-up call (`spec.md` §4.4 step 7).

use std::sync::Arc;
use std::time::Duration;

use edgeplane_storage::{HeartbeatInput, LeasedPlan, Repository};
use tracing::instrument;

use crate::crl::CrlManager;
use crate::error::HeartbeatError;

/// What a heartbeat response hands back to the agent.
pub struct HeartbeatOutcome {
    pub next_heartbeat_seconds: u64,
    pub pending_plans: Vec<LeasedPlan>,
}

/// Processes one heartbeat frame end to end.
///
/// # Errors
///
/// Returns [`HeartbeatError::CertRevoked`] if the presented certificate
/// serial is on the CRL (checked in-memory first, then durably as a
/// fallback for a process that just restarted). Returns
/// [`HeartbeatError::Repo`] if any repository call fails.
#[instrument(skip(repo, crl, input), fields(agent_id = %input.agent_id))]
pub async fn process_heartbeat(
    repo: &Arc<dyn Repository>,
    crl: &CrlManager,
    input: HeartbeatInput,
    heartbeat_interval: Duration,
    max_plans_per_heartbeat: i64,
    plan_lease_ttl: Duration,
) -> Result<HeartbeatOutcome, HeartbeatError> {
    if crl.is_revoked(&input.presented_cert_serial).await
        || crl.is_revoked_durable(&input.presented_cert_serial).await?
    {
        return Err(HeartbeatError::CertRevoked);
    }

    let now = chrono::Utc::now();
    let outcome = repo.process_heartbeat(input, now).await?;

    let pending_plans = repo
        .lease_pending_plans(&outcome.agent, max_plans_per_heartbeat, plan_lease_ttl, now)
        .await?;

    Ok(HeartbeatOutcome {
        next_heartbeat_seconds: heartbeat_interval.as_secs(),
        pending_plans,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use edgeplane_storage::memory::InMemoryRepository;
    use edgeplane_storage::{
        AgentState, ApplyPlanInput, NewAgent, NewPlanAction, OperationType, Site,
        SiteConnectivity, Tenant,
    };
    use uuid::Uuid;

    use crate::pki::CertificateAuthority;

    use super::*;

    async fn seeded_agent(repo: &InMemoryRepository) -> (Tenant, Site, edgeplane_storage::Agent) {
        let now: DateTime<Utc> = Utc::now();
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
        repo.seed_tenant(tenant.clone()).await;
        repo.seed_site(site.clone()).await;
        let host = repo
            .upsert_host(tenant.id, site.id, "host-1", None, now)
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
                labels: std::collections::HashMap::new(),
            })
            .await
            .unwrap();
        (tenant, site, agent)
    }

    fn heartbeat_input(agent_id: Uuid, cert_serial: &str) -> HeartbeatInput {
        HeartbeatInput {
            agent_id,
            presented_cert_serial: cert_serial.to_owned(),
            heartbeat_seq: 1,
            agent_version: None,
            os: None,
            arch: None,
            kernel_version: None,
            host_facts: None,
            micro_vms: Vec::new(),
            execution_updates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rejects_heartbeat_with_revoked_certificate() {
        let repo = InMemoryRepository::new();
        let (_, _, agent) = seeded_agent(&repo).await;
        let repo: Arc<dyn Repository> = Arc::new(repo);
        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        let crl = CrlManager::load(Arc::clone(&repo), &ca).await.unwrap();
        crl.revoke(
            "serial-1".to_owned(),
            "key-compromise".to_owned(),
            agent.id,
            &ca,
        )
        .await
        .unwrap();

        let result = process_heartbeat(
            &repo,
            &crl,
            heartbeat_input(agent.id, "serial-1"),
            Duration::from_secs(30),
            10,
            Duration::from_secs(300),
        )
        .await;

        assert!(matches!(result, Err(HeartbeatError::CertRevoked)));
    }

    #[tokio::test]
    async fn processes_heartbeat_and_leases_any_pending_plan() {
        let repo = InMemoryRepository::new();
        let (tenant, site, agent) = seeded_agent(&repo).await;
        repo.apply_plan(ApplyPlanInput {
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
        })
        .await
        .unwrap();

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        let crl = CrlManager::load(Arc::clone(&repo), &ca).await.unwrap();

        let outcome = process_heartbeat(
            &repo,
            &crl,
            heartbeat_input(agent.id, "serial-1"),
            Duration::from_secs(45),
            10,
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        assert_eq!(outcome.next_heartbeat_seconds, 45);
        assert_eq!(outcome.pending_plans.len(), 1);

        let refreshed = repo.get_agent(agent.id).await.unwrap();
        assert_eq!(refreshed.state, AgentState::Online);
        assert_eq!(refreshed.heartbeat_seq, 1);
    }
}
