//! Offline sweeper (`spec.md` §4.8): a periodic background loop that marks
//! agents stale past `offline_after` as `OFFLINE` and recomputes site
//! connectivity. Single-writer — safe to run on exactly one control-plane
//! node.

use std::sync::Arc;
use std::time::Duration;

use edgeplane_storage::Repository;
use tokio::sync::watch;
use tracing::{info, warn};

/// Runs the sweep loop until `shutdown` fires. Intended to be spawned as a
/// long-lived `tokio::task`.
pub async fn run(
    repo: Arc<dyn Repository>,
    sweep_interval: Duration,
    offline_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(offline_after).unwrap_or(chrono::Duration::seconds(60));
                match repo.sweep_offline_agents(cutoff).await {
                    Ok(count) if count > 0 => info!(count, "offline sweep transitioned agents"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "offline sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("offline sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use edgeplane_storage::memory::InMemoryRepository;
    use edgeplane_storage::{AgentState, NewAgent, Site, SiteConnectivity, Tenant};
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn sweep_loop_marks_a_never_seen_agent_offline() {
        let repo = InMemoryRepository::new();
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
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(agent.state, AgentState::Online);

        let repo: Arc<dyn Repository> = Arc::new(repo);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let repo_for_task = Arc::clone(&repo);
        let handle = tokio::spawn(async move {
            run(
                repo_for_task,
                Duration::from_millis(10),
                Duration::from_secs(60),
                shutdown_rx,
            )
            .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let refreshed = repo.get_agent(agent.id).await.unwrap();
        assert_eq!(refreshed.state, AgentState::Offline);
    }
}
