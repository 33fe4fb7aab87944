//! Enroll / Renew / Unenroll (`spec.md` §4.6).
//!
//! Only a SHA-256 hash of a bearer secret (enrollment token, refresh token)
//! is ever persisted, and comparisons against a caller-presented secret use
//! [`subtle::ConstantTimeEq`] to avoid timing side channels.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edgeplane_storage::{Agent, AgentState, NewAgent, NewEnrollmentToken, Repository};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::instrument;
use uuid::Uuid;

use crate::error::EnrollmentError;
use crate::pki::CertificateAuthority;

/// Result of a successful enrollment.
pub struct Enrolled {
    pub agent: Agent,
    pub certificate_pem: String,
    pub ca_chain_pem: String,
    pub refresh_token: String,
    pub heartbeat_interval_seconds: u64,
}

/// Result of a successful certificate/refresh-token renewal.
pub struct Renewed {
    pub certificate_pem: String,
    pub ca_chain_pem: String,
    pub refresh_token: String,
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Consumes a one-time enrollment token and issues a new agent identity.
/// `tenant_id`/`site_id` are not taken as parameters — the token itself is
/// tenant+site-scoped (`spec.md` §3), so they are resolved from it.
///
/// # Errors
///
/// Returns [`EnrollmentError::InvalidToken`] if the token is unknown, used,
/// or expired. Returns [`EnrollmentError::AlreadyEnrolled`] if an active
/// agent already exists for `(tenant, site, hostname)`.
#[instrument(skip(repo, ca, enrollment_token, csr_pem))]
#[allow(clippy::too_many_arguments)]
pub async fn enroll(
    repo: &Arc<dyn Repository>,
    ca: &CertificateAuthority,
    enrollment_token: &str,
    hostname: &str,
    csr_pem: &str,
    agent_version: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    kernel_version: Option<String>,
    cert_ttl: Duration,
    heartbeat_interval: Duration,
) -> Result<Enrolled, EnrollmentError> {
    let now = Utc::now();
    let token_hash = hash_token(enrollment_token);
    let token = repo
        .consume_enrollment_token(&token_hash, now)
        .await
        .map_err(|_| EnrollmentError::InvalidToken("unknown, used, or expired".to_owned()))?;
    let tenant_id = token.tenant_id;
    let site_id = token.site_id;

    if repo
        .find_active_agent_by_host(tenant_id, site_id, hostname)
        .await?
        .is_some()
    {
        return Err(EnrollmentError::AlreadyEnrolled);
    }

    let host = repo
        .upsert_host(tenant_id, site_id, hostname, None, now)
        .await?;

    let agent_id = Uuid::new_v4();
    let ttl = chrono::Duration::from_std(cert_ttl).unwrap_or(chrono::Duration::hours(24));
    let issued = ca
        .issue_agent_cert(csr_pem, agent_id, ttl, now)
        .map_err(|e| EnrollmentError::Pki(e.to_string()))?;

    let refresh_token = generate_refresh_token();
    let refresh_token_hash = hash_token(&refresh_token);

    let agent = repo
        .create_agent(NewAgent {
            tenant_id,
            site_id,
            host_id: host.id,
            cert_serial: issued.serial,
            refresh_token_hash,
            agent_version,
            os,
            arch,
            kernel_version,
            labels: std::collections::HashMap::new(),
        })
        .await?;

    Ok(Enrolled {
        agent,
        certificate_pem: issued.certificate_pem,
        ca_chain_pem: issued.ca_chain_pem,
        refresh_token,
        heartbeat_interval_seconds: heartbeat_interval.as_secs(),
    })
}

/// Renews an agent's certificate and refresh token. The caller must already
/// have authenticated the request via mTLS using the agent's *current*
/// certificate; this additionally requires the plaintext refresh token to
/// guard against a stolen-but-not-yet-expired client certificate being
/// enough on its own to mint a fresh identity.
///
/// # Errors
///
/// Returns [`EnrollmentError::InvalidRefreshToken`] if the presented token
/// does not match the stored hash.
#[instrument(skip(repo, ca, csr_pem, refresh_token), fields(%agent_id))]
pub async fn renew(
    repo: &Arc<dyn Repository>,
    ca: &CertificateAuthority,
    agent_id: Uuid,
    csr_pem: &str,
    refresh_token: &str,
    cert_ttl: Duration,
) -> Result<Renewed, EnrollmentError> {
    let agent = repo.get_agent(agent_id).await?;
    let stored_hash = agent
        .refresh_token_hash
        .as_deref()
        .ok_or(EnrollmentError::InvalidRefreshToken)?;
    if !constant_time_eq(&hash_token(refresh_token), stored_hash) {
        return Err(EnrollmentError::InvalidRefreshToken);
    }

    let now = Utc::now();
    let ttl = chrono::Duration::from_std(cert_ttl).unwrap_or(chrono::Duration::hours(24));
    let issued = ca
        .issue_agent_cert(csr_pem, agent_id, ttl, now)
        .map_err(|e| EnrollmentError::Pki(e.to_string()))?;

    let new_refresh_token = generate_refresh_token();
    let new_refresh_token_hash = hash_token(&new_refresh_token);

    repo.update_agent_identity(
        agent_id,
        Some(issued.serial),
        Some(new_refresh_token_hash),
        AgentState::Online,
    )
    .await?;

    Ok(Renewed {
        certificate_pem: issued.certificate_pem,
        ca_chain_pem: issued.ca_chain_pem,
        refresh_token: new_refresh_token,
    })
}

/// Revokes an agent's certificate and clears its identity material. CRL and
/// durable-store errors are logged but do not abort the unenroll — this is
/// deliberately best-effort per `spec.md` §4.6.
#[instrument(skip(repo, ca, crl), fields(%agent_id, %reason))]
pub async fn unenroll(
    repo: &Arc<dyn Repository>,
    ca: &CertificateAuthority,
    crl: &crate::crl::CrlManager,
    agent_id: Uuid,
    reason: String,
) -> Result<(), EnrollmentError> {
    let agent = repo.get_agent(agent_id).await?;

    if let Some(serial) = agent.cert_serial.clone() {
        if let Err(e) = crl.revoke(serial, reason, agent_id, ca).await {
            tracing::warn!(error = %e, "failed to revoke certificate during unenroll");
        }
    }

    repo.update_agent_identity(agent_id, None, None, AgentState::Unenrolled)
        .await?;
    Ok(())
}

/// Builds a new enrollment token for a site, returning the plaintext once
/// (only its hash is stored). Provisioning callers (outside this crate's
/// scope per `spec.md` §1) are responsible for delivering it out of band.
///
/// # Errors
///
/// Returns [`EnrollmentError::Repo`] if the repository call fails.
pub async fn issue_enrollment_token(
    repo: &Arc<dyn Repository>,
    tenant_id: Uuid,
    site_id: Uuid,
    ttl: Duration,
) -> Result<String, EnrollmentError> {
    let plaintext = generate_refresh_token();
    let token_hash = hash_token(&plaintext);
    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(15));
    repo.create_enrollment_token(NewEnrollmentToken {
        tenant_id,
        site_id,
        token_hash,
        expires_at,
    })
    .await?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use edgeplane_storage::memory::InMemoryRepository;
    use edgeplane_storage::{Site, SiteConnectivity, Tenant};
    use rcgen::{CertificateParams, KeyPair};

    use super::*;

    fn csr_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    async fn seeded_repo_with_token() -> (Arc<dyn Repository>, CertificateAuthority, String, Uuid, Uuid) {
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
        let repo: Arc<dyn Repository> = Arc::new(concrete);

        let plaintext = issue_enrollment_token(
            &repo,
            tenant.id,
            site.id,
            std::time::Duration::from_secs(900),
        )
        .await
        .unwrap();

        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        (repo, ca, plaintext, tenant.id, site.id)
    }

    #[tokio::test]
    async fn enroll_consumes_token_and_issues_identity() {
        let (repo, ca, token, tenant_id, site_id) = seeded_repo_with_token().await;

        let enrolled = enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            Some("1.0.0".to_owned()),
            Some("linux".to_owned()),
            Some("x86_64".to_owned()),
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(enrolled.agent.tenant_id, tenant_id);
        assert_eq!(enrolled.agent.site_id, site_id);
        assert_eq!(enrolled.heartbeat_interval_seconds, 30);
        assert!(enrolled.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn enroll_rejects_a_reused_token() {
        let (repo, ca, token, _, _) = seeded_repo_with_token().await;
        enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let result = enroll(
            &repo,
            &ca,
            &token,
            "host-2",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(EnrollmentError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn enroll_rejects_a_second_host_enrollment_with_the_same_hostname() {
        let (repo, ca, token, tenant_id, site_id) = seeded_repo_with_token().await;
        enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let second_token = issue_enrollment_token(
            &repo,
            tenant_id,
            site_id,
            std::time::Duration::from_secs(900),
        )
        .await
        .unwrap();

        let result = enroll(
            &repo,
            &ca,
            &second_token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(EnrollmentError::AlreadyEnrolled)));
    }

    #[tokio::test]
    async fn renew_rejects_a_wrong_refresh_token() {
        let (repo, ca, token, _, _) = seeded_repo_with_token().await;
        let enrolled = enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let result = renew(
            &repo,
            &ca,
            enrolled.agent.id,
            &csr_pem(),
            "not-the-right-token",
            Duration::from_secs(3600),
        )
        .await;

        assert!(matches!(result, Err(EnrollmentError::InvalidRefreshToken)));
    }

    #[tokio::test]
    async fn renew_issues_a_fresh_certificate_and_refresh_token() {
        let (repo, ca, token, _, _) = seeded_repo_with_token().await;
        let enrolled = enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let renewed = renew(
            &repo,
            &ca,
            enrolled.agent.id,
            &csr_pem(),
            &enrolled.refresh_token,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert_ne!(renewed.refresh_token, enrolled.refresh_token);
        assert!(renewed.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn unenroll_revokes_the_certificate_and_clears_identity() {
        let (repo, ca, token, _, _) = seeded_repo_with_token().await;
        let enrolled = enroll(
            &repo,
            &ca,
            &token,
            "host-1",
            &csr_pem(),
            None,
            None,
            None,
            None,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let cert_serial = enrolled.agent.cert_serial.clone().unwrap();
        let crl = crate::crl::CrlManager::load(Arc::clone(&repo), &ca)
            .await
            .unwrap();

        unenroll(
            &repo,
            &ca,
            &crl,
            enrolled.agent.id,
            "decommissioned".to_owned(),
        )
        .await
        .unwrap();

        assert!(crl.is_revoked(&cert_serial).await);
        let agent = repo.get_agent(enrolled.agent.id).await.unwrap();
        assert_eq!(agent.state, AgentState::Unenrolled);
        assert!(agent.cert_serial.is_none());
    }
}
