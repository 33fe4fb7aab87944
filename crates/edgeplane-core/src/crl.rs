//! Certificate Revocation List manager (`spec.md` §4.7).
//!
//! Keeps an in-memory set of revoked serials for O(1) lookups on every
//! mTLS-authenticated request, backed by the durable store so the set
//! survives restarts. A signed CRL artifact (DER + PEM) is rebuilt whenever
//! the set changes and served to agents at the public `/v1/crl*` endpoints.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use edgeplane_storage::{NewCrlEntry, Repository};
use rcgen::{CertificateRevocationListParams, RevocationReason, RevokedCertParams, SerialNumber};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CrlError;
use crate::pki::CertificateAuthority;

struct Artifact {
    der: Vec<u8>,
    pem: String,
}

/// Tracks revoked certificate serials and republishes a signed CRL.
pub struct CrlManager {
    repo: Arc<dyn Repository>,
    revoked: RwLock<HashSet<String>>,
    artifact: RwLock<Artifact>,
}

impl CrlManager {
    /// Loads the full durable CRL into memory and builds the initial
    /// artifact. Called once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`CrlError::Repo`] if the durable CRL cannot be read.
    pub async fn load(repo: Arc<dyn Repository>, ca: &CertificateAuthority) -> Result<Self, CrlError> {
        let entries = repo.list_crl_entries().await?;
        let revoked: HashSet<String> = entries.iter().map(|e| e.serial.clone()).collect();
        let artifact = build_artifact(&revoked, ca)?;
        Ok(Self {
            repo,
            revoked: RwLock::new(revoked),
            artifact: RwLock::new(artifact),
        })
    }

    /// O(1) check against the in-memory set only. Callers that need
    /// authoritative correctness after a possible multi-node restart race
    /// should also consult [`Self::is_revoked_durable`].
    pub async fn is_revoked(&self, serial: &str) -> bool {
        self.revoked.read().await.contains(serial)
    }

    /// Durable fallback: checked when the in-memory set says "not revoked"
    /// but the caller wants a second opinion (e.g. right after this process
    /// started, before any peer's revocation has propagated).
    ///
    /// # Errors
    ///
    /// Returns [`CrlError::Repo`] if the durable store cannot be read.
    pub async fn is_revoked_durable(&self, serial: &str) -> Result<bool, CrlError> {
        Ok(self.repo.is_revoked_durable(serial).await?)
    }

    /// Revokes a serial: persists the entry, adds it to the in-memory set,
    /// and rebuilds the signed CRL artifact.
    ///
    /// # Errors
    ///
    /// Returns [`CrlError::Repo`] if the durable write fails, or
    /// [`CrlError::Signing`] if the artifact cannot be rebuilt.
    pub async fn revoke(
        &self,
        serial: String,
        reason: String,
        agent_id: Uuid,
        ca: &CertificateAuthority,
    ) -> Result<(), CrlError> {
        self.repo
            .insert_crl_entry(
                NewCrlEntry {
                    serial: serial.clone(),
                    reason,
                    agent_id,
                },
                Utc::now(),
            )
            .await?;
        self.revoked.write().await.insert(serial);
        let snapshot = self.revoked.read().await.clone();
        let artifact = build_artifact(&snapshot, ca)?;
        *self.artifact.write().await = artifact;
        Ok(())
    }

    pub async fn der(&self) -> Vec<u8> {
        self.artifact.read().await.der.clone()
    }

    pub async fn pem(&self) -> String {
        self.artifact.read().await.pem.clone()
    }
}

/// Builds a real RFC 5280 CRL signed by the internal CA, via `rcgen`'s CRL
/// support, the same signing key used to issue agent certificates.
fn build_artifact(
    revoked: &HashSet<String>,
    ca: &CertificateAuthority,
) -> Result<Artifact, CrlError> {
    let now = OffsetDateTime::now_utc();
    let revoked_certs = revoked
        .iter()
        .map(|serial| RevokedCertParams {
            serial_number: SerialNumber::from_slice(serial.as_bytes()),
            revocation_time: now,
            reason_code: Some(RevocationReason::Unspecified),
            invalidity_date: None,
        })
        .collect();

    let params = CertificateRevocationListParams {
        this_update: now,
        next_update: now + time::Duration::minutes(5),
        crl_number: SerialNumber::from_slice(now.unix_timestamp().to_le_bytes().as_slice()),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: rcgen::KeyIdMethod::Sha256,
    };

    let crl = params
        .signed_by(ca.ca_cert(), ca.ca_key())
        .map_err(|e| CrlError::Signing(format!("CRL signing failed: {e}")))?;

    Ok(Artifact {
        der: crl.der().to_vec(),
        pem: crl.pem().map_err(|e| CrlError::Signing(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use edgeplane_storage::memory::InMemoryRepository;

    use super::*;

    fn ca() -> CertificateAuthority {
        CertificateAuthority::generate("edgeplane test root").unwrap()
    }

    #[tokio::test]
    async fn fresh_manager_has_nothing_revoked() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let ca = ca();
        let manager = CrlManager::load(repo, &ca).await.unwrap();

        assert!(!manager.is_revoked("deadbeef").await);
        assert!(!manager.der().await.is_empty());
        assert!(manager.pem().await.contains("BEGIN X509 CRL"));
    }

    #[tokio::test]
    async fn revoke_updates_in_memory_set_and_rebuilds_artifact() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let ca = ca();
        let manager = CrlManager::load(Arc::clone(&repo), &ca).await.unwrap();
        let before = manager.der().await;

        manager
            .revoke(
                "abc123".to_owned(),
                "key-compromise".to_owned(),
                Uuid::new_v4(),
                &ca,
            )
            .await
            .unwrap();

        assert!(manager.is_revoked("abc123").await);
        assert!(repo.is_revoked_durable("abc123").await.unwrap());
        assert_ne!(before, manager.der().await);
    }

    #[tokio::test]
    async fn load_picks_up_durably_revoked_serials() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.insert_crl_entry(
            NewCrlEntry {
                serial: "preexisting".to_owned(),
                reason: "compromised".to_owned(),
                agent_id: Uuid::new_v4(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let ca = ca();

        let manager = CrlManager::load(repo, &ca).await.unwrap();

        assert!(manager.is_revoked("preexisting").await);
    }
}
