//! Internal certificate authority for agent mTLS identities.
//!
//! Issues leaf certificates bound to an agent's id as the subject common
//! name (`spec.md` §4.6, §6: "CN=agent id"). Uses `rcgen` for pure-Rust
//! certificate generation and signing.

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EnrollmentError;

/// A freshly-signed leaf certificate plus the chain needed to validate it.
pub struct IssuedCert {
    pub certificate_pem: String,
    pub ca_chain_pem: String,
    pub serial: String,
    pub expires_at: DateTime<Utc>,
}

/// Holds the CA's signing key and certificate for the process lifetime.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Builds a CA from an operator-supplied certificate and key (PEM).
    /// Used when `CA_CERT_FILE`/`CA_KEY_FILE` are configured so the CA
    /// survives process restarts (`spec.md` §6 `REQUIRE_PERSISTENT_PKI`).
    ///
    /// # Errors
    ///
    /// Returns [`EnrollmentError::Pki`] if the PEM cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, EnrollmentError> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| EnrollmentError::Pki(format!("parsing CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| EnrollmentError::Pki(format!("parsing CA certificate: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| EnrollmentError::Pki(format!("reconstructing CA certificate: {e}")))?;
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_owned(),
        })
    }

    /// Generates a fresh, in-memory, self-signed root CA. Used when no
    /// persistent CA material is configured — fine for development, but
    /// every restart invalidates outstanding agent certificates.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollmentError::Pki`] if key or certificate generation
    /// fails.
    pub fn generate(common_name: &str) -> Result<Self, EnrollmentError> {
        let ca_key = KeyPair::generate()
            .map_err(|e| EnrollmentError::Pki(format!("CA key generation: {e}")))?;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| EnrollmentError::Pki(format!("CA params: {e}")))?;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| EnrollmentError::Pki(format!("CA self-sign: {e}")))?;
        let ca_cert_pem = ca_cert.pem();
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
        })
    }

    pub fn ca_chain_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert(&self) -> &rcgen::Certificate {
        &self.ca_cert
    }

    pub fn ca_key(&self) -> &KeyPair {
        &self.ca_key
    }

    /// PEM-encoded CA private key. Used only to terminate TLS with the CA's
    /// own leaf when no dedicated server certificate is configured
    /// (development mode).
    pub fn ca_key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }

    /// Signs a client-submitted CSR, overriding the subject to `CN=agent_id`
    /// regardless of what the CSR requested, and setting validity to `ttl`
    /// from `now`.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollmentError::Pki`] if the CSR cannot be parsed or
    /// signing fails.
    pub fn issue_agent_cert(
        &self,
        csr_pem: &str,
        agent_id: Uuid,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedCert, EnrollmentError> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| EnrollmentError::Pki(format!("parsing CSR: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, agent_id.to_string());
        csr_params.params.distinguished_name = dn;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

        let serial = Uuid::new_v4().simple().to_string();
        csr_params.params.serial_number =
            Some(SerialNumber::from_slice(serial.as_bytes()));

        let expires_at = now + ttl;
        csr_params.params.not_before = to_offset_date_time(now);
        csr_params.params.not_after = to_offset_date_time(expires_at);

        let cert = csr_params
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| EnrollmentError::Pki(format!("signing CSR: {e}")))?;

        Ok(IssuedCert {
            certificate_pem: cert.pem(),
            ca_chain_pem: self.ca_cert_pem.clone(),
            serial,
            expires_at,
        })
    }
}

fn to_offset_date_time(ts: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .replace_nanosecond(ts.timestamp_subsec_nanos())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn generated_ca_reloads_from_pem() {
        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        let cert_pem = ca.ca_chain_pem().to_owned();
        let key_pem = ca.ca_key_pem();

        let reloaded = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(reloaded.ca_chain_pem(), cert_pem);
    }

    #[test]
    fn issue_agent_cert_overrides_csr_subject_and_sets_ttl() {
        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        let agent_id = Uuid::new_v4();
        let now = Utc::now();
        let ttl = chrono::Duration::hours(12);

        let issued = ca
            .issue_agent_cert(&csr_pem(), agent_id, ttl, now)
            .unwrap();

        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(issued.ca_chain_pem, ca.ca_chain_pem());
        assert!(!issued.serial.is_empty());
        assert_eq!(issued.expires_at.timestamp(), (now + ttl).timestamp());
    }

    #[test]
    fn each_issued_cert_gets_a_distinct_serial() {
        let ca = CertificateAuthority::generate("edgeplane test root").unwrap();
        let now = Utc::now();
        let ttl = chrono::Duration::hours(1);

        let first = ca
            .issue_agent_cert(&csr_pem(), Uuid::new_v4(), ttl, now)
            .unwrap();
        let second = ca
            .issue_agent_cert(&csr_pem(), Uuid::new_v4(), ttl, now)
            .unwrap();

        assert_ne!(first.serial, second.serial);
    }
}
