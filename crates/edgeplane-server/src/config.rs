//! Server configuration for the edge fleet control plane.
//!
//! Loads configuration from environment variables with sensible defaults,
//! following `spec.md` §6's configuration table.

use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTPS listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend selection.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,

    /// How often an agent is told to heartbeat.
    pub heartbeat_interval: Duration,
    /// How long a leased plan stays exclusively held before it becomes
    /// available to other agents again.
    pub plan_lease_ttl: Duration,
    /// Maximum plans handed back in one heartbeat/lease response.
    pub max_pending_plans: i64,
    /// Agent goes `OFFLINE` after this long without a heartbeat.
    pub heartbeat_offline_after: Duration,
    /// How often the offline sweeper runs.
    pub offline_sweep_interval: Duration,
    /// Agent certificate validity period.
    pub agent_cert_ttl: Duration,
    /// Default enrollment token validity period.
    pub default_enrollment_ttl: Duration,
    /// If `true`, refuse to start without `CA_CERT_FILE`/`CA_KEY_FILE`.
    pub require_persistent_pki: bool,

    /// CA subject common name, used only when generating an ephemeral CA.
    pub ca_common_name: String,
    /// PEM file holding the CA certificate, for a persistent CA.
    pub ca_cert_file: Option<String>,
    /// PEM file holding the CA private key, for a persistent CA.
    pub ca_key_file: Option<String>,
    /// PEM file holding the server's own TLS certificate (mTLS termination).
    pub server_cert_file: Option<String>,
    /// PEM file holding the server's own TLS private key.
    pub server_key_file: Option<String>,
    /// URL advertised to agents as the CRL distribution point.
    pub crl_url: Option<String>,

    /// Default request timeout applied by middleware.
    pub request_timeout: Duration,
    /// Skip `mlockall` at startup (the CA signing key may then be swapped to
    /// disk). Development-only escape hatch.
    pub disable_mlock: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development/testing only, data lost on restart).
    Memory,
    /// `PostgreSQL` persistent storage.
    Postgres { url: String },
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(Duration::from_secs(default_secs), Duration::from_secs)
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Environment variables (`spec.md` §6):
    /// - `BIND_ADDR` — HTTPS listener address (default: `0.0.0.0:8443`)
    /// - `DATABASE_URL` — Postgres connection string; falls back to an
    ///   in-memory repository when unset (development only)
    /// - `LOG_LEVEL` — log filter (default: `info`)
    /// - `HEARTBEAT_INTERVAL` — seconds (default: `15`)
    /// - `PLAN_LEASE_TTL` — seconds (default: `45`)
    /// - `MAX_PENDING_PLANS` — integer (default: `2`)
    /// - `HEARTBEAT_OFFLINE_AFTER` — seconds (default: `60`)
    /// - `OFFLINE_SWEEP_INTERVAL` — seconds (default: `15`)
    /// - `AGENT_CERT_TTL` — seconds (default: `86400`, i.e. 24h)
    /// - `DEFAULT_ENROLLMENT_TTL` — seconds (default: `900`, i.e. 15m)
    /// - `REQUIRE_PERSISTENT_PKI` — `true`/`false` (default: `false`)
    /// - `CA_COMMON_NAME`, `CA_CERT_FILE`, `CA_KEY_FILE`
    /// - `SERVER_CERT_FILE`, `SERVER_KEY_FILE`
    /// - `CRL_URL`
    /// - `REQUEST_TIMEOUT` — seconds (default: `30`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8443)));

        let storage_backend = std::env::var("DATABASE_URL")
            .ok()
            .map_or(StorageBackendType::Memory, |url| {
                StorageBackendType::Postgres { url }
            });

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        Self {
            bind_addr,
            storage_backend,
            log_level,
            heartbeat_interval: env_duration_secs("HEARTBEAT_INTERVAL", 15),
            plan_lease_ttl: env_duration_secs("PLAN_LEASE_TTL", 45),
            max_pending_plans: std::env::var("MAX_PENDING_PLANS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            heartbeat_offline_after: env_duration_secs("HEARTBEAT_OFFLINE_AFTER", 60),
            offline_sweep_interval: env_duration_secs("OFFLINE_SWEEP_INTERVAL", 15),
            agent_cert_ttl: env_duration_secs("AGENT_CERT_TTL", 86_400),
            default_enrollment_ttl: env_duration_secs("DEFAULT_ENROLLMENT_TTL", 900),
            require_persistent_pki: std::env::var("REQUIRE_PERSISTENT_PKI")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ca_common_name: std::env::var("CA_COMMON_NAME")
                .unwrap_or_else(|_| "edgeplane-internal-ca".to_owned()),
            ca_cert_file: std::env::var("CA_CERT_FILE").ok(),
            ca_key_file: std::env::var("CA_KEY_FILE").ok(),
            server_cert_file: std::env::var("SERVER_CERT_FILE").ok(),
            server_key_file: std::env::var("SERVER_KEY_FILE").ok(),
            crl_url: std::env::var("CRL_URL").ok(),
            request_timeout: env_duration_secs("REQUEST_TIMEOUT", 30),
            disable_mlock: std::env::var("DISABLE_MLOCK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}
