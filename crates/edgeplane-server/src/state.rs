//! Shared application state for the control plane server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use edgeplane_core::crl::CrlManager;
use edgeplane_core::pki::CertificateAuthority;
use edgeplane_core::ratelimit::RateLimiter;
use edgeplane_storage::Repository;

use crate::config::ServerConfig;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub ca: Arc<CertificateAuthority>,
    pub crl: Arc<CrlManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
