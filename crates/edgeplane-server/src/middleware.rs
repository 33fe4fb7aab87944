//! Authentication and rate-limiting middleware.
//!
//! Three identity surfaces are recognized (`spec.md` §6): an admin key
//! (`X-Admin-Key`, tenant provisioning — out of this crate's scope beyond
//! validating the header), an API key (`X-API-Key`, tenant-scoped control
//! operations), and mutual TLS (agent endpoints, identity carried in the
//! verified client certificate rustls hands back via `axum-server`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::ratelimit_ext::EndpointLimitsTable;
use crate::state::AppState;
use crate::tls::ClientCert;

fn unauthorized(message: &str) -> Response {
    AppError::Unauthorized(message.to_owned()).into_response()
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Identity of the API-key-authenticated caller.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub tenant_id: Uuid,
    pub api_key_hash: String,
}

/// Identity of the mTLS-authenticated agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: Uuid,
    pub cert_serial: String,
}

/// Validates `X-API-Key` against the repository and injects [`ApiKeyContext`].
pub async fn api_key_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(key) = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return unauthorized("missing X-API-Key header");
    };
    if !key.starts_with("nk_") {
        return unauthorized("malformed API key");
    }

    let hash = hash_token(&key);
    match state.repo.find_api_key_by_hash(&hash).await {
        Ok(Some(api_key)) if !api_key.revoked => {
            if let Some(expires_at) = api_key.expires_at {
                if expires_at <= chrono::Utc::now() {
                    return unauthorized("API key expired");
                }
            }
            req.extensions_mut().insert(ApiKeyContext {
                tenant_id: api_key.tenant_id,
                api_key_hash: hash,
            });
            next.run(req).await
        }
        Ok(_) => unauthorized("invalid or revoked API key"),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// Validates `X-Admin-Key` against the configured admin secret using a
/// constant-time comparison.
pub async fn admin_key_auth(req: Request, next: Next) -> Response {
    let Ok(expected) = std::env::var("ADMIN_KEY") else {
        return AppError::Internal("ADMIN_KEY is not configured".to_owned()).into_response();
    };
    let Some(presented) = req
        .headers()
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok())
    else {
        return unauthorized("missing X-Admin-Key header");
    };
    if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
        next.run(req).await
    } else {
        unauthorized("invalid admin key")
    }
}

/// Extracts the agent identity from the verified client certificate
/// `axum-server` attached to the request and checks it against the CRL
/// before the request reaches any handler — a revoked certificate is
/// rejected even before the agent row is consulted (`spec.md` §3 invariant
/// 8, P7).
pub async fn mtls_agent_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(client_cert) = req.extensions().get::<ClientCert>().cloned() else {
        return unauthorized("client certificate required");
    };
    let Some(leaf_der) = client_cert.certs().first() else {
        return unauthorized("empty client certificate chain");
    };

    let parsed = match x509_parser::parse_x509_certificate(leaf_der.as_ref()) {
        Ok((_, cert)) => cert,
        Err(_) => return unauthorized("could not parse client certificate"),
    };

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok());
    let Some(common_name) = common_name else {
        return unauthorized("client certificate has no common name");
    };
    let Ok(agent_id) = Uuid::parse_str(common_name) else {
        return unauthorized("client certificate common name is not an agent id");
    };
    // `pki.rs::issue_agent_cert` stores the ASN.1 serial as the raw ASCII bytes
    // of the plain-hex serial string, not its hex-encoded representation —
    // `raw_serial_as_string()` would re-encode those bytes as colon-separated
    // hex and never match `agent.cert_serial`. Decode back to the original
    // string instead.
    let Ok(serial) = std::str::from_utf8(parsed.raw_serial()) else {
        return unauthorized("client certificate serial is not a recognized agent serial");
    };
    let serial = serial.to_owned();

    if state.crl.is_revoked(&serial).await {
        return unauthorized("certificate has been revoked");
    }
    match state.crl.is_revoked_durable(&serial).await {
        Ok(true) => return unauthorized("certificate has been revoked"),
        Ok(false) => {}
        Err(e) => return AppError::from(e).into_response(),
    }

    req.extensions_mut().insert(AgentContext {
        agent_id,
        cert_serial: serial,
    });
    next.run(req).await
}

/// Enforces the per-`(client_id, endpoint)` token bucket, returning 429 with
/// `Retry-After` when exhausted (`spec.md` §4.9).
///
/// Runs before the auth layers (`spec.md` §2: "client → Rate Limiter →
/// Auth"), so neither [`ApiKeyContext`] nor `AgentContext` is available yet —
/// the API key and admin key hashes are recomputed from the raw header
/// values here rather than read off request extensions.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let endpoint = edgeplane_core::ratelimit::normalize_endpoint(path);

    let api_key_hash = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(hash_token);
    let admin_key_hash = req
        .headers()
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok())
        .map(hash_token);
    let forwarded_for = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let real_ip = req
        .headers()
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let remote_addr = remote_addr.ip().to_string();

    let client_id = edgeplane_core::ratelimit::client_id(
        api_key_hash.as_deref(),
        admin_key_hash.as_deref(),
        forwarded_for.as_deref(),
        real_ip.as_deref(),
        &remote_addr,
    );

    if state.rate_limiter.allow(&client_id, &endpoint).await {
        next.run(req).await
    } else {
        AppError::RateLimited {
            endpoint,
            retry_after_secs: 60,
        }
        .into_response()
    }
}

/// Resolves the configured rate-limit defaults from `spec.md` §6's table.
pub fn default_endpoint_limits() -> EndpointLimitsTable {
    EndpointLimitsTable::with_spec_defaults()
}
