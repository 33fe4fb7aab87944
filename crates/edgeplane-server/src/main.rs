//! Edge fleet control plane server entry point.
//!
//! Bootstraps the repository, internal CA, CRL manager, and rate limiter,
//! then starts the mTLS-terminated Axum HTTP server with graceful shutdown.
//! The offline sweeper and rate-limiter eviction loop run alongside the
//! server and are cancelled on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::middleware as axum_mw;
use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};

use edgeplane_core::crl::CrlManager;
use edgeplane_core::pki::CertificateAuthority;
use edgeplane_core::ratelimit::RateLimiter;
use edgeplane_core::sweeper;
use edgeplane_storage::Repository;

use edgeplane_server::config::{ServerConfig, StorageBackendType};
use edgeplane_server::middleware::{api_key_auth, mtls_agent_auth, rate_limit};
use edgeplane_server::state::AppState;
use edgeplane_server::tls::{build_server_config, rustls_config, ClientCertAcceptor};
use edgeplane_server::{hardening, middleware, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls ring crypto provider"))?;

    let config = ServerConfig::from_env();

    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "edgeplane starting");

    let state = build_app_state(config.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = {
        let repo = Arc::clone(&state.repo);
        let rx = shutdown_rx.clone();
        let sweep_interval = config.offline_sweep_interval;
        let offline_after = config.heartbeat_offline_after;
        tokio::spawn(async move {
            sweeper::run(repo, sweep_interval, offline_after, rx).await;
        })
    };

    let evictor_handle = {
        let rate_limiter = Arc::clone(&state.rate_limiter);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            rate_limit_eviction_loop(rate_limiter, &mut rx).await;
        })
    };

    let server_tls = build_server_config(
        &state.ca,
        config.server_cert_file.as_deref(),
        config.server_key_file.as_deref(),
    )
    .context("failed to build TLS server config")?;
    let acceptor = ClientCertAcceptor::new(rustls_config(server_tls));

    let app = build_router(Arc::clone(&state));

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping server");
        let _ = shutdown_tx.send(true);
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!(addr = %config.bind_addr, "edgeplane server listening");

    axum_server::bind(config.bind_addr)
        .acceptor(acceptor)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), evictor_handle).await;

    info!("edgeplane server stopped");
    Ok(())
}

/// Waits for `SIGINT` or (on Unix) `SIGTERM`.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn build_app_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let repo: Arc<dyn Repository> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(edgeplane_storage::memory::InMemoryRepository::new())
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!("using Postgres storage");
            Arc::new(
                edgeplane_storage::postgres::PostgresRepository::connect(url, 10)
                    .await
                    .context("failed to connect to Postgres")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("Postgres backend requested but feature 'postgres-backend' is not enabled");
        }
    };

    let ca = match (&config.ca_cert_file, &config.ca_key_file) {
        (Some(cert_file), Some(key_file)) => {
            let cert_pem = std::fs::read_to_string(cert_file)
                .with_context(|| format!("reading {cert_file}"))?;
            let key_pem = std::fs::read_to_string(key_file)
                .with_context(|| format!("reading {key_file}"))?;
            CertificateAuthority::from_pem(&cert_pem, &key_pem)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
        _ if config.require_persistent_pki => {
            anyhow::bail!("REQUIRE_PERSISTENT_PKI is set but CA_CERT_FILE/CA_KEY_FILE are not configured");
        }
        _ => {
            warn!("no persistent CA configured; generating an ephemeral CA (agent certs will not survive a restart)");
            CertificateAuthority::generate(&config.ca_common_name)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
    };
    let ca = Arc::new(ca);

    let crl = Arc::new(
        CrlManager::load(Arc::clone(&repo), &ca)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );

    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(middleware::default_endpoint_limits())));

    Ok(Arc::new(AppState {
        repo,
        ca,
        crl,
        rate_limiter,
        config,
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    // `route_layer` wraps outside-in in call order, so the *last* call
    // becomes the outermost (first-to-run) middleware. Rate limiting must run
    // before auth (`spec.md` §2: "client → Rate Limiter → Auth") so flood and
    // credential-stuffing traffic is throttled before any auth work runs;
    // `rate_limit` recomputes the API-/admin-key hash itself from the raw
    // header rather than depending on `ApiKeyContext`/`AgentContext`.
    let mtls_routes = routes::agent::router()
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            mtls_agent_auth,
        ))
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), rate_limit));

    let api_key_routes = routes::sites::router()
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), api_key_auth))
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), rate_limit));

    let public_routes = Router::new()
        .merge(routes::health::router())
        .merge(routes::crl::router())
        .merge(routes::enroll::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), rate_limit));

    Router::new()
        .merge(public_routes)
        .merge(mtls_routes)
        .merge(api_key_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn rate_limit_eviction_loop(rate_limiter: Arc<RateLimiter>, shutdown: &mut watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                rate_limiter.evict_idle(Duration::from_secs(10 * 60)).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("rate limiter eviction loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via DISABLE_MLOCK — the CA key may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set DISABLE_MLOCK=true for dev)");
    }
}
