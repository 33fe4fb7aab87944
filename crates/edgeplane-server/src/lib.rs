//! Edge fleet control plane HTTP server.
//!
//! Wires together the core library, storage backend, and HTTP routes into a
//! running Axum server terminated over mutual TLS.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod ratelimit_ext;
pub mod routes;
pub mod state;
pub mod tls;
