//! Public CRL distribution (`spec.md` §4.7): `GET /v1/crl` (DER) and
//! `GET /v1/crl.pem` (PEM). Unauthenticated — agents fetch this before they
//! have anything to authenticate with.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/crl", get(crl_der))
        .route("/v1/crl.pem", get(crl_pem))
}

async fn crl_der(State(state): State<Arc<AppState>>) -> Response {
    let der = state.crl.der().await;
    (
        [
            (header::CONTENT_TYPE, "application/pkix-crl"),
            (header::CACHE_CONTROL, "max-age=300"),
        ],
        der,
    )
        .into_response()
}

async fn crl_pem(State(state): State<Arc<AppState>>) -> Response {
    let pem = state.crl.pem().await;
    (
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (header::CACHE_CONTROL, "max-age=300"),
        ],
        pem,
    )
        .into_response()
}
