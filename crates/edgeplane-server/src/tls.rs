//! Mutual TLS termination.
//!
//! Agent endpoints authenticate the transport with a certificate signed by
//! the internal CA; the CN carries the agent id (`spec.md` §6: "TLS minimum
//! version 1.3; `VerifyClientCertIfGiven`"). Client certificates are
//! optional at the transport layer — public endpoints share the same
//! listener — so verification is "if given", and [`middleware::mtls_agent_auth`]
//! enforces presence on the routes that require it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::CertificateDer;
use tower_http::add_extension::AddExtension;

use edgeplane_core::pki::CertificateAuthority;

/// The verified client certificate chain for one connection, if the client
/// presented one. Injected as a request extension by [`ClientCertAcceptor`].
#[derive(Clone, Default)]
pub struct ClientCert(pub Option<Vec<CertificateDer<'static>>>);

impl ClientCert {
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        self.0.as_deref().unwrap_or(&[])
    }
}

/// Builds the rustls server config trusting the internal CA for client
/// certificates, optionally terminating with a persistent server
/// certificate (`SERVER_CERT_FILE`/`SERVER_KEY_FILE`) or the CA's own leaf
/// otherwise.
pub fn build_server_config(
    ca: &CertificateAuthority,
    server_cert_pem: Option<&str>,
    server_key_pem: Option<&str>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    let ca_der = rustls_pemfile::certs(&mut ca.ca_chain_pem().as_bytes())
        .collect::<Result<Vec<_>, _>>()?;
    for cert in &ca_der {
        roots.add(cert.clone())?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()?;

    let (cert_pem, key_pem): (String, String) = match (server_cert_pem, server_key_pem) {
        (Some(cert), Some(key)) => (cert.to_owned(), key.to_owned()),
        _ => (ca.ca_chain_pem().to_owned(), ca.ca_key_pem().to_owned()),
    };
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in server key material"))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub fn rustls_config(config: Arc<ServerConfig>) -> RustlsConfig {
    RustlsConfig::from_config(config)
}

/// Wraps [`RustlsAcceptor`] to extract the negotiated client certificate
/// chain and attach it to the connection as a request extension, following
/// the standard `axum-server` mTLS recipe.
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = tokio_rustls::server::TlsStream<I>;
    type Service = AddExtension<S, ClientCert>;
    type Future =
        Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let client_cert = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec());
            let service = AddExtension::new(service, ClientCert(client_cert));
            Ok((stream, service))
        })
    }
}
