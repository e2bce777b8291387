//! TLS interception of CONNECT tunnels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::upgrade::Upgraded;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::crypto::ring;
use rustls::ServerConfig;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use super::connect_target;
use crate::body;
use crate::ca::{CertificateAuthority, LeafCertificate};
use crate::context::Context;
use crate::error::FilterError;
use crate::filter::{FilterResult, ProxyRequest, RequestFilter};
use crate::handler::{ClientAddr, TlsInfo};
use crate::listener::{Accepted, ListenerHandle};

/// Default client-facing handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request filter that terminates TLS for CONNECT requests to selected ports.
///
/// The client gets `200` for its CONNECT, then a TLS handshake presenting a
/// leaf for the requested host. The decrypted stream is injected back into
/// the listener so its requests run through the whole pipeline as `https`.
/// Requests this filter does not intercept are passed on untouched.
pub struct InterceptFilter {
    ca: Arc<CertificateAuthority>,
    ports: Vec<u16>,
    handshake_timeout: Duration,
}

impl InterceptFilter {
    /// Intercepts CONNECT requests whose target port is in `ports`, signing
    /// leaves with `ca` and giving each client `handshake_timeout` to finish
    /// its TLS handshake.
    pub fn new(
        ca: Arc<CertificateAuthority>,
        ports: impl Into<Vec<u16>>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            ca,
            ports: ports.into(),
            handshake_timeout,
        }
    }

    /// Ports whose tunnels are decrypted.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

#[async_trait]
impl RequestFilter for InterceptFilter {
    fn name(&self) -> &'static str {
        "InterceptFilter"
    }

    async fn request(&self, ctx: Context, mut req: ProxyRequest) -> FilterResult<ProxyRequest> {
        let host = match connect_target(&req) {
            Some((host, port)) if self.ports.contains(&port) => host,
            _ => return Ok((ctx, Some(req))),
        };

        let leaf = self.issue_leaf(&host).await?;
        let acceptor = TlsAcceptor::from(server_config(&leaf)?);

        let peer = req
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0)
            .unwrap_or_else(|| ctx.listener().local_addr());
        let upgrade = hyper::upgrade::on(&mut req);

        ctx.response_writer().write(
            Response::builder()
                .status(StatusCode::OK)
                .body(body::empty())
                .map_err(|e| FilterError::Http(e.to_string()))?,
        )?;

        let listener = ctx.listener().clone();
        let handshake_timeout = self.handshake_timeout;
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!("CONNECT {} upgrade failed: {}", host, e);
                    return;
                }
            };

            let stream = match handshake(acceptor, upgraded, handshake_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("TLS handshake with client for {} failed: {}", host, e);
                    return;
                }
            };

            let server_name = stream
                .get_ref()
                .1
                .server_name()
                .map(str::to_string)
                .unwrap_or(host);
            tracing::debug!("Intercepting {} for {}", server_name, peer);

            reenter(
                &listener,
                Accepted {
                    io: Box::new(stream),
                    peer,
                    tls: Some(TlsInfo {
                        server_name: Some(server_name),
                    }),
                },
            );
        });

        Ok((ctx, None))
    }
}

impl InterceptFilter {
    /// Signs (or fetches the cached) leaf on the blocking pool.
    async fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>, FilterError> {
        let ca = self.ca.clone();
        let host = host.to_string();
        let leaf = tokio::task::spawn_blocking(move || ca.issue_leaf(&host))
            .await
            .map_err(FilterError::custom)??;
        Ok(leaf)
    }
}

fn server_config(leaf: &LeafCertificate) -> Result<Arc<ServerConfig>, FilterError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(leaf.chain().to_vec(), leaf.private_key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn handshake(
    acceptor: TlsAcceptor,
    upgraded: Upgraded,
    deadline: Duration,
) -> std::io::Result<TlsStream<TokioIo<Upgraded>>> {
    timeout(deadline, acceptor.accept(TokioIo::new(upgraded)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

fn reenter(listener: &ListenerHandle, conn: Accepted) {
    if let Err(conn) = listener.inject(conn) {
        tracing::warn!(
            "Listener closed, dropping intercepted connection from {}",
            conn.peer
        );
    }
}
