//! Dual-mode outbound dialer.
//!
//! [`Dialer::dial`] opens a plain TCP connection, [`Dialer::dial_tls`] opens
//! one and runs a TLS client handshake over it. Both share one timeout and
//! one keep-alive interval, so a TLS dial has the same total budget as a
//! plain one.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{DialError, ProxyError};

/// Default connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Dialer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Budget for connect, plus handshake in TLS mode.
    pub timeout_ms: u64,
    /// TCP keep-alive interval on outbound sockets.
    pub keep_alive_ms: u64,
    /// Accept any upstream certificate.
    pub insecure_skip_verify: bool,
    /// Hosts whose upstream certificates are not verified.
    pub skip_verify_hosts: Vec<String>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            keep_alive_ms: DEFAULT_KEEP_ALIVE.as_millis() as u64,
            insecure_skip_verify: false,
            skip_verify_hosts: Vec::new(),
        }
    }
}

/// Outbound connector with plain and TLS modes.
#[derive(Clone)]
pub struct Dialer {
    timeout: Duration,
    keep_alive: Duration,
    verified: Arc<ClientConfig>,
    unverified: Arc<ClientConfig>,
    insecure_skip_verify: bool,
    skip_verify_hosts: Arc<HashSet<String>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("skip_verify_hosts", &self.skip_verify_hosts.len())
            .finish()
    }
}

impl Dialer {
    /// Builds a dialer, loading the platform trust store for verified TLS.
    pub fn new(config: &DialerConfig) -> Result<Self, ProxyError> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            tracing::warn!("Failed to load a native root certificate: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::debug!("Loaded {} native roots ({} ignored)", added, ignored);

        Self::with_roots(config, roots)
    }

    /// Builds a dialer that verifies upstream certificates against `roots`.
    pub fn with_roots(config: &DialerConfig, roots: RootCertStore) -> Result<Self, ProxyError> {
        let provider = Arc::new(ring::default_provider());

        let mut verified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        verified.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut unverified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth();
        unverified.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            timeout: Duration::from_millis(config.timeout_ms),
            keep_alive: Duration::from_millis(config.keep_alive_ms),
            verified: Arc::new(verified),
            unverified: Arc::new(unverified),
            insecure_skip_verify: config.insecure_skip_verify,
            skip_verify_hosts: Arc::new(
                config
                    .skip_verify_hosts
                    .iter()
                    .map(|h| h.to_ascii_lowercase())
                    .collect(),
            ),
        })
    }

    /// Shared connect/handshake budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Keep-alive interval applied to outbound sockets.
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Returns true when certificates presented by `host` are checked.
    pub fn verifies(&self, host: &str) -> bool {
        !self.insecure_skip_verify && !self.skip_verify_hosts.contains(&host.to_ascii_lowercase())
    }

    /// Opens a plain TCP connection to `host:port`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let addr = format!("{}:{}", host, port);
        let stream = timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DialError::Timeout {
                addr: addr.clone(),
                after: self.timeout,
            })?
            .map_err(|source| DialError::Connect {
                addr: addr.clone(),
                source,
            })?;

        self.tune(&stream);
        tracing::debug!("Dialed {}", addr);
        Ok(stream)
    }

    /// Opens a TCP connection to `host:port` and completes a TLS handshake.
    ///
    /// Connect and handshake together must finish within the dial timeout.
    pub async fn dial_tls(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>, DialError> {
        let addr = format!("{}:{}", host, port);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| DialError::InvalidServerName(host.to_string()))?;
        let config = if self.verifies(host) {
            self.verified.clone()
        } else {
            self.unverified.clone()
        };

        let handshake = async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|source| DialError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            self.tune(&stream);
            TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|source| DialError::Handshake {
                    addr: addr.clone(),
                    source,
                })
        };

        let stream = timeout(self.timeout, handshake)
            .await
            .map_err(|_| DialError::Timeout {
                addr: addr.clone(),
                after: self.timeout,
            })??;

        tracing::debug!("Dialed {} over TLS", addr);
        Ok(stream)
    }

    fn tune(&self, stream: &TcpStream) {
        let _ = stream.set_nodelay(true);
        let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!("Failed to set keep-alive: {}", e);
        }
    }
}

/// Connection produced by the dialer in either mode.
pub enum MaybeTlsStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl From<TcpStream> for MaybeTlsStream {
    fn from(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }
}

impl From<TlsStream<TcpStream>> for MaybeTlsStream {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        Self::Tls(Box::new(stream))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepts any server certificate. Used for hosts configured to skip checks.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_dialer(timeout_ms: u64) -> Dialer {
        let config = DialerConfig {
            timeout_ms,
            ..DialerConfig::default()
        };
        Dialer::with_roots(&config, RootCertStore::empty()).unwrap()
    }

    #[test]
    fn default_config_matches_constants() {
        let config = DialerConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.keep_alive_ms, 30_000);
        assert!(!config.insecure_skip_verify);
    }

    #[test]
    fn skip_verify_hosts_are_case_insensitive() {
        let config = DialerConfig {
            skip_verify_hosts: vec!["Internal.Test".to_string()],
            ..DialerConfig::default()
        };
        let dialer = Dialer::with_roots(&config, RootCertStore::empty()).unwrap();
        assert!(!dialer.verifies("internal.test"));
        assert!(dialer.verifies("a.test"));
    }

    #[test]
    fn insecure_skip_verify_applies_to_all_hosts() {
        let config = DialerConfig {
            insecure_skip_verify: true,
            ..DialerConfig::default()
        };
        let dialer = Dialer::with_roots(&config, RootCertStore::empty()).unwrap();
        assert!(!dialer.verifies("a.test"));
    }

    #[tokio::test]
    async fn dial_connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = test_dialer(1_000);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = dialer.dial("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = test_dialer(1_000).dial("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
    }

    #[tokio::test]
    async fn dial_tls_times_out_when_server_never_answers() {
        // Accepts the TCP connection but never speaks TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = test_dialer(200).dial_tls("localhost", port).await.unwrap_err();
        assert!(matches!(err, DialError::Timeout { .. }));
    }
}
