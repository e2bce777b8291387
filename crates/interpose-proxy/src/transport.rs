//! Default outbound transport.
//!
//! Executes one request over one freshly dialed upstream connection. Nothing
//! is pooled and no compression is negotiated, so every proxied exchange is
//! observable by the filters on its own.

use std::time::Duration;

use hyper::client::conn::http1;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::body::{self, ProxyBody};
use crate::dialer::{Dialer, MaybeTlsStream};
use crate::error::TransportError;

/// Default bound on waiting for upstream response headers.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// How long to wait for response headers once the request is sent.
    pub response_header_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            response_header_timeout_ms: DEFAULT_RESPONSE_HEADER_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Fetches requests from upstream servers through a [`Dialer`].
#[derive(Debug, Clone)]
pub struct Transport {
    dialer: Dialer,
    response_header_timeout: Duration,
}

impl Transport {
    /// Creates a transport over `dialer`.
    pub fn new(dialer: Dialer, config: &TransportConfig) -> Self {
        Self {
            dialer,
            response_header_timeout: Duration::from_millis(config.response_header_timeout_ms),
        }
    }

    /// The dialer used for upstream connections.
    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Sends `req` to the host named in its absolute URL and returns the
    /// upstream response with its body still streaming.
    pub async fn round_trip(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let uri = req.uri().clone();
        let host = uri
            .host()
            .ok_or_else(|| TransportError::MissingHost(uri.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let io: MaybeTlsStream = match uri.scheme_str() {
            Some("http") => self
                .dialer
                .dial(&host, uri.port_u16().unwrap_or(80))
                .await?
                .into(),
            Some("https") => self
                .dialer
                .dial_tls(&host, uri.port_u16().unwrap_or(443))
                .await?
                .into(),
            other => {
                return Err(TransportError::UnsupportedScheme(
                    other.unwrap_or_default().to_string(),
                ))
            }
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Upstream connection error: {}", e);
            }
        });

        prepare_outbound(&mut req, &uri);

        let response = timeout(self.response_header_timeout, sender.send_request(req))
            .await
            .map_err(|_| TransportError::ResponseHeaderTimeout(self.response_header_timeout))??;

        Ok(response.map(body::boxed))
    }
}

/// Rewrites an absolute-form request for a direct upstream connection.
fn prepare_outbound(req: &mut Request<ProxyBody>, uri: &Uri) {
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }
    req.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));

    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = origin_form;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use rustls::RootCertStore;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    use crate::dialer::DialerConfig;

    fn test_transport(response_header_timeout_ms: u64) -> Transport {
        let dialer = Dialer::with_roots(&DialerConfig::default(), RootCertStore::empty()).unwrap();
        Transport::new(
            dialer,
            &TransportConfig {
                response_header_timeout_ms,
            },
        )
    }

    /// Upstream that echoes the request line and Host header it received.
    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let host = req
                            .headers()
                            .get(HOST)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let connection = req
                            .headers()
                            .get(CONNECTION)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = format!("{} {} host={}", req.method(), req.uri(), host);
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("x-upstream-connection", connection)
                                .header("set-cookie", "a=1")
                                .header("set-cookie", "b=2")
                                .body(body::full(body))
                                .unwrap(),
                        )
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn round_trip_sends_origin_form_with_host() {
        let addr = spawn_echo_upstream().await;
        let req = Request::builder()
            .uri(format!("http://{}/path?q=1", addr))
            .body(body::empty())
            .unwrap();

        let resp = test_transport(2_000).round_trip(req).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-upstream-connection"], "close");
        assert_eq!(resp.headers().get_all("set-cookie").iter().count(), 2);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, format!("GET /path?q=1 host={}", addr).as_bytes());
    }

    #[tokio::test]
    async fn round_trip_keeps_existing_host_header() {
        let addr = spawn_echo_upstream().await;
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .header(HOST, "a.test")
            .body(body::empty())
            .unwrap();

        let resp = test_transport(2_000).round_trip(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "GET / host=a.test".as_bytes());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let req = Request::builder()
            .uri("ftp://a.test/file")
            .body(body::empty())
            .unwrap();

        let err = test_transport(2_000).round_trip(req).await.unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[tokio::test]
    async fn relative_url_has_no_host() {
        let req = Request::builder().uri("/only/path").body(body::empty()).unwrap();
        let err = test_transport(2_000).round_trip(req).await.unwrap_err();
        assert!(matches!(err, TransportError::MissingHost(_)));
    }

    #[tokio::test]
    async fn silent_upstream_hits_response_header_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(body::empty())
            .unwrap();
        let err = test_transport(200).round_trip(req).await.unwrap_err();
        assert!(matches!(err, TransportError::ResponseHeaderTimeout(_)));
    }

    #[test]
    fn prepare_outbound_handles_missing_path() {
        let uri: Uri = "http://a.test".parse().unwrap();
        let mut req = Request::builder().uri(uri.clone()).body(body::empty()).unwrap();
        prepare_outbound(&mut req, &uri);
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[HOST], "a.test");
    }
}
