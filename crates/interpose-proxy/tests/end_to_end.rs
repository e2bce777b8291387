//! End-to-end tests over real sockets.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use interpose_proxy::filters::{InterceptFilter, DEFAULT_HANDSHAKE_TIMEOUT};
use interpose_proxy::{
    empty, full, CertificateAuthority, Context, Dialer, DialerConfig, FetchFilter, FilterError,
    FilterResult, ProxyConfig, ProxyHandle, ProxyRequest, ProxyResponse, ProxyServer,
    ProxyServerBuilder, RequestFilter, TlsInfo,
};

fn builder() -> ProxyServerBuilder {
    let dialer = Dialer::with_roots(&DialerConfig::default(), RootCertStore::empty()).unwrap();
    ProxyServer::builder(ProxyConfig::default().with_port(0)).dialer(dialer)
}

fn start(builder: ProxyServerBuilder) -> ProxyHandle {
    builder.bind().unwrap().start()
}

/// Upstream answering every request with a fixed page.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::CREATED)
                            .header("x-upstream-path", req.uri().path())
                            .header("set-cookie", "a=1")
                            .header("set-cookie", "b=2")
                            .body(full("hello from upstream"))
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

/// Sends one request over `io` and returns the response with its body.
async fn send<T>(io: T, req: Request<interpose_proxy::ProxyBody>) -> (Response<()>, String)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(io)).await.unwrap();
    tokio::spawn(conn);

    let resp = sender.send_request(req).await.unwrap();
    let (parts, body) = resp.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (
        Response::from_parts(parts, ()),
        String::from_utf8(bytes.to_vec()).unwrap(),
    )
}

#[tokio::test]
async fn plain_request_is_fetched_and_relayed_unchanged() {
    let upstream = spawn_upstream().await;
    let proxy = start(builder());

    let stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let req = Request::builder()
        .uri(format!("http://{}/index.html", upstream))
        .header("host", upstream.to_string())
        .body(empty())
        .unwrap();
    let (resp, body) = send(stream, req).await;

    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()["x-upstream-path"], "/index.html");
    let cookies: Vec<_> = resp.headers().get_all("set-cookie").iter().collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(body, "hello from upstream");

    proxy.stop().await;
}

/// Answers with the normalized URL and the TLS server name it saw.
struct EchoUrl;

#[async_trait]
impl FetchFilter for EchoUrl {
    async fn fetch(&self, ctx: Context, req: &mut ProxyRequest) -> FilterResult<ProxyResponse> {
        let server_name = req
            .extensions()
            .get::<TlsInfo>()
            .and_then(|tls| tls.server_name.clone())
            .unwrap_or_default();
        let resp = Response::builder()
            .header("x-server-name", server_name)
            .body(full(req.uri().to_string()))
            .map_err(|e| FilterError::Http(e.to_string()))?;
        Ok((ctx, Some(resp)))
    }
}

async fn read_head<T: AsyncRead + Unpin>(io: &mut T) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        if io.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn connect_is_intercepted_and_requests_become_https() {
    let ca = Arc::new(CertificateAuthority::generate("Interpose Test Root").unwrap());
    let proxy = start(
        builder()
            .request_filter(InterceptFilter::new(
                ca.clone(),
                vec![443],
                DEFAULT_HANDSHAKE_TIMEOUT,
            ))
            .fetch_filter(EchoUrl),
    );

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    stream
        .write_all(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");

    let mut roots = RootCertStore::empty();
    roots.add(ca.root_certificate_der().clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    // The handshake only succeeds if the leaf for a.test chains to our root.
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("a.test").unwrap(), stream)
        .await
        .unwrap();

    let req = Request::builder().uri("/").body(empty()).unwrap();
    let (resp, body) = send(tls, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-server-name"], "a.test");
    assert_eq!(body, "https://a.test/");

    proxy.stop().await;
}

/// TCP server writing back whatever it reads.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn connect_tunnel_relays_bytes_both_ways() {
    let echo = spawn_echo().await;
    let ca = Arc::new(CertificateAuthority::generate("Interpose Test Root").unwrap());
    // Echo listens on an ephemeral port, so only the tunnel filter handles it.
    let proxy = start(builder().default_filters(ca.clone()));

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let connect = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");

    stream.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    stream.write_all(b"again").await.unwrap();
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"again");

    assert_eq!(ca.cached_leaves(), 0);
    proxy.stop().await;
}

struct Reject;

#[async_trait]
impl RequestFilter for Reject {
    async fn request(&self, _ctx: Context, _req: ProxyRequest) -> FilterResult<ProxyRequest> {
        Err(FilterError::custom("not allowed"))
    }
}

#[tokio::test]
async fn request_filter_error_closes_connection_without_response() {
    let upstream = spawn_upstream().await;
    let proxy = start(builder().request_filter(Reject));

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    stream
        .write_all(
            format!(
                "GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n",
                upstream
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());

    proxy.stop().await;
}

struct Pass;

#[async_trait]
impl FetchFilter for Pass {
    async fn fetch(&self, ctx: Context, _req: &mut ProxyRequest) -> FilterResult<ProxyResponse> {
        Ok((ctx, None))
    }
}

struct Canned;

#[async_trait]
impl FetchFilter for Canned {
    async fn fetch(&self, ctx: Context, _req: &mut ProxyRequest) -> FilterResult<ProxyResponse> {
        let resp = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header("x-fetched-by", "canned")
            .body(full("canned"))
            .map_err(|e| FilterError::Http(e.to_string()))?;
        Ok((ctx, Some(resp)))
    }
}

#[tokio::test]
async fn second_fetch_filter_answers_instead_of_transport() {
    // Nothing listens here, so a default-transport fetch would fail.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = dead.local_addr().unwrap();
    drop(dead);

    let proxy = start(builder().fetch_filter(Pass).fetch_filter(Canned));

    let stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let req = Request::builder()
        .uri(format!("http://{}/", target))
        .header("host", target.to_string())
        .body(empty())
        .unwrap();
    let (resp, body) = send(stream, req).await;

    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(resp.headers()["x-fetched-by"], "canned");
    assert_eq!(body, "canned");

    proxy.stop().await;
}
