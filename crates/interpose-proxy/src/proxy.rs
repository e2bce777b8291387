//! Proxy server.
//!
//! Binds the listener, builds the default transport and the [`Handler`], and
//! serves every accepted or injected connection on its own task.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_io_timeout::TimeoutStream;

use crate::ca::{
    default_ca_path, CertificateAuthority, DEFAULT_CA_NAME, DEFAULT_LEAF_CACHE_CAPACITY,
};
use crate::dialer::{Dialer, DialerConfig};
use crate::error::Result;
use crate::filter::{FetchFilter, RequestFilter, ResponseFilter};
use crate::filters::{InterceptFilter, RawResponseFilter, TunnelFilter};
use crate::handler::{ClientAddr, Handler, HandlerBuilder};
use crate::listener::{Accepted, ProxyListener};
use crate::transport::{Transport, TransportConfig};
use crate::DEFAULT_PROXY_PORT;

/// Smallest request-head buffer hyper accepts.
const MIN_HEADER_BYTES: usize = 8192;

/// Limits applied to client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Deadline for reading a request head from the client.
    pub read_timeout_ms: u64,
    /// Largest request head accepted from the client.
    pub max_header_bytes: usize,
    /// Deadline for the client-facing TLS handshake during interception.
    pub handshake_timeout_ms: u64,
    /// Deadline for any single write to the client to make progress.
    pub write_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            max_header_bytes: 1 << 20,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// Request-head read deadline as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Interception handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Client write deadline as a [`Duration`].
    ///
    /// A client that stops reading for this long has its connection closed,
    /// which also drops the response body being streamed to it.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Listen backlog.
    pub backlog: i32,
    /// Root CA file (certificate and key PEM).
    pub ca_path: PathBuf,
    /// Common name used when generating a new root.
    pub ca_name: String,
    /// Hostnames whose leaf certificates stay cached.
    pub leaf_cache_capacity: usize,
    /// CONNECT ports that are decrypted.
    pub intercept_ports: Vec<u16>,
    pub dialer: DialerConfig,
    pub transport: TransportConfig,
    pub server: ServerSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            backlog: 128,
            ca_path: default_ca_path(),
            ca_name: DEFAULT_CA_NAME.to_string(),
            leaf_cache_capacity: DEFAULT_LEAF_CACHE_CAPACITY,
            intercept_ports: vec![443],
            dialer: DialerConfig::default(),
            transport: TransportConfig::default(),
            server: ServerSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA file path.
    pub fn with_ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = path.into();
        self
    }
}

type RequestChain = Vec<Arc<dyn RequestFilter>>;
type FetchChain = Vec<Arc<dyn FetchFilter>>;
type ResponseChain = Vec<Arc<dyn ResponseFilter>>;

/// Collects filters for a [`ProxyServer`] before it is bound.
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    dialer: Option<Dialer>,
    request_filters: RequestChain,
    fetch_filters: FetchChain,
    response_filters: ResponseChain,
}

impl ProxyServerBuilder {
    /// Appends a request filter.
    pub fn request_filter(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.request_filters.push(Arc::new(filter));
        self
    }

    /// Appends a fetch filter.
    pub fn fetch_filter(mut self, filter: impl FetchFilter + 'static) -> Self {
        self.fetch_filters.push(Arc::new(filter));
        self
    }

    /// Appends a response filter.
    pub fn response_filter(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filters.push(Arc::new(filter));
        self
    }

    /// Registers the stock chain: interception of the configured ports,
    /// opaque tunnelling of other CONNECTs, and an unchanged response relay.
    pub fn default_filters(self, ca: Arc<CertificateAuthority>) -> Self {
        let intercept = InterceptFilter::new(
            ca,
            self.config.intercept_ports.clone(),
            self.config.server.handshake_timeout(),
        );
        self.request_filter(intercept)
            .request_filter(TunnelFilter::new())
            .response_filter(RawResponseFilter)
    }

    /// Uses `dialer` instead of one built from the configuration.
    pub fn dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Opens the listener and assembles the pipeline.
    pub fn bind(self) -> Result<ProxyServer> {
        let listener = ProxyListener::bind(self.config.addr, self.config.backlog)?;
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Dialer::new(&self.config.dialer)?,
        };
        let transport = Transport::new(dialer, &self.config.transport);

        let handler = chain(
            Handler::builder(listener.handle(), transport),
            self.request_filters,
            self.fetch_filters,
            self.response_filters,
        )
        .build();

        tracing::debug!("Pipeline: {:?}", handler);

        Ok(ProxyServer {
            listener,
            handler,
            settings: self.config.server,
        })
    }
}

fn chain(
    mut builder: HandlerBuilder,
    request: RequestChain,
    fetch: FetchChain,
    response: ResponseChain,
) -> HandlerBuilder {
    for filter in request {
        builder = builder.request_filter_arc(filter);
    }
    for filter in fetch {
        builder = builder.fetch_filter_arc(filter);
    }
    for filter in response {
        builder = builder.response_filter_arc(filter);
    }
    builder
}

/// Intercepting forward proxy.
pub struct ProxyServer {
    listener: ProxyListener,
    handler: Handler,
    settings: ServerSettings,
}

impl ProxyServer {
    /// Starts configuring a server.
    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            dialer: None,
            request_filters: Vec::new(),
            fetch_filters: Vec::new(),
            response_filters: Vec::new(),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The request pipeline.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Serves connections until the process exits.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serves connections until `shutdown` completes.
    ///
    /// Connections already being served are left to finish on their own tasks.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let ProxyServer {
            mut listener,
            handler,
            settings,
        } = self;
        tracing::info!("Proxy listening on {}", listener.local_addr());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        tracing::debug!(
                            "Accepted {} ({})",
                            conn.peer,
                            if conn.tls.is_some() { "intercepted" } else { "tcp" }
                        );
                        tokio::spawn(serve_connection(handler.clone(), settings.clone(), conn));
                    }
                    Err(e) => tracing::error!("Accept failed: {}", e),
                },
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Serves connections in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> ProxyHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.local_addr();

        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = self.run_until(shutdown).await {
                tracing::error!("Proxy error: {}", e);
            }
        });

        ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        }
    }
}

/// Serves HTTP/1.1 on one client connection.
///
/// A pipeline error fails the service call, which closes the connection
/// without writing a response.
pub async fn serve_connection(handler: Handler, settings: ServerSettings, conn: Accepted) {
    let Accepted { io, peer, tls } = conn;

    let service = service_fn(move |mut req: Request<Incoming>| {
        let handler = handler.clone();
        req.extensions_mut().insert(ClientAddr(peer));
        if let Some(tls) = &tls {
            req.extensions_mut().insert(tls.clone());
        }
        async move { handler.serve(req).await }
    });

    let mut io = TimeoutStream::new(io);
    io.set_write_timeout(Some(settings.write_timeout()));

    let result = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout())
        .max_buf_size(settings.max_header_bytes.max(MIN_HEADER_BYTES))
        .serve_connection(TokioIo::new(Box::pin(io)), service)
        .with_upgrades()
        .await;

    if let Err(e) = result {
        tracing::debug!("Connection from {} closed: {}", peer, e);
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
