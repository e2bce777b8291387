//! Filter pipeline handler.
//!
//! Turns one inbound request into at most one client-visible response:
//!
//! ```text
//! Request → Normalize URL → Request filters → Fetch filters ─┬→ Response filters → Relay
//!                                │                 │         │
//!                                └── abort ────────┴─ (none) └→ Default transport
//! ```
//!
//! Any filter error, or a filter dropping the request/response, ends the
//! pipeline. Nothing is relayed in that case; if the filter wrote its own
//! response to the [`ResponseWriter`] that response is delivered, otherwise
//! the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::{Body, Bytes};
use hyper::header::HOST;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{HeaderMap, Method, Request, Response, Uri, Version};

use crate::body;
use crate::context::Context;
use crate::error::{BoxError, PipelineError};
use crate::filter::{FetchFilter, ProxyRequest, ProxyResponse, RequestFilter, ResponseFilter};
use crate::listener::ListenerHandle;
use crate::transport::Transport;
use crate::writer::ResponseWriter;

/// TLS session descriptor, present on requests the proxy decrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Server name the client asked for in its handshake.
    pub server_name: Option<String>,
}

/// Address of the client that sent a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Head of the request a response was produced for.
///
/// Attached to response extensions once a fetch filter or the default
/// transport has answered.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl<B> From<&Request<B>> for OriginRequest {
    fn from(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

struct Chains {
    listener: ListenerHandle,
    transport: Transport,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    fetch_filters: Vec<Arc<dyn FetchFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
}

/// Registers filters, in order, for a [`Handler`].
pub struct HandlerBuilder {
    chains: Chains,
}

impl HandlerBuilder {
    /// Appends a filter to the request chain.
    pub fn request_filter(self, filter: impl RequestFilter + 'static) -> Self {
        self.request_filter_arc(Arc::new(filter))
    }

    /// Appends a shared filter to the request chain.
    pub fn request_filter_arc(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.chains.request_filters.push(filter);
        self
    }

    /// Appends a filter to the fetch chain.
    pub fn fetch_filter(self, filter: impl FetchFilter + 'static) -> Self {
        self.fetch_filter_arc(Arc::new(filter))
    }

    /// Appends a shared filter to the fetch chain.
    pub fn fetch_filter_arc(mut self, filter: Arc<dyn FetchFilter>) -> Self {
        self.chains.fetch_filters.push(filter);
        self
    }

    /// Appends a filter to the response chain.
    pub fn response_filter(self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filter_arc(Arc::new(filter))
    }

    /// Appends a shared filter to the response chain.
    pub fn response_filter_arc(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.chains.response_filters.push(filter);
        self
    }

    /// Finishes the handler.
    pub fn build(self) -> Handler {
        Handler {
            chains: Arc::new(self.chains),
        }
    }
}

/// The request/response pipeline. Cheap to clone; one instance serves every
/// connection.
#[derive(Clone)]
pub struct Handler {
    chains: Arc<Chains>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chains = &self.chains;
        f.debug_struct("Handler")
            .field("listener", &chains.listener)
            .field(
                "request_filters",
                &chains.request_filters.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .field(
                "fetch_filters",
                &chains.fetch_filters.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .field(
                "response_filters",
                &chains.response_filters.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Handler {
    /// Starts a handler with empty chains.
    pub fn builder(listener: ListenerHandle, transport: Transport) -> HandlerBuilder {
        HandlerBuilder {
            chains: Chains {
                listener,
                transport,
                request_filters: Vec::new(),
                fetch_filters: Vec::new(),
                response_filters: Vec::new(),
            },
        }
    }

    /// Runs one inbound request through the pipeline.
    ///
    /// Returns the response for the client, or an error when nothing should
    /// be sent and the connection must be closed.
    pub async fn serve<B>(&self, req: Request<B>) -> Result<ProxyResponse, PipelineError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let writer = ResponseWriter::new();

        match self.run(req.map(body::boxed), writer.clone()).await {
            Ok(()) => writer.take().ok_or_else(|| {
                tracing::debug!("{} {} handled without a response", method, uri);
                PipelineError::Aborted
            }),
            Err(e) => {
                tracing::info!("{} {} aborted: {}", method, uri, e);
                Err(e)
            }
        }
    }

    async fn run(&self, mut req: ProxyRequest, writer: ResponseWriter) -> Result<(), PipelineError> {
        normalize_url(&mut req)?;
        tracing::debug!("{} {}", req.method(), req.uri());

        let mut ctx = Context::new(
            self.chains.listener.clone(),
            self.chains.transport.clone(),
            writer,
        );

        for filter in &self.chains.request_filters {
            let (next, filtered) = filter
                .request(ctx, req)
                .await
                .map_err(|source| PipelineError::Filter {
                    filter: filter.name(),
                    source,
                })?;
            ctx = next;
            match filtered {
                Some(filtered) => req = filtered,
                None => return Ok(()),
            }
        }

        let mut fetched = None;
        for filter in &self.chains.fetch_filters {
            let (next, resp) = filter
                .fetch(ctx, &mut req)
                .await
                .map_err(|source| PipelineError::Filter {
                    filter: filter.name(),
                    source,
                })?;
            ctx = next;
            if let Some(mut resp) = resp {
                resp.extensions_mut().insert(OriginRequest::from(&req));
                fetched = Some(resp);
                break;
            }
        }

        let mut resp = match fetched {
            Some(resp) => resp,
            None => {
                let origin = OriginRequest::from(&req);
                let mut resp = ctx.transport().round_trip(req).await?;
                resp.extensions_mut().insert(origin);
                resp
            }
        };

        for filter in &self.chains.response_filters {
            let (next, filtered) = filter
                .response(ctx, resp)
                .await
                .map_err(|source| PipelineError::Filter {
                    filter: filter.name(),
                    source,
                })?;
            ctx = next;
            match filtered {
                Some(filtered) => resp = filtered,
                None => return Ok(()),
            }
        }

        relay(resp, ctx.response_writer())
    }
}

/// Makes a relative request URL absolute.
///
/// CONNECT requests and URLs that already carry a scheme are left alone.
/// Decrypted requests become `https` with the `Host` header (or the TLS
/// server name) as authority; plain requests become `http` with the `Host`
/// header.
pub fn normalize_url<B>(req: &mut Request<B>) -> Result<(), PipelineError> {
    if req.method() == Method::CONNECT || req.uri().scheme().is_some() {
        return Ok(());
    }

    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string);

    let (scheme, host) = match req.extensions().get::<TlsInfo>() {
        Some(tls) => (Scheme::HTTPS, host_header.or_else(|| tls.server_name.clone())),
        None => (Scheme::HTTP, host_header),
    };
    let host = host.ok_or_else(|| PipelineError::InvalidUrl(format!("{} has no host", req.uri())))?;

    let authority: Authority = host
        .parse()
        .map_err(|_| PipelineError::InvalidUrl(format!("invalid host {:?}", host)))?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| PipelineError::InvalidUrl(e.to_string()))?;
    Ok(())
}

/// Copies status, every header value, and the streaming body to the client.
/// Extensions travel along so the caller still sees the [`OriginRequest`].
fn relay(resp: ProxyResponse, writer: &ResponseWriter) -> Result<(), PipelineError> {
    let (parts, body) = resp.into_parts();

    let mut out = Response::new(body);
    for (name, value) in parts.headers.iter() {
        out.headers_mut().append(name.clone(), value.clone());
    }
    *out.status_mut() = parts.status;
    *out.extensions_mut() = parts.extensions;

    tracing::debug!("Relaying {}", parts.status);
    writer.write(out).map_err(PipelineError::Relay)
}
