//! Interpose Proxy - intercepting HTTP/HTTPS forward proxy.
//!
//! Every client request runs through three ordered, pluggable filter chains
//! before anything is relayed back. TLS tunnels can be decrypted with
//! certificates issued on demand by a local root CA, after which the
//! decrypted requests run through the same chains as plain ones.
//!
//! ## Features
//!
//! - Request, fetch and response filter chains sharing a per-request [`Context`]
//! - Relative URLs normalized to absolute `http`/`https` form
//! - Root CA generated on first run, per-host leaf certificates on the fly
//! - CONNECT interception for selected ports, opaque tunnels for the rest
//! - Default transport over a dual-mode (plain/TLS) dialer, one connection per request
//!
//! ## Architecture
//!
//! ```text
//! Client → Listener ──→ Handler ──→ Request filters ──→ Fetch filters ──→ Response filters → Client
//!             ▲                          │                    │
//!             │                   CONNECT :443          (no response)
//!             │                          │                    │
//!             └── inject decrypted ──────┘                    ▼
//!                 stream (TLS info)                   Default transport → Upstream
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use interpose_proxy::{CertificateAuthority, ProxyConfig, ProxyServer};
//!
//! # async fn example() -> interpose_proxy::Result<()> {
//! let config = ProxyConfig::default();
//! let ca = CertificateAuthority::load_or_create(&config.ca_path, &config.ca_name)?;
//! let server = ProxyServer::builder(config)
//!     .default_filters(Arc::new(ca))
//!     .bind()?;
//! server.run().await
//! # }
//! ```

mod body;
mod ca;
mod context;
mod dialer;
mod error;
mod filter;
pub mod filters;
mod handler;
mod listener;
mod proxy;
mod transport;
mod writer;

pub use body::{boxed, empty, full, ProxyBody};
pub use ca::{
    default_ca_path, CertificateAuthority, LeafCertificate, CA_FILENAME, DEFAULT_CA_NAME,
    DEFAULT_LEAF_CACHE_CAPACITY,
};
pub use context::{Context, ContextError, LISTENER_KEY, RESPONSE_WRITER_KEY, TRANSPORT_KEY};
pub use dialer::{Dialer, DialerConfig, MaybeTlsStream};
pub use error::{
    BoxError, CaError, DialError, FilterError, PipelineError, ProxyError, Result, TransportError,
};
pub use filter::{
    FetchFilter, FilterResult, ProxyRequest, ProxyResponse, RequestFilter, ResponseFilter,
};
pub use handler::{normalize_url, ClientAddr, Handler, HandlerBuilder, OriginRequest, TlsInfo};
pub use listener::{Accepted, ClientIo, ListenerHandle, ProxyListener};
pub use proxy::{
    serve_connection, ProxyConfig, ProxyHandle, ProxyServer, ProxyServerBuilder, ServerSettings,
};
pub use transport::{Transport, TransportConfig};
pub use writer::ResponseWriter;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 1080;
