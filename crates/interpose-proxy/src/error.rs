//! Error types for the proxy.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used for filter-defined failures and body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the listener.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate a root or leaf certificate.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read the CA file.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse the CA file.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write the CA file.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Outbound connection error.
#[derive(Debug, Error)]
pub enum DialError {
    /// The connect or handshake budget ran out.
    #[error("dial {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },

    /// TCP connect failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS client handshake failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Hostname is not usable as a TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Default transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the upstream.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// The request URL has no host to dial.
    #[error("request URL has no host: {0}")]
    MissingHost(String),

    /// Only `http` and `https` can be fetched.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// HTTP protocol failure talking to the upstream.
    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Upstream did not send response headers in time.
    #[error("no response headers after {0:?}")]
    ResponseHeaderTimeout(Duration),
}

/// Error returned by a filter. Aborts the pipeline it runs in.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Certificate issuance failed.
    #[error(transparent)]
    Ca(#[from] CaError),

    /// An outbound connection failed.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// An outbound fetch failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// TLS configuration failed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Malformed request or response.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The client-facing response was already written for this request.
    #[error("response already written")]
    AlreadyWritten,

    /// Error raised by a user-defined filter.
    #[error(transparent)]
    Custom(BoxError),
}

impl FilterError {
    /// Wraps an arbitrary error raised by a filter implementation.
    pub fn custom(err: impl Into<BoxError>) -> Self {
        Self::Custom(err.into())
    }
}

/// Why a pipeline ended without relaying a response.
///
/// Returned to the connection driver, which closes the client connection
/// without writing anything.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A filter in one of the three chains failed.
    #[error("filter {filter} failed: {source}")]
    Filter {
        filter: &'static str,
        #[source]
        source: FilterError,
    },

    /// The default transport failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] TransportError),

    /// The final response could not be handed to the client writer.
    #[error("relay failed: {0}")]
    Relay(#[source] FilterError),

    /// The request URL could not be made absolute.
    #[error("cannot normalize request URL: {0}")]
    InvalidUrl(String),

    /// A filter dropped the request or response without answering the client.
    #[error("pipeline aborted without a response")]
    Aborted,
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_error_custom_keeps_message() {
        let err = FilterError::custom("backend rejected request");
        assert_eq!(err.to_string(), "backend rejected request");
    }

    #[test]
    fn pipeline_error_names_filter() {
        let err = PipelineError::Filter {
            filter: "StripFilter",
            source: FilterError::AlreadyWritten,
        };
        assert_eq!(
            err.to_string(),
            "filter StripFilter failed: response already written"
        );
    }

    #[test]
    fn dial_timeout_display() {
        let err = DialError::Timeout {
            addr: "a.test:443".to_string(),
            after: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("a.test:443"));
    }
}
