//! Stock filters.
//!
//! - [`InterceptFilter`]: decrypts CONNECT tunnels to TLS ports with leaves
//!   from the local root and serves them through a fresh pipeline.
//! - [`TunnelFilter`]: relays any other CONNECT as an opaque byte stream.
//! - [`RawResponseFilter`]: relays upstream responses unchanged.

mod intercept;
mod raw;
mod tunnel;

pub use intercept::{InterceptFilter, DEFAULT_HANDSHAKE_TIMEOUT};
pub use raw::RawResponseFilter;
pub use tunnel::TunnelFilter;

use hyper::Method;

use crate::filter::ProxyRequest;

/// Host and port of a CONNECT request, or `None` for any other method.
pub(crate) fn connect_target(req: &ProxyRequest) -> Option<(String, u16)> {
    if req.method() != Method::CONNECT {
        return None;
    }
    let authority = req.uri().authority()?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Some((host, authority.port_u16().unwrap_or(443)))
}
