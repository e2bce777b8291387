//! Filter capability traits.
//!
//! The pipeline runs three independent chains. A filter type may implement
//! any subset of the traits; it only runs in the chains it is registered in,
//! in registration order. Filters are shared by every connection, so any
//! per-request state belongs in the [`Context`] they are handed.
//!
//! Every call returns the context for the next filter plus an optional
//! value. `Ok((ctx, None))` means the filter has fully dealt with the client
//! itself and the pipeline stops quietly; `Err` aborts the pipeline and the
//! client connection is closed.

use async_trait::async_trait;
use hyper::{Request, Response};

use crate::body::ProxyBody;
use crate::context::Context;
use crate::error::FilterError;

/// Request as seen by the filters.
pub type ProxyRequest = Request<ProxyBody>;

/// Response as seen by the filters.
pub type ProxyResponse = Response<ProxyBody>;

/// Outcome of one filter call.
pub type FilterResult<T> = Result<(Context, Option<T>), FilterError>;

/// Inspects, rewrites, or takes over an inbound request.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    /// Name used when logging a failure of this filter.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the request to pass on, or `None` once the client is handled.
    async fn request(&self, ctx: Context, req: ProxyRequest) -> FilterResult<ProxyRequest>;
}

/// Produces a response for a request instead of the default transport.
#[async_trait]
pub trait FetchFilter: Send + Sync {
    /// Name used when logging a failure of this filter.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns a response, or `None` to let the next fetch filter try.
    ///
    /// The request stays with the pipeline so later filters and the default
    /// transport see it, including any changes made here.
    async fn fetch(&self, ctx: Context, req: &mut ProxyRequest) -> FilterResult<ProxyResponse>;
}

/// Inspects or rewrites a response before it is relayed.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    /// Name used when logging a failure of this filter.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the response to relay, or `None` to send nothing further.
    async fn response(&self, ctx: Context, resp: ProxyResponse) -> FilterResult<ProxyResponse>;
}
