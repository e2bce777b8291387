//! Pass-through response filter.
//!
//! Logs each response at debug level and hands it on unchanged.

use async_trait::async_trait;

use crate::context::Context;
use crate::filter::{FilterResult, ProxyResponse, ResponseFilter};
use crate::handler::OriginRequest;

/// Response filter that relays every response unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawResponseFilter;

#[async_trait]
impl ResponseFilter for RawResponseFilter {
    fn name(&self) -> &'static str {
        "RawResponseFilter"
    }

    async fn response(&self, ctx: Context, resp: ProxyResponse) -> FilterResult<ProxyResponse> {
        match resp.extensions().get::<OriginRequest>() {
            Some(origin) => {
                tracing::debug!("{} {} -> {}", origin.method, origin.uri, resp.status())
            }
            None => tracing::debug!("-> {}", resp.status()),
        }
        Ok((ctx, Some(resp)))
    }
}
