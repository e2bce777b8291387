//! Opaque CONNECT tunnels.

use async_trait::async_trait;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;

use super::connect_target;
use crate::body;
use crate::context::Context;
use crate::error::FilterError;
use crate::filter::{FilterResult, ProxyRequest, RequestFilter};

/// Request filter that relays CONNECT tunnels as opaque byte streams.
///
/// The upstream is dialed through the context's transport before the client
/// is told the tunnel is up, so an unreachable target aborts the pipeline and
/// the client sees the connection close. Register it after
/// [`InterceptFilter`](super::InterceptFilter) so it only sees the tunnels
/// that were not decrypted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelFilter;

impl TunnelFilter {
    /// Creates the filter; it holds no state.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestFilter for TunnelFilter {
    fn name(&self) -> &'static str {
        "TunnelFilter"
    }

    async fn request(&self, ctx: Context, mut req: ProxyRequest) -> FilterResult<ProxyRequest> {
        let Some((host, port)) = connect_target(&req) else {
            return Ok((ctx, Some(req)));
        };

        let mut upstream = ctx.transport().dialer().dial(&host, port).await?;
        let upgrade = hyper::upgrade::on(&mut req);

        ctx.response_writer().write(
            Response::builder()
                .status(StatusCode::OK)
                .body(body::empty())
                .map_err(|e| FilterError::Http(e.to_string()))?,
        )?;

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!("CONNECT {}:{} upgrade failed: {}", host, port, e);
                    return;
                }
            };

            let mut client = TokioIo::new(upgraded);
            match copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => {
                    tracing::debug!(
                        "Tunnel {}:{} closed, {} bytes sent, {} bytes received",
                        host,
                        port,
                        sent,
                        received
                    );
                }
                Err(e) => tracing::debug!("Tunnel {}:{} ended: {}", host, port, e),
            }
        });

        Ok((ctx, None))
    }
}
