//! HTTP server hosting the demo application.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{LimitOptions, Limiter, RouteTable};
use crate::route_id;

async fn t1() -> &'static str {
    "t1"
}

async fn t2() -> &'static str {
    "t2"
}

async fn t3() -> &'static str {
    "t3"
}

/// Build the demo limiter.
///
/// `/t1` carries its own limits, `/t2` falls back to the global limits and
/// `/t3` is exempt. The global limits default to `1 per hour` and
/// `10 per day` unless the configuration names some.
pub fn demo_limiter(config: &LimiterConfig) -> Result<Limiter> {
    let mut builder = Limiter::builder();
    if config.global_limits.is_none() {
        builder = builder.global_limit("1 per hour").global_limit("10 per day");
    }
    let limiter = builder.build(config)?;

    limiter.limit(&route_id!(t1), "100 per hour;10/minute", LimitOptions::new());
    limiter.exempt(&route_id!(t3));
    Ok(limiter)
}

/// Paths of the demo application and the handlers serving them.
pub fn demo_routes() -> RouteTable {
    RouteTable::new()
        .route("/t1", route_id!(t1))
        .route("/t2", route_id!(t2))
        .route("/t3", route_id!(t3))
}

/// Router for the demo application, limited by `limiter`.
pub fn demo_app(limiter: Arc<Limiter>) -> Router {
    Router::new()
        .route("/t1", get(t1))
        .route("/t2", get(t2))
        .route("/t3", get(t3))
        .layer(RateLimitLayer::new(limiter, Arc::new(demo_routes())))
}

/// HTTP server for a rate limited router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            LimiterError::Io(e)
        })
    }
}
