//! Tower layer running the request gate in front of route handlers.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{Request, StatusCode};
use tower::{Layer, Service};
use tracing::error;

use crate::error::{GateError, RateLimitExceeded};
use crate::ratelimit::{Limiter, RequestInfo, RouteResolver};

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        (self.status(), self.message().to_string()).into_response()
    }
}

/// Tower layer for rate limiting.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
    resolver: Arc<dyn RouteResolver>,
}

impl RateLimitLayer {
    /// Limit requests with `limiter`, identifying routes through `resolver`.
    pub fn new(limiter: Arc<Limiter>, resolver: Arc<dyn RouteResolver>) -> Self {
        Self { limiter, resolver }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// Tower service for rate limiting.
///
/// Rejected requests never reach the inner service: a denial becomes
/// `429 Too Many Requests` and an unswallowed evaluation failure becomes
/// `500 Internal Server Error`.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    resolver: Arc<dyn RouteResolver>,
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // The clone is not ready yet; keep the driven service for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        let info = RequestInfo::from_http(&req, self.resolver.as_ref());

        Box::pin(async move {
            match limiter.check(&info).await {
                Ok(_) => Ok(inner.call(req).await?.into_response()),
                Err(GateError::RateLimited(exceeded)) => Ok(exceeded.into_response()),
                Err(GateError::Unexpected(e)) => {
                    error!(path = %info.path, error = %e, "Rate limit evaluation failed");
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response())
                }
            }
        })
    }
}
