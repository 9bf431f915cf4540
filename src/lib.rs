//! Route Limiter - per-route request rate limiting
//!
//! This crate decides, before a route handler runs, whether a request must be
//! rejected because one of its applicable quotas is exhausted. Limits are
//! bound to handlers (not URL patterns), may be static or computed per
//! request, and fall back to a global list for routes without limits of
//! their own. Counting is delegated to a pluggable backend.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;

pub use error::{GateError, LimiterError, RateLimitExceeded, Result};
pub use ratelimit::{KeyFunc, LimitOptions, Limiter, RouteId};
