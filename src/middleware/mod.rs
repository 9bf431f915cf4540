//! HTTP integration: the tower layer and the demo server.

mod layer;
mod server;

pub use layer::{RateLimitLayer, RateLimitService};
pub use server::{demo_app, demo_limiter, demo_routes, HttpServer};
