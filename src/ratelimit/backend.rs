//! Counting backend abstraction.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use super::item::RateLimitItem;
use super::memory::MemoryBackend;
use crate::error::{LimiterError, Result};

/// Trait for quota engines the request gate consults.
///
/// Implementations must make `hit` atomic for a given `(scope, key)` pair;
/// the gate adds no locking of its own.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    /// Record a hit against `limit` for `key` within `scope`.
    ///
    /// Returns `Ok(false)` when the limit is exhausted.
    async fn hit(&self, limit: &RateLimitItem, key: &str, scope: &str) -> Result<bool>;

    /// Clear all counters.
    async fn reset(&self) -> Result<()> {
        Err(LimiterError::NotSupported("reset"))
    }
}

/// Window algorithm used by the built-in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    #[default]
    FixedWindow,
    FixedWindowElasticExpiry,
    MovingWindow,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed-window",
            Strategy::FixedWindowElasticExpiry => "fixed-window-elastic-expiry",
            Strategy::MovingWindow => "moving-window",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed-window" => Ok(Strategy::FixedWindow),
            "fixed-window-elastic-expiry" => Ok(Strategy::FixedWindowElasticExpiry),
            "moving-window" => Ok(Strategy::MovingWindow),
            other => Err(LimiterError::Config(format!(
                "Invalid rate limiting strategy {}",
                other
            ))),
        }
    }
}

/// Build a backend from a storage URL such as `memory://`.
///
/// `options` are handed to the backend constructor.
pub fn backend_from_url(
    url: &str,
    options: &HashMap<String, String>,
    strategy: Strategy,
) -> Result<Arc<dyn CountingBackend>> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| LimiterError::Config(format!("Invalid storage url {}", url)))?;

    match scheme {
        "memory" => Ok(Arc::new(MemoryBackend::with_options(strategy, options))),
        other => Err(LimiterError::Config(format!(
            "Unsupported storage scheme {}",
            other
        ))),
    }
}
