//! The limiter: registration API and request checks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::backend::{backend_from_url, CountingBackend, Strategy};
use super::gate::{Outcome, RequestGate};
use super::limit::{KeyFunc, LimitOptions, StringFn, TextSource};
use super::route::{RequestInfo, RouteId};
use super::rules::RuleRegistry;
use crate::config::LimiterConfig;
use crate::error::{GateError, LimiterError, Result};

/// The rate value of a limit: a rate string, or a callable producing one on
/// every request.
#[derive(Clone)]
pub enum RateValue {
    Static(String),
    Dynamic(StringFn),
}

impl RateValue {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        RateValue::Dynamic(Arc::new(f))
    }
}

impl From<&str> for RateValue {
    fn from(rates: &str) -> Self {
        RateValue::Static(rates.to_string())
    }
}

impl From<String> for RateValue {
    fn from(rates: String) -> Self {
        RateValue::Static(rates)
    }
}

/// Rate limiter for the routes of one application.
///
/// Limits are registered against route identifiers during setup; each
/// request is then checked with [`Limiter::check`].
pub struct Limiter {
    registry: Arc<RuleRegistry>,
    gate: RequestGate,
    key_func: KeyFunc,
    strategy: Strategy,
}

impl Limiter {
    /// Start building a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Attach a limit to `route`.
    ///
    /// A static rate string may hold several limits separated by `;`, `,` or
    /// `|`; a malformed string is logged and leaves the route without these
    /// limits. Unless `options` names a key function the limiter's default
    /// key function is used.
    pub fn limit(&self, route: &RouteId, rate: impl Into<RateValue>, options: LimitOptions) {
        let options = options.or_key_func(&self.key_func);
        match rate.into() {
            RateValue::Static(rates) => {
                self.registry.register_static(route, &rates, options);
            }
            RateValue::Dynamic(rate) => self.registry.register_dynamic(route, rate, options),
        }
    }

    /// Attach a limit whose counters are shared by every route using `scope`.
    pub fn shared_limit(
        &self,
        route: &RouteId,
        rate: impl Into<RateValue>,
        scope: impl Into<TextSource>,
        options: LimitOptions,
    ) {
        self.limit(route, rate, options.scope(scope));
    }

    /// Exclude `route` from all limits, global ones included.
    pub fn exempt(&self, route: &RouteId) {
        self.registry.exempt(route);
    }

    /// Let requests bypass limiting whenever `filter` returns `true`.
    pub fn request_filter<F>(&self, filter: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.registry.add_request_filter(Arc::new(filter));
    }

    /// Clear all counters in the backend.
    ///
    /// Backends without reset support are logged and left untouched.
    pub async fn reset(&self) {
        match self.gate.backend().reset().await {
            Ok(()) => info!("Storage has been reset and all limits cleared"),
            Err(LimiterError::NotSupported(_)) => {
                warn!("This storage type does not support being reset")
            }
            Err(e) => warn!(error = %e, "Failed to reset storage"),
        }
    }

    /// Check `request` against its applicable limits.
    pub async fn check(&self, request: &RequestInfo) -> std::result::Result<Outcome, GateError> {
        self.gate.check(request).await
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    pub fn enabled(&self) -> bool {
        self.gate.enabled()
    }

    pub fn swallow_errors(&self) -> bool {
        self.gate.swallow_errors()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("gate", &self.gate)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Builder for [`Limiter`].
///
/// Values set on the builder take precedence over the configuration passed
/// to [`LimiterBuilder::build`].
#[derive(Default)]
pub struct LimiterBuilder {
    key_func: Option<KeyFunc>,
    global_limits: Vec<String>,
    strategy: Option<String>,
    storage_url: Option<String>,
    storage_options: HashMap<String, String>,
    swallow_errors: Option<bool>,
    backend: Option<Arc<dyn CountingBackend>>,
}

impl LimiterBuilder {
    /// Default key function for limits that do not name one.
    pub fn key_func(mut self, key_func: KeyFunc) -> Self {
        self.key_func = Some(key_func);
        self
    }

    /// Add a global limit string. Any global limits given here replace the
    /// configured ones entirely.
    pub fn global_limit(mut self, rates: impl Into<String>) -> Self {
        self.global_limits.push(rates.into());
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn storage_url(mut self, url: impl Into<String>) -> Self {
        self.storage_url = Some(url.into());
        self
    }

    pub fn storage_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.storage_options.insert(name.into(), value.into());
        self
    }

    pub fn swallow_errors(mut self, swallow_errors: bool) -> Self {
        self.swallow_errors = Some(swallow_errors);
        self
    }

    /// Use `backend` instead of building one from the storage URL.
    pub fn backend(mut self, backend: Arc<dyn CountingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the limiter.
    ///
    /// Fails on an unknown strategy or an unsupported storage URL.
    pub fn build(self, config: &LimiterConfig) -> Result<Limiter> {
        let strategy: Strategy = self
            .strategy
            .as_deref()
            .unwrap_or(config.strategy.as_str())
            .parse()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let mut options = self.storage_options;
                options.extend(config.storage_options.clone());
                let url = self.storage_url.as_deref().unwrap_or(config.storage_url.as_str());
                backend_from_url(url, &options, strategy)?
            }
        };

        let key_func = self.key_func.unwrap_or_default();
        let registry = Arc::new(RuleRegistry::new());

        let global_limits = if !self.global_limits.is_empty() {
            self.global_limits
        } else {
            config
                .global_limits
                .iter()
                .filter(|limits| !limits.trim().is_empty())
                .cloned()
                .collect()
        };
        registry.register_global(&global_limits, &key_func);

        let gate = RequestGate::new(registry.clone(), backend)
            .with_enabled(config.enabled)
            .with_swallow_errors(self.swallow_errors.unwrap_or(config.swallow_errors));

        info!(
            strategy = %strategy,
            enabled = gate.enabled(),
            swallow_errors = gate.swallow_errors(),
            global_limits = registry.has_global_rules(),
            "Rate limiter initialized"
        );

        Ok(Limiter {
            registry,
            gate,
            key_func,
            strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::item::RateLimitItem;
    use crate::ratelimit::memory::MemoryBackend;
    use crate::route_id;
    use async_trait::async_trait;
    use http::Method;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn t1() {}
    async fn t2() {}

    fn request(route: RouteId, method: Method) -> RequestInfo {
        RequestInfo::new(method, "/").with_route(route)
    }

    fn is_denied(result: &std::result::Result<Outcome, GateError>) -> bool {
        matches!(result, Err(GateError::RateLimited(_)))
    }

    #[test]
    fn test_builder_overrides_config() {
        let config = LimiterConfig {
            enabled: false,
            swallow_errors: false,
            strategy: "fixed-window-elastic-expiry".to_string(),
            ..Default::default()
        };
        let limiter = Limiter::builder()
            .strategy("moving-window")
            .storage_url("memory://")
            .swallow_errors(true)
            .build(&config)
            .unwrap();

        assert_eq!(limiter.strategy(), Strategy::MovingWindow);
        assert!(!limiter.enabled());
        assert!(limiter.swallow_errors());
    }

    #[test]
    fn test_invalid_strategy_aborts() {
        let config = LimiterConfig {
            strategy: "leaky-bucket".to_string(),
            ..Default::default()
        };
        let err = Limiter::builder().build(&config).unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_explicit_global_limits_win_over_config() {
        let config = LimiterConfig {
            global_limits: Some("1 per hour; 10 per day".to_string()),
            ..Default::default()
        };
        let limiter = Limiter::builder().global_limit("5/minute").build(&config).unwrap();
        let resolved = limiter.registry().resolve(&route_id!(t1));
        assert_eq!(resolved.rules.len(), 1);
        assert_eq!(resolved.rules[0].limit().unwrap().to_string(), "5 per 1 minute");

        let limiter = Limiter::builder().build(&config).unwrap();
        assert_eq!(limiter.registry().resolve(&route_id!(t1)).rules.len(), 2);
    }

    #[test]
    fn test_malformed_global_limits_dropped_whole_from_either_source() {
        let config = LimiterConfig {
            global_limits: Some("1 per hour; bogus".to_string()),
            ..Default::default()
        };
        let from_config = Limiter::builder().build(&config).unwrap();
        assert!(!from_config.registry().has_global_rules());

        let from_builder = Limiter::builder()
            .global_limit("1 per hour; bogus")
            .build(&LimiterConfig::default())
            .unwrap();
        assert!(!from_builder.registry().has_global_rules());

        let blank = LimiterConfig {
            global_limits: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(!Limiter::builder().build(&blank).unwrap().registry().has_global_rules());
    }

    #[tokio::test]
    async fn test_per_method_counters() {
        let limiter = Limiter::builder().build(&LimiterConfig::default()).unwrap();
        limiter.limit(&route_id!(t1), "1 per minute", LimitOptions::new().per_method(true));

        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
        assert!(limiter.check(&request(route_id!(t1), Method::POST)).await.is_ok());
        assert!(is_denied(&limiter.check(&request(route_id!(t1), Method::GET)).await));
        assert!(is_denied(&limiter.check(&request(route_id!(t1), Method::POST)).await));
    }

    #[tokio::test]
    async fn test_shared_limit_spans_routes() {
        let limiter = Limiter::builder().build(&LimiterConfig::default()).unwrap();
        limiter.shared_limit(&route_id!(t1), "1/hour", "auth", LimitOptions::new());
        limiter.shared_limit(&route_id!(t2), "1/hour", "auth", LimitOptions::new());

        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
        assert!(is_denied(&limiter.check(&request(route_id!(t2), Method::GET)).await));
    }

    #[tokio::test]
    async fn test_dynamic_limit_tracks_callable() {
        let limiter = Limiter::builder().build(&LimiterConfig::default()).unwrap();
        let premium = Arc::new(AtomicBool::new(false));
        let flag = premium.clone();
        limiter.limit(
            &route_id!(t1),
            RateValue::dynamic(move || {
                let rate = if flag.load(Ordering::SeqCst) { "2/hour" } else { "1/hour" };
                rate.to_string()
            }),
            LimitOptions::new(),
        );

        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
        assert!(is_denied(&limiter.check(&request(route_id!(t1), Method::GET)).await));

        // The higher tier is a different limit with its own counter.
        premium.store(true, Ordering::SeqCst);
        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
    }

    #[tokio::test]
    async fn test_default_key_func_applies() {
        let limiter = Limiter::builder()
            .key_func(KeyFunc::from_request(|r| Ok(r.header("x-user").unwrap_or("anon").to_string())))
            .build(&LimiterConfig::default())
            .unwrap();
        limiter.limit(&route_id!(t1), "1/hour", LimitOptions::new());

        let alice = request(route_id!(t1), Method::GET).with_header("x-user", "alice");
        let bob = request(route_id!(t1), Method::GET).with_header("x-user", "bob");
        assert!(limiter.check(&alice).await.is_ok());
        assert!(limiter.check(&bob).await.is_ok());
        assert!(is_denied(&limiter.check(&alice).await));
    }

    #[tokio::test]
    async fn test_request_filter_bypasses() {
        let limiter = Limiter::builder()
            .global_limit("1/day")
            .build(&LimiterConfig::default())
            .unwrap();
        let maintenance = Arc::new(AtomicBool::new(true));
        let flag = maintenance.clone();
        limiter.request_filter(move || flag.load(Ordering::SeqCst));

        for _ in 0..3 {
            assert_eq!(
                limiter.check(&request(route_id!(t1), Method::GET)).await.unwrap(),
                Outcome::Filtered
            );
        }
        maintenance.store(false, Ordering::SeqCst);
        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
        assert!(is_denied(&limiter.check(&request(route_id!(t1), Method::GET)).await));
    }

    #[tokio::test]
    async fn test_reset_clears_memory_backend() {
        let backend = Arc::new(MemoryBackend::default());
        let limiter = Limiter::builder()
            .backend(backend.clone())
            .build(&LimiterConfig::default())
            .unwrap();
        limiter.limit(&route_id!(t1), "1/day", LimitOptions::new());

        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
        assert!(is_denied(&limiter.check(&request(route_id!(t1), Method::GET)).await));

        limiter.reset().await;
        assert_eq!(backend.counter_count(), 0);
        assert!(limiter.check(&request(route_id!(t1), Method::GET)).await.is_ok());
    }

    struct NoResetBackend;

    #[async_trait]
    impl CountingBackend for NoResetBackend {
        async fn hit(&self, _limit: &RateLimitItem, _key: &str, _scope: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_reset_not_supported_is_logged() {
        let limiter = Limiter::builder()
            .backend(Arc::new(NoResetBackend))
            .build(&LimiterConfig::default())
            .unwrap();

        assert!(matches!(
            limiter.gate().backend().reset().await,
            Err(LimiterError::NotSupported(_))
        ));
        limiter.reset().await;
    }
}
