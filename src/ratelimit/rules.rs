//! Registry of the limits bound to each route.
//!
//! Routes may carry static limits (parsed once, at registration) and dynamic
//! limits (a callable re-parsed on every request). Routes with neither fall
//! back to the global limits. Exempt routes and request filters bypass
//! limiting entirely.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::limit::{KeyFunc, LimitOptions, LimitSpec, Predicate, RateSource, StringFn};
use super::route::RouteId;

/// Where the rules resolved for a route came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    /// The route's own static and dynamic rules
    Route,
    /// The global fallback rules
    Global,
}

/// The ordered rules to evaluate for one request.
#[derive(Debug, Clone)]
pub struct ResolvedRules {
    pub source: RuleSource,
    pub rules: Vec<LimitSpec>,
}

/// All registered limits.
///
/// Populated during application setup and read on every request. Every
/// collection sits behind its own lock so registration stays safe after
/// traffic starts.
#[derive(Default)]
pub struct RuleRegistry {
    static_rules: RwLock<HashMap<RouteId, Vec<LimitSpec>>>,
    dynamic_rules: RwLock<HashMap<RouteId, Vec<LimitSpec>>>,
    global_rules: RwLock<Vec<LimitSpec>>,
    exempt_routes: RwLock<HashSet<RouteId>>,
    request_filters: RwLock<Vec<Predicate>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the limits in `rates` to `route`.
    ///
    /// A malformed rate string is logged and registers nothing; the route is
    /// left unprotected rather than failing startup. Returns the number of
    /// rules added.
    pub fn register_static(&self, route: &RouteId, rates: &str, options: LimitOptions) -> usize {
        match LimitSpec::parse(rates, options) {
            Ok(specs) => {
                let added = specs.len();
                debug!(route = %route, rates = %rates, added, "Registered static limits");
                self.static_rules
                    .write()
                    .entry(route.clone())
                    .or_default()
                    .extend(specs);
                added
            }
            Err(e) => {
                error!(route = %route, error = %e, "failed to configure limits for route");
                0
            }
        }
    }

    /// Attach a limit whose rate is recomputed on every request.
    pub fn register_dynamic(&self, route: &RouteId, rate: StringFn, options: LimitOptions) {
        debug!(route = %route, "Registered dynamic limit");
        self.dynamic_rules
            .write()
            .entry(route.clone())
            .or_default()
            .push(LimitSpec::new(RateSource::Computed(rate), options));
    }

    /// Append global limits, tracked per `key_func`.
    ///
    /// Malformed strings are logged and skipped. Returns the number of rules added.
    pub fn register_global(&self, rates: &[String], key_func: &KeyFunc) -> usize {
        let mut added = 0;
        for rate in rates {
            match LimitSpec::parse(rate, LimitOptions::new().key_func(key_func.clone())) {
                Ok(specs) => {
                    added += specs.len();
                    self.global_rules.write().extend(specs);
                }
                Err(e) => error!(rates = %rate, error = %e, "failed to configure global limits"),
            }
        }
        added
    }

    /// Whether any global limits are registered.
    pub fn has_global_rules(&self) -> bool {
        !self.global_rules.read().is_empty()
    }

    /// Exclude `route` from all limiting.
    pub fn exempt(&self, route: &RouteId) {
        self.exempt_routes.write().insert(route.clone());
    }

    pub fn is_exempt(&self, route: &RouteId) -> bool {
        self.exempt_routes.read().contains(route)
    }

    /// Add a filter that lets a request bypass limiting when it returns `true`.
    ///
    /// Filters run in the order they were added. Adding the same filter twice
    /// has no effect.
    pub fn add_request_filter(&self, filter: Predicate) {
        let mut filters = self.request_filters.write();
        if !filters.iter().any(|f| Arc::ptr_eq(f, &filter)) {
            filters.push(filter);
        }
    }

    pub fn request_filter_count(&self) -> usize {
        self.request_filters.read().len()
    }

    /// Whether any request filter currently matches.
    pub fn is_filtered(&self) -> bool {
        // User callables never run under the lock.
        let filters: Vec<Predicate> = self.request_filters.read().clone();
        filters.iter().any(|filter| filter())
    }

    /// Number of static rules registered for `route`.
    pub fn static_rule_count(&self, route: &RouteId) -> usize {
        self.static_rules.read().get(route).map_or(0, Vec::len)
    }

    /// Number of dynamic templates registered for `route`.
    pub fn dynamic_rule_count(&self, route: &RouteId) -> usize {
        self.dynamic_rules.read().get(route).map_or(0, Vec::len)
    }

    /// Compute the ordered rules for a request to `route`.
    ///
    /// The route's static rules come first, followed by its dynamic rules
    /// expanded from their current values. A dynamic rule producing a
    /// malformed value is logged and contributes nothing to this call. When
    /// the route has no rules at all the global rules apply instead; the two
    /// sources are never combined.
    pub fn resolve(&self, route: &RouteId) -> ResolvedRules {
        let mut rules = self
            .static_rules
            .read()
            .get(route)
            .cloned()
            .unwrap_or_default();

        let templates = self
            .dynamic_rules
            .read()
            .get(route)
            .cloned()
            .unwrap_or_default();
        for template in &templates {
            match template.expand() {
                Ok(specs) => rules.extend(specs),
                Err(e) => {
                    error!(route = %route, error = %e, "failed to load ratelimit for route")
                }
            }
        }

        if rules.is_empty() {
            ResolvedRules {
                source: RuleSource::Global,
                rules: self.global_rules.read().clone(),
            }
        } else {
            ResolvedRules {
                source: RuleSource::Route,
                rules,
            }
        }
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("static_routes", &self.static_rules.read().len())
            .field("dynamic_routes", &self.dynamic_rules.read().len())
            .field("global_rules", &self.global_rules.read().len())
            .field("exempt_routes", &self.exempt_routes.read().len())
            .field("request_filters", &self.request_filters.read().len())
            .finish()
    }
}

/// Wrap a closure as a dynamic rate source.
pub fn computed_rate<F>(f: F) -> StringFn
where
    F: Fn() -> String + Send + Sync + 'static,
{
    Arc::new(f)
}
