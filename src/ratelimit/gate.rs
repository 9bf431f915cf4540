//! Per-request limit enforcement.

use std::sync::Arc;

use tracing::{debug, error, instrument, trace, warn};

use super::backend::CountingBackend;
use super::route::{RequestInfo, RouteId};
use super::rules::RuleRegistry;
use crate::error::{GateError, RateLimitExceeded};

/// Why the gate let a request through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Limiting is switched off
    Disabled,
    /// No handler matched the request
    Unmatched,
    /// The route is exempt from limiting
    ExemptRoute,
    /// A request filter matched
    Filtered,
    /// Neither route nor global rules apply
    NoRules,
    /// The rule at `index` is currently exempt
    ExemptRule { index: usize },
    /// The rule at `index` does not cover the request's method
    MethodNotLimited { index: usize },
    /// Every rule was evaluated and none was exhausted
    Passed { evaluated: usize },
    /// Evaluation failed and the error was logged instead of raised
    ErrorSwallowed,
}

/// Decides whether a request may reach its handler.
///
/// Safe to share across tasks; the backend is the only shared mutable state.
pub struct RequestGate {
    registry: Arc<RuleRegistry>,
    backend: Arc<dyn CountingBackend>,
    enabled: bool,
    swallow_errors: bool,
}

impl RequestGate {
    pub fn new(registry: Arc<RuleRegistry>, backend: Arc<dyn CountingBackend>) -> Self {
        Self {
            registry,
            backend,
            enabled: true,
            swallow_errors: false,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Allow requests through when evaluation fails unexpectedly.
    pub fn with_swallow_errors(mut self, swallow_errors: bool) -> Self {
        self.swallow_errors = swallow_errors;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn swallow_errors(&self) -> bool {
        self.swallow_errors
    }

    pub fn backend(&self) -> &Arc<dyn CountingBackend> {
        &self.backend
    }

    /// Check `request` against every applicable limit.
    ///
    /// Returns [`GateError::RateLimited`] on the first exhausted limit. That
    /// denial is raised even when errors are swallowed; only unexpected
    /// failures are subject to `swallow_errors`.
    #[instrument(
        skip(self, request),
        fields(method = %request.method, path = %request.path)
    )]
    pub async fn check(&self, request: &RequestInfo) -> Result<Outcome, GateError> {
        let route = match &request.route {
            Some(route) => route,
            None => return Ok(Outcome::Unmatched),
        };
        if !self.enabled {
            return Ok(Outcome::Disabled);
        }
        if self.registry.is_exempt(route) {
            trace!(route = %route, "Route is exempt");
            return Ok(Outcome::ExemptRoute);
        }
        if self.registry.is_filtered() {
            trace!(route = %route, "Request filter matched");
            return Ok(Outcome::Filtered);
        }

        match self.evaluate(request, route).await {
            Err(GateError::Unexpected(e)) if self.swallow_errors => {
                error!(route = %route, error = %e, "Failed to rate limit. Swallowing error");
                Ok(Outcome::ErrorSwallowed)
            }
            result => result,
        }
    }

    async fn evaluate(&self, request: &RequestInfo, route: &RouteId) -> Result<Outcome, GateError> {
        let resolved = self.registry.resolve(route);
        if resolved.rules.is_empty() {
            return Ok(Outcome::NoRules);
        }

        let method = request.method.as_str();
        for (index, rule) in resolved.rules.iter().enumerate() {
            if rule.is_exempt() {
                trace!(route = %route, index, "Limit is exempt");
                return Ok(Outcome::ExemptRule { index });
            }
            if !rule.applies_to(method) {
                trace!(route = %route, index, method, "Limit does not cover method");
                return Ok(Outcome::MethodNotLimited { index });
            }

            let mut scope = rule.scope().unwrap_or_else(|| route.to_string());
            if rule.per_method() {
                scope.push(':');
                scope.push_str(method);
            }
            let key = rule.key(request)?;
            let limit = rule.limit()?;

            if !self.backend.hit(&limit, &key, &scope).await? {
                warn!(
                    limit = %limit,
                    key = %key,
                    scope = %scope,
                    "ratelimit exceeded"
                );
                let message = rule.error_message().unwrap_or_else(|| limit.to_string());
                return Err(RateLimitExceeded::new(Some(message)).into());
            }
        }

        debug!(route = %route, source = ?resolved.source, evaluated = resolved.rules.len(), "Request within limits");
        Ok(Outcome::Passed {
            evaluated: resolved.rules.len(),
        })
    }
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("registry", &self.registry)
            .field("enabled", &self.enabled)
            .field("swallow_errors", &self.swallow_errors)
            .finish()
    }
}
