//! Limit specifications and the callables they carry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::item::{parse_many, RateLimitItem};
use super::route::{remote_address, RequestInfo};
use crate::error::Result;

/// Zero-argument callable producing a string.
pub type StringFn = Arc<dyn Fn() -> String + Send + Sync>;
/// Zero-argument predicate.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
/// Callable deriving a tracking key without looking at the request.
pub type StaticKeyFn = Arc<dyn Fn() -> Result<String> + Send + Sync>;
/// Callable deriving a tracking key from a request.
pub type RequestKeyFn = Arc<dyn Fn(&RequestInfo) -> Result<String> + Send + Sync>;

/// Where a limit's rate comes from.
#[derive(Clone)]
pub enum RateSource {
    /// A rate known at registration time
    Literal(RateLimitItem),
    /// A rate string recomputed on every request
    Computed(StringFn),
}

impl RateSource {
    /// Resolve into concrete rate limits, invoking the callable if needed.
    pub fn resolve(&self) -> Result<Vec<RateLimitItem>> {
        match self {
            RateSource::Literal(item) => Ok(vec![*item]),
            RateSource::Computed(rate) => parse_many(&rate()),
        }
    }
}

impl fmt::Debug for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSource::Literal(item) => f.debug_tuple("Literal").field(item).finish(),
            RateSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Derives the identity a quota is tracked per.
///
/// A key function that cannot produce a key returns an error; the gate
/// treats it like any other unexpected evaluation failure.
#[derive(Clone)]
pub enum KeyFunc {
    /// Key independent of the request
    Static(StaticKeyFn),
    /// Key read from the request
    Request(RequestKeyFn),
}

impl KeyFunc {
    pub fn from_static<F>(f: F) -> Self
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        KeyFunc::Static(Arc::new(f))
    }

    pub fn from_request<F>(f: F) -> Self
    where
        F: Fn(&RequestInfo) -> Result<String> + Send + Sync + 'static,
    {
        KeyFunc::Request(Arc::new(f))
    }

    /// Track by the peer address of the request.
    pub fn remote_address() -> Self {
        Self::from_request(|request| Ok(remote_address(request)))
    }

    pub fn key(&self, request: &RequestInfo) -> Result<String> {
        match self {
            KeyFunc::Static(f) => f(),
            KeyFunc::Request(f) => f(request),
        }
    }
}

impl Default for KeyFunc {
    fn default() -> Self {
        Self::remote_address()
    }
}

impl fmt::Debug for KeyFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFunc::Static(_) => f.write_str("Static(..)"),
            KeyFunc::Request(_) => f.write_str("Request(..)"),
        }
    }
}

/// A string given up front or produced on demand.
///
/// Used for explicit scopes and custom error messages.
#[derive(Clone)]
pub enum TextSource {
    Fixed(String),
    Computed(StringFn),
}

impl TextSource {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        TextSource::Computed(Arc::new(f))
    }

    pub fn resolve(&self) -> String {
        match self {
            TextSource::Fixed(text) => text.clone(),
            TextSource::Computed(f) => f(),
        }
    }
}

impl From<&str> for TextSource {
    fn from(text: &str) -> Self {
        TextSource::Fixed(text.to_string())
    }
}

impl From<String> for TextSource {
    fn from(text: String) -> Self {
        TextSource::Fixed(text)
    }
}

impl fmt::Debug for TextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextSource::Fixed(text) => f.debug_tuple("Fixed").field(text).finish(),
            TextSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Everything about a limit except its rate.
///
/// Built once per registration and shared by every rule expanded from it.
#[derive(Clone, Default)]
pub struct LimitOptions {
    pub(crate) key_func: Option<KeyFunc>,
    pub(crate) scope: Option<TextSource>,
    pub(crate) per_method: bool,
    pub(crate) methods: Option<HashSet<String>>,
    pub(crate) error_message: Option<TextSource>,
    pub(crate) exempt_when: Option<Predicate>,
}

impl LimitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the quota per key returned by `key_func`.
    pub fn key_func(mut self, key_func: KeyFunc) -> Self {
        self.key_func = Some(key_func);
        self
    }

    /// Namespace counters under `scope` instead of the route.
    pub fn scope(mut self, scope: impl Into<TextSource>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Partition the quota by HTTP method.
    pub fn per_method(mut self, per_method: bool) -> Self {
        self.per_method = per_method;
        self
    }

    /// Only apply to these HTTP methods (case-insensitive).
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods = Some(
            methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_uppercase())
                .collect(),
        );
        self
    }

    /// Message shown when this limit rejects a request.
    pub fn error_message(mut self, message: impl Into<TextSource>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Skip the limit while `predicate` returns `true`.
    pub fn exempt_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.exempt_when = Some(Arc::new(predicate));
        self
    }

    /// Fill in `key_func` unless one was chosen explicitly.
    pub(crate) fn or_key_func(mut self, key_func: &KeyFunc) -> Self {
        if self.key_func.is_none() {
            self.key_func = Some(key_func.clone());
        }
        self
    }
}

impl fmt::Debug for LimitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitOptions")
            .field("key_func", &self.key_func)
            .field("scope", &self.scope)
            .field("per_method", &self.per_method)
            .field("methods", &self.methods)
            .field("error_message", &self.error_message)
            .field("exempt_when", &self.exempt_when.is_some())
            .finish()
    }
}

/// One rate rule together with the context it is evaluated in.
#[derive(Debug, Clone)]
pub struct LimitSpec {
    rate: RateSource,
    options: Arc<LimitOptions>,
}

impl LimitSpec {
    pub fn new(rate: RateSource, options: LimitOptions) -> Self {
        Self {
            rate,
            options: Arc::new(options),
        }
    }

    /// Specs for each limit in a rate string, sharing `options`.
    pub fn parse(rates: &str, options: LimitOptions) -> Result<Vec<LimitSpec>> {
        let options = Arc::new(options);
        Ok(parse_many(rates)?
            .into_iter()
            .map(|item| Self {
                rate: RateSource::Literal(item),
                options: options.clone(),
            })
            .collect())
    }

    /// Concrete specs for the rate's current value.
    ///
    /// A literal spec expands to itself.
    pub fn expand(&self) -> Result<Vec<LimitSpec>> {
        if let RateSource::Literal(_) = self.rate {
            return Ok(vec![self.clone()]);
        }
        Ok(self
            .rate
            .resolve()?
            .into_iter()
            .map(|item| Self {
                rate: RateSource::Literal(item),
                options: self.options.clone(),
            })
            .collect())
    }

    pub fn rate(&self) -> &RateSource {
        &self.rate
    }

    /// The rate limit this spec enforces.
    ///
    /// A computed spec yields the first limit of its current value.
    pub fn limit(&self) -> Result<RateLimitItem> {
        match &self.rate {
            RateSource::Literal(item) => Ok(*item),
            computed => Ok(computed.resolve()?[0]),
        }
    }

    /// Explicit scope, resolved.
    pub fn scope(&self) -> Option<String> {
        self.options.scope.as_ref().map(TextSource::resolve)
    }

    pub fn per_method(&self) -> bool {
        self.options.per_method
    }

    /// Whether a request with `method` falls under this spec.
    pub fn applies_to(&self, method: &str) -> bool {
        match &self.options.methods {
            Some(methods) => methods.contains(&method.to_ascii_uppercase()),
            None => true,
        }
    }

    /// Whether the exemption predicate currently holds.
    pub fn is_exempt(&self) -> bool {
        self.options.exempt_when.as_ref().is_some_and(|exempt| exempt())
    }

    /// Tracking key for `request`.
    pub fn key(&self, request: &RequestInfo) -> Result<String> {
        match &self.options.key_func {
            Some(key_func) => key_func.key(request),
            None => Ok(remote_address(request)),
        }
    }

    /// Custom rejection message, resolved.
    pub fn error_message(&self) -> Option<String> {
        self.options.error_message.as_ref().map(TextSource::resolve)
    }
}
