//! Route identity and the request view the gate works with.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use http::{HeaderMap, Method};

/// Identifies the handler a limit is bound to.
///
/// Route identity follows the handler rather than the URL: two paths served
/// by one handler share a `RouteId` and therefore share its counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(Arc<str>);

impl RouteId {
    /// Create a route identifier from a handler's module path and name.
    pub fn new(module: &str, handler: &str) -> Self {
        Self(format!("{}::{}", module, handler).into())
    }

    /// Use `id` verbatim as the route identifier.
    pub fn from_raw(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the [`RouteId`] of a handler defined in the calling module.
///
/// ```
/// use route_limiter::route_id;
///
/// async fn index() {}
///
/// let id = route_id!(index);
/// assert!(id.as_str().ends_with("::index"));
/// ```
#[macro_export]
macro_rules! route_id {
    ($handler:ident) => {
        $crate::ratelimit::RouteId::new(module_path!(), stringify!($handler))
    };
}

/// Maps an inbound request to the handler that will serve it.
pub trait RouteResolver: Send + Sync {
    /// Returns `None` when no handler matches.
    fn resolve(&self, method: &Method, path: &str) -> Option<RouteId>;
}

/// Exact path lookup table, the counterpart of a router's static routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteId>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `path` with the handler identified by `route`.
    pub fn route(mut self, path: impl Into<String>, route: RouteId) -> Self {
        self.routes.insert(path.into(), route);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteResolver for RouteTable {
    fn resolve(&self, _method: &Method, path: &str) -> Option<RouteId> {
        self.routes.get(path).cloned()
    }
}

/// The parts of an HTTP request limits are evaluated against.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// HTTP method as received
    pub method: Method,
    /// Request path
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Peer address of the connection, if known
    pub remote_addr: Option<IpAddr>,
    /// Handler serving this request, if one matched
    pub route: Option<RouteId>,
}

impl RequestInfo {
    /// Create a request view with no headers, peer address or route.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            remote_addr: None,
            route: None,
        }
    }

    pub fn with_route(mut self, route: RouteId) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse::<http::HeaderValue>() {
            self.headers.insert(name, value);
        }
        self
    }

    /// Capture an HTTP request, resolving its route through `resolver`.
    ///
    /// The peer address is read from axum's `ConnectInfo` extension.
    pub fn from_http<B>(request: &http::Request<B>, resolver: &dyn RouteResolver) -> Self {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let route = resolver.resolve(&method, &path);
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Self {
            method,
            path,
            headers: request.headers().clone(),
            remote_addr,
            route,
        }
    }

    /// Value of header `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The peer IP of a request, or `127.0.0.1` when none is known.
pub fn remote_address(request: &RequestInfo) -> String {
    request
        .remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
