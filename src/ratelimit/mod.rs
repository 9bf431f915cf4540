//! Limit registration, resolution and enforcement.

mod backend;
mod counter;
mod gate;
mod item;
mod limit;
mod limiter;
mod memory;
mod route;
mod rules;

pub use backend::{backend_from_url, CountingBackend, Strategy};
pub use counter::{MovingWindow, WindowCounter};
pub use gate::{Outcome, RequestGate};
pub use item::{parse_many, Granularity, RateLimitItem, MAX_PERIOD};
pub use limit::{KeyFunc, LimitOptions, LimitSpec, Predicate, RateSource, RequestKeyFn, StaticKeyFn, StringFn, TextSource};
pub use limiter::{Limiter, LimiterBuilder, RateValue};
pub use memory::{MemoryBackend, OPTION_PURGE_THRESHOLD};
pub use route::{remote_address, RequestInfo, RouteId, RouteResolver, RouteTable};
pub use rules::{computed_rate, ResolvedRules, RuleRegistry, RuleSource};
