//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;
mod rate;
mod reaper;
mod registry;
mod route;
mod rules;
mod signature;
mod strategy;

pub use bucket::{Admission, Bucket};
pub use clock::{Clock, MockClock, SystemClock};
pub use limiter::{Decision, RateLimiter};
pub use rate::{RateSpec, TimeUnit};
pub use reaper::{Reaper, ReaperSettings};
pub use registry::{BucketRegistry, ClientBox, SweepStats};
pub use route::{RouteResolver, RouteRule, DEFAULT_MAX_MEMOIZED_PATHS};
pub use rules::{
    RateByRule, RateConfig, RateConfigBuilder, RateRule, RouteConfig, RulesFile, SignatureRule,
    ValidateRule,
};
pub use signature::{derive_signature, ClientSignature, Identified, Rejection, RequestView};
pub use strategy::{
    IdentityStrategy, KeyDerivation, RateBy, StrategyId, Validator, IP_STRATEGY_NAME,
};
