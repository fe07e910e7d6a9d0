//! Per-request admission control.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::bucket::Admission;
use super::clock::{Clock, SystemClock};
use super::registry::BucketRegistry;
use super::route::{RouteResolver, DEFAULT_MAX_MEMOIZED_PATHS};
use super::rules::RateConfig;
use super::signature::{derive_signature, RequestView};

/// What the HTTP layer should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request.
    Allow,
    /// The client's quota for this path is exhausted.
    Deny {
        /// Time until the bucket is refilled.
        retry_after: Duration,
    },
    /// The identity header failed its strategy's validation.
    InvalidSignature { status_code: u16, message: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// The rate limiter shared by all request handlers.
///
/// Thread-safe; wrap it in an `Arc` and hand it to each handler.
#[derive(Debug)]
pub struct RateLimiter {
    config: Arc<RateConfig>,
    resolver: RouteResolver,
    registry: Arc<BucketRegistry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(config: RateConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter with a custom time source.
    pub fn with_clock(config: RateConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_options(config, clock, DEFAULT_MAX_MEMOIZED_PATHS)
    }

    /// Create a rate limiter with a custom time source and route memo bound.
    pub fn with_options(
        config: RateConfig,
        clock: Arc<dyn Clock>,
        max_memoized_paths: usize,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            resolver: RouteResolver::with_memo_limit(Arc::clone(&config), max_memoized_paths),
            config,
            registry: Arc::new(BucketRegistry::new()),
            clock,
        }
    }

    /// Decide whether `request` may pass.
    ///
    /// Invalid identity headers are rejected before any bucket is touched.
    /// Paths matching no route are not limited.
    pub fn check<R: RequestView + ?Sized>(&self, request: &R) -> Decision {
        let identified = match derive_signature(
            request,
            self.config.strategies(),
            self.config.ip_strategy(),
        ) {
            Ok(identified) => identified,
            Err(rejection) => {
                return Decision::InvalidSignature {
                    status_code: rejection.status_code,
                    message: rejection.message,
                }
            }
        };

        let path = request.path();
        let Some(route) = self.resolver.resolve_route(path) else {
            trace!(path = path, "No route matched, not limiting");
            return Decision::Allow;
        };
        let quota = self.resolver.resolve_quota(route, identified.strategy);

        let now = self.clock.now();
        let admission = self.registry.acquire(&identified.signature, path, quota, now);

        trace!(
            signature = %identified.signature,
            path = path,
            route = route.pattern(),
            admitted = admission.is_admitted(),
            "Rate limit decision made"
        );

        match admission {
            Admission::Admitted => Decision::Allow,
            Admission::Rejected { retry_after } => {
                debug!(
                    signature = %identified.signature,
                    path = path,
                    quota = %quota,
                    "Rate limit exceeded"
                );
                Decision::Deny { retry_after }
            }
        }
    }

    pub fn config(&self) -> &Arc<RateConfig> {
        &self.config
    }

    /// The registry, shared with the reaper.
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of client boxes.
    pub fn box_count(&self) -> usize {
        self.registry.box_count()
    }

    /// Number of buckets across all clients.
    pub fn bucket_count(&self) -> usize {
        self.registry.bucket_count()
    }
}
