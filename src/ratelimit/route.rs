//! Route matching and quota resolution.

use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use super::rate::RateSpec;
use super::rules::RateConfig;
use super::strategy::StrategyId;
use crate::error::Result;

/// Default bound on the number of distinct paths remembered by the resolver.
pub const DEFAULT_MAX_MEMOIZED_PATHS: usize = 100_000;

/// A path pattern with the quotas that apply to requests matching it.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pattern: Regex,
    rates: HashMap<StrategyId, RateSpec>,
    default_rate: Option<RateSpec>,
}

impl RouteRule {
    /// Create a route from an unanchored regular expression.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            rates: HashMap::new(),
            default_rate: None,
        })
    }

    /// Quota for clients identified by `strategy`.
    pub fn rate(mut self, strategy: StrategyId, rate: RateSpec) -> Self {
        self.rates.insert(strategy, rate);
        self
    }

    /// Quota for strategies without a specific entry.
    pub fn default_rate(mut self, rate: RateSpec) -> Self {
        self.default_rate = Some(rate);
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    pub(crate) fn strategies(&self) -> impl Iterator<Item = &StrategyId> {
        self.rates.keys()
    }

    /// The quota for `strategy`: its own entry, then the route default,
    /// then `base`.
    pub fn resolve_rate(&self, strategy: StrategyId, base: RateSpec) -> RateSpec {
        self.rates
            .get(&strategy)
            .copied()
            .or(self.default_rate)
            .unwrap_or(base)
    }
}

/// Memoizing path → route lookup.
///
/// Configuration never changes after load, so the first answer for a path
/// is the answer forever. The memo has its own locks and is never consulted
/// while a registry lock is held.
#[derive(Debug)]
pub struct RouteResolver {
    config: Arc<RateConfig>,
    memo: DashMap<String, Option<usize>>,
    max_memoized: usize,
}

impl RouteResolver {
    pub fn new(config: Arc<RateConfig>) -> Self {
        Self::with_memo_limit(config, DEFAULT_MAX_MEMOIZED_PATHS)
    }

    /// Create a resolver that remembers at most `max_memoized` paths;
    /// lookups beyond that fall back to a scan.
    pub fn with_memo_limit(config: Arc<RateConfig>, max_memoized: usize) -> Self {
        Self {
            config,
            memo: DashMap::new(),
            max_memoized,
        }
    }

    /// First route, in declaration order, whose pattern matches `path`.
    pub fn resolve_route(&self, path: &str) -> Option<&RouteRule> {
        let cached = self.memo.get(path).map(|hit| *hit);
        let index = match cached {
            Some(index) => index,
            None => {
                let index = self.scan(path);
                if self.memo.len() < self.max_memoized {
                    self.memo.insert(path.to_string(), index);
                }
                index
            }
        };
        index.map(|i| &self.config.routes()[i])
    }

    /// Quota for a request identified by `strategy` on `route`.
    pub fn resolve_quota(&self, route: &RouteRule, strategy: StrategyId) -> RateSpec {
        route.resolve_rate(strategy, self.config.base_rate())
    }

    pub fn config(&self) -> &Arc<RateConfig> {
        &self.config
    }

    /// Number of memoized paths.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    fn scan(&self, path: &str) -> Option<usize> {
        let index = self
            .config
            .routes()
            .iter()
            .position(|route| route.matches(path));
        trace!(path = path, route = ?index, "Resolved route");
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rate::TimeUnit;
    use crate::ratelimit::strategy::RateBy;
    use std::time::Duration;

    fn config() -> (Arc<RateConfig>, StrategyId) {
        let mut builder = RateConfig::builder(RateSpec::per(100, TimeUnit::Minute).unwrap());
        let key = builder.rate_by(RateBy::header("key", "X-Api-Key")).unwrap();

        builder.route(
            RouteRule::new("^/api/admin")
                .unwrap()
                .rate(key, RateSpec::per(1, TimeUnit::Second).unwrap()),
        );
        builder.route(
            RouteRule::new("^/api/")
                .unwrap()
                .rate(StrategyId::IP, RateSpec::per(2, TimeUnit::Minute).unwrap())
                .default_rate(RateSpec::per(10, TimeUnit::Minute).unwrap()),
        );
        (Arc::new(builder.build().unwrap()), key)
    }

    #[test]
    fn test_first_match_wins() {
        let (config, _) = config();
        let resolver = RouteResolver::new(config);

        let route = resolver.resolve_route("/api/admin/users").unwrap();
        assert_eq!(route.pattern(), "^/api/admin");

        let route = resolver.resolve_route("/api/items").unwrap();
        assert_eq!(route.pattern(), "^/api/");
    }

    #[test]
    fn test_unmatched_path() {
        let (config, _) = config();
        let resolver = RouteResolver::new(config);
        assert!(resolver.resolve_route("/health").is_none());
        // Misses are remembered too
        assert_eq!(resolver.memoized(), 1);
        assert!(resolver.resolve_route("/health").is_none());
    }

    #[test]
    fn test_memo_is_reused() {
        let (config, _) = config();
        let resolver = RouteResolver::new(config);

        resolver.resolve_route("/api/a");
        resolver.resolve_route("/api/a");
        resolver.resolve_route("/api/b");
        assert_eq!(resolver.memoized(), 2);
    }

    #[test]
    fn test_memo_limit() {
        let (config, _) = config();
        let resolver = RouteResolver::with_memo_limit(config, 1);

        resolver.resolve_route("/api/a");
        let route = resolver.resolve_route("/api/admin").unwrap();
        assert_eq!(route.pattern(), "^/api/admin");
        assert_eq!(resolver.memoized(), 1);
    }

    #[test]
    fn test_quota_resolution_order() {
        let (config, key) = config();
        let resolver = RouteResolver::new(config);

        let api = resolver.resolve_route("/api/items").unwrap();
        // Specific entry
        let ip_rate = resolver.resolve_quota(api, StrategyId::IP);
        assert_eq!(ip_rate.capacity(), 2);
        // Route default
        let key_rate = resolver.resolve_quota(api, key);
        assert_eq!(key_rate.capacity(), 10);

        // Base rate when the route has no default
        let admin = resolver.resolve_route("/api/admin").unwrap();
        let base = resolver.resolve_quota(admin, StrategyId::IP);
        assert_eq!(base.capacity(), 100);
        assert_eq!(base.refill_period(), Duration::from_secs(60));
    }
}
