//! Rate limit rules: the immutable configuration the limiter runs on.
//!
//! Rules are usually loaded from YAML, but can be assembled in code through
//! [`RateConfig::builder`]. Either way every check happens here, before any
//! traffic is served.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::info;

use super::rate::{RateSpec, TimeUnit};
use super::route::RouteRule;
use super::strategy::{
    IdentityStrategy, KeyDerivation, RateBy, StrategyId, Validator, IP_STRATEGY_NAME,
};
use crate::error::{Result, UrsaError};

/// Compiled, immutable rate configuration.
#[derive(Debug, Clone)]
pub struct RateConfig {
    base_rate: RateSpec,
    ip: IdentityStrategy,
    strategies: Vec<IdentityStrategy>,
    routes: Vec<RouteRule>,
}

impl RateConfig {
    /// Start assembling a configuration whose fallback quota is `base_rate`.
    pub fn builder(base_rate: RateSpec) -> RateConfigBuilder {
        RateConfigBuilder {
            base_rate,
            strategies: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)?;
        file.compile()
    }

    /// Quota used when neither the route nor the strategy defines one.
    pub fn base_rate(&self) -> RateSpec {
        self.base_rate
    }

    /// Header strategies, in the order they are tried.
    pub fn strategies(&self) -> &[IdentityStrategy] {
        &self.strategies
    }

    /// The built-in IP strategy.
    pub fn ip_strategy(&self) -> &IdentityStrategy {
        &self.ip
    }

    pub fn routes(&self) -> &[RouteRule] {
        &self.routes
    }

    /// Look a strategy up by name, including `ip`.
    pub fn strategy_id(&self, name: &str) -> Option<StrategyId> {
        if name == IP_STRATEGY_NAME {
            return Some(StrategyId::IP);
        }
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.id())
    }
}

/// Builder for [`RateConfig`].
#[derive(Debug)]
pub struct RateConfigBuilder {
    base_rate: RateSpec,
    strategies: Vec<IdentityStrategy>,
    routes: Vec<RouteRule>,
}

impl RateConfigBuilder {
    /// Register a header strategy. Strategies are tried in registration order.
    pub fn rate_by(&mut self, rate_by: RateBy) -> Result<StrategyId> {
        if self.strategies.iter().any(|s| s.name() == rate_by.name()) {
            return Err(UrsaError::config(format!(
                "duplicate rate-by strategy '{}'",
                rate_by.name()
            )));
        }
        let strategy = rate_by.build(StrategyId::nth(self.strategies.len()))?;
        let id = strategy.id();
        self.strategies.push(strategy);
        Ok(id)
    }

    /// Append a route. Routes are matched in the order they are added.
    pub fn route(&mut self, route: RouteRule) -> &mut Self {
        self.routes.push(route);
        self
    }

    pub fn build(self) -> Result<RateConfig> {
        let known: HashSet<StrategyId> = self
            .strategies
            .iter()
            .map(|s| s.id())
            .chain(std::iter::once(StrategyId::IP))
            .collect();

        for route in &self.routes {
            if let Some(id) = route.strategies().find(|id| !known.contains(id)) {
                return Err(UrsaError::config(format!(
                    "route '{}' references unknown strategy {:?}",
                    route.pattern(),
                    id
                )));
            }
        }

        Ok(RateConfig {
            base_rate: self.base_rate,
            ip: IdentityStrategy::ip(),
            strategies: self.strategies,
            routes: self.routes,
        })
    }
}

/// On-disk form of the rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesFile {
    /// Quota used when nothing more specific applies
    pub base_rate: RateRule,
    /// Header strategies, tried in order
    #[serde(default)]
    pub rate_by: Vec<RateByRule>,
    /// Routes, matched in order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// A quota as written in the rules file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateRule {
    /// Requests admitted per period
    pub capacity: u32,
    /// The time unit
    pub unit: TimeUnit,
    /// Number of units in one period
    #[serde(default = "default_every")]
    pub every: u32,
}

fn default_every() -> u32 {
    1
}

impl RateRule {
    fn compile(&self) -> Result<RateSpec> {
        RateSpec::every(self.capacity, self.every, self.unit)
    }
}

/// A header strategy as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateByRule {
    pub name: String,
    pub header: String,
    #[serde(default)]
    pub validate: ValidateRule,
    #[serde(default)]
    pub signature: SignatureRule,
    #[serde(default = "default_fail_code")]
    pub fail_code: u16,
    #[serde(default)]
    pub fail_message: String,
}

fn default_fail_code() -> u16 {
    400
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidateRule {
    #[default]
    Any,
    NonEmpty,
    Jwt,
    Pattern(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureRule {
    #[default]
    Identity,
    Capture(String),
    JwtClaim(String),
}

/// A route as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Regular expression matched against the request path
    pub pattern: String,
    /// Strategy name to quota
    #[serde(default)]
    pub rates: BTreeMap<String, RateRule>,
    /// Quota for strategies not listed in `rates`
    #[serde(default)]
    pub default: Option<RateRule>,
}

impl RulesFile {
    /// Validate and compile into a [`RateConfig`].
    pub fn compile(&self) -> Result<RateConfig> {
        let mut builder = RateConfig::builder(self.base_rate.compile()?);

        for rule in &self.rate_by {
            let validator = match &rule.validate {
                ValidateRule::Any => Validator::Any,
                ValidateRule::NonEmpty => Validator::NonEmpty,
                ValidateRule::Jwt => Validator::Jwt,
                ValidateRule::Pattern(p) => Validator::Pattern(Regex::new(p)?),
            };
            let key = match &rule.signature {
                SignatureRule::Identity => KeyDerivation::Identity,
                SignatureRule::Capture(p) => KeyDerivation::Capture(Regex::new(p)?),
                SignatureRule::JwtClaim(c) => KeyDerivation::JwtClaim(c.clone()),
            };
            builder.rate_by(
                RateBy::header(rule.name.as_str(), rule.header.as_str())
                    .validate(validator)
                    .signature(key)
                    .reject_with(rule.fail_code, rule.fail_message.as_str()),
            )?;
        }

        let ids: BTreeMap<&str, StrategyId> = builder
            .strategies
            .iter()
            .map(|s| (s.name(), s.id()))
            .chain(std::iter::once((IP_STRATEGY_NAME, StrategyId::IP)))
            .collect();

        let mut routes = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let mut rule = RouteRule::new(&route.pattern)?;
            for (name, rate) in &route.rates {
                let id = ids.get(name.as_str()).copied().ok_or_else(|| {
                    UrsaError::config(format!(
                        "route '{}' references unknown strategy '{}'",
                        route.pattern, name
                    ))
                })?;
                rule = rule.rate(id, rate.compile()?);
            }
            if let Some(default) = &route.default {
                rule = rule.default_rate(default.compile()?);
            }
            routes.push(rule);
        }
        for rule in routes {
            builder.route(rule);
        }

        let config = builder.build()?;
        info!(
            routes = config.routes().len(),
            strategies = config.strategies().len(),
            base_rate = %config.base_rate(),
            "Rate limit rules compiled"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RULES: &str = r#"
base_rate: { capacity: 100, unit: minute }
rate_by:
  - name: token
    header: Authorization
    validate: jwt
    signature: { jwt_claim: sub }
    fail_code: 401
    fail_message: invalid token
  - name: key
    header: X-Api-Key
    validate: { pattern: "^[a-z0-9]+$" }
routes:
  - pattern: "^/api/"
    rates:
      token: { capacity: 1000, unit: hour }
      ip: { capacity: 2, unit: minute }
    default: { capacity: 10, unit: second, every: 5 }
  - pattern: "^/static/"
"#;

    #[test]
    fn test_parse_rules() {
        let config = RateConfig::from_yaml(RULES).unwrap();

        assert_eq!(config.base_rate().capacity(), 100);
        assert_eq!(config.strategies().len(), 2);
        assert_eq!(config.strategies()[0].name(), "token");
        assert_eq!(config.strategies()[0].rejection_code(), 401);
        assert_eq!(config.strategies()[1].rejection_code(), 400);
        assert_eq!(config.routes().len(), 2);
    }

    #[test]
    fn test_route_rates_resolve_by_name() {
        let config = RateConfig::from_yaml(RULES).unwrap();
        let api = &config.routes()[0];
        let base = config.base_rate();

        let token = config.strategy_id("token").unwrap();
        let key = config.strategy_id("key").unwrap();

        assert_eq!(api.resolve_rate(token, base).capacity(), 1000);
        assert_eq!(api.resolve_rate(StrategyId::IP, base).capacity(), 2);

        let fallback = api.resolve_rate(key, base);
        assert_eq!(fallback.capacity(), 10);
        assert_eq!(fallback.refill_period(), Duration::from_secs(5));

        let statics = &config.routes()[1];
        assert_eq!(statics.resolve_rate(key, base), base);
    }

    #[test]
    fn test_unknown_strategy_in_route() {
        let yaml = r#"
base_rate: { capacity: 1, unit: second }
routes:
  - pattern: "^/"
    rates:
      missing: { capacity: 2, unit: minute }
"#;
        let err = RateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, UrsaError::Config(_)));
    }

    #[test]
    fn test_duplicate_strategy_names() {
        let yaml = r#"
base_rate: { capacity: 1, unit: second }
rate_by:
  - { name: key, header: X-Key }
  - { name: key, header: X-Other-Key }
"#;
        assert!(matches!(
            RateConfig::from_yaml(yaml),
            Err(UrsaError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_pattern() {
        let yaml = r#"
base_rate: { capacity: 1, unit: second }
routes:
  - pattern: "^/api/(unclosed"
"#;
        assert!(matches!(
            RateConfig::from_yaml(yaml),
            Err(UrsaError::Pattern(_))
        ));
    }

    #[test]
    fn test_non_positive_rates() {
        let zero_capacity = "base_rate: { capacity: 0, unit: second }";
        assert!(matches!(
            RateConfig::from_yaml(zero_capacity),
            Err(UrsaError::Config(_))
        ));

        let zero_every = "base_rate: { capacity: 1, unit: second, every: 0 }";
        assert!(matches!(
            RateConfig::from_yaml(zero_every),
            Err(UrsaError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            RateConfig::from_yaml("routes: [oops"),
            Err(UrsaError::Yaml(_))
        ));
    }

    #[test]
    fn test_builder_rejects_foreign_strategy() {
        let base = RateSpec::per(1, TimeUnit::Second).unwrap();

        let mut other = RateConfig::builder(base);
        other.rate_by(RateBy::header("a", "X-A")).unwrap();
        let foreign = other.rate_by(RateBy::header("b", "X-B")).unwrap();

        let mut builder = RateConfig::builder(base);
        builder.route(RouteRule::new("^/").unwrap().rate(foreign, base));
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_identical_strategies_are_distinct() {
        let base = RateSpec::per(1, TimeUnit::Second).unwrap();
        let mut builder = RateConfig::builder(base);
        let a = builder.rate_by(RateBy::header("a", "X-Key")).unwrap();
        let b = builder.rate_by(RateBy::header("b", "X-Key")).unwrap();
        assert_ne!(a, b);

        let fast = RateSpec::per(50, TimeUnit::Second).unwrap();
        builder.route(RouteRule::new("^/").unwrap().rate(a, fast));
        let config = builder.build().unwrap();

        assert_eq!(config.routes()[0].resolve_rate(a, base), fast);
        assert_eq!(config.routes()[0].resolve_rate(b, base), base);
    }
}
