//! Client signature derivation.

use http::HeaderName;
use std::net::IpAddr;
use tracing::{trace, warn};

use super::strategy::{IdentityStrategy, StrategyId};

/// Key used for the IP strategy when the transport supplied no peer address.
const UNKNOWN_CLIENT: &str = "unknown";

/// Read-only view of an inbound request.
pub trait RequestView {
    /// The request path, without query string.
    fn path(&self) -> &str;

    /// The value of a header, if present and valid UTF-8.
    fn header(&self, name: &HeaderName) -> Option<&str>;

    /// The address of the downstream client.
    fn client_ip(&self) -> Option<IpAddr>;
}

/// Identity of one client under one strategy: `"<strategy>-<key>"`.
///
/// Strategy names are unique, so signatures from different strategies
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientSignature(String);

impl ClientSignature {
    pub fn new(strategy: &str, key: &str) -> Self {
        Self(format!("{}-{}", strategy, key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signature together with the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identified {
    pub signature: ClientSignature,
    pub strategy: StrategyId,
}

/// The matched strategy refused the header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status_code: u16,
    pub message: String,
}

/// Identify the client behind `request`.
///
/// The first strategy whose header is present and non-empty decides: its
/// validator either accepts the value or the request is rejected outright.
/// Requests carrying none of the headers fall back to `ip`.
pub fn derive_signature<R: RequestView + ?Sized>(
    request: &R,
    strategies: &[IdentityStrategy],
    ip: &IdentityStrategy,
) -> Result<Identified, Rejection> {
    for strategy in strategies {
        let Some(header) = strategy.header() else {
            continue;
        };
        let Some(value) = request.header(header).filter(|v| !v.is_empty()) else {
            continue;
        };

        let key = if strategy.is_valid(value) {
            strategy.derive_key(value)
        } else {
            None
        };

        return match key {
            Some(key) => {
                let signature = ClientSignature::new(strategy.name(), &key);
                trace!(strategy = strategy.name(), signature = %signature, "Client identified");
                Ok(Identified {
                    signature,
                    strategy: strategy.id(),
                })
            }
            None => {
                warn!(
                    strategy = strategy.name(),
                    header = %header,
                    status = strategy.rejection_code(),
                    "Rejecting request with invalid identity header"
                );
                Err(Rejection {
                    status_code: strategy.rejection_code(),
                    message: strategy.rejection_message().to_string(),
                })
            }
        };
    }

    let key = request
        .client_ip()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    Ok(Identified {
        signature: ClientSignature::new(ip.name(), &key),
        strategy: ip.id(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ratelimit::strategy::{KeyDerivation, RateBy, Validator};
    use regex::Regex;
    use std::collections::HashMap;

    /// Minimal request for exercising the deriver.
    #[derive(Default)]
    pub(crate) struct FakeRequest {
        pub path: String,
        pub headers: HashMap<String, String>,
        pub ip: Option<IpAddr>,
    }

    impl FakeRequest {
        pub fn new(path: &str, ip: &str) -> Self {
            Self {
                path: path.to_string(),
                headers: HashMap::new(),
                ip: ip.parse().ok(),
            }
        }

        pub fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.insert(name.to_ascii_lowercase(), value.to_string());
            self
        }
    }

    impl RequestView for FakeRequest {
        fn path(&self) -> &str {
            &self.path
        }

        fn header(&self, name: &HeaderName) -> Option<&str> {
            self.headers.get(name.as_str()).map(String::as_str)
        }

        fn client_ip(&self) -> Option<IpAddr> {
            self.ip
        }
    }

    fn strategies() -> Vec<IdentityStrategy> {
        vec![
            RateBy::header("token", "Authorization")
                .validate(Validator::Pattern(Regex::new("^Bearer .+").unwrap()))
                .reject_with(401, "bad token")
                .build(StrategyId::nth(0))
                .unwrap(),
            RateBy::header("key", "X-Api-Key")
                .build(StrategyId::nth(1))
                .unwrap(),
        ]
    }

    #[test]
    fn test_falls_back_to_ip() {
        let request = FakeRequest::new("/api", "10.0.0.1");
        let id = derive_signature(&request, &strategies(), &IdentityStrategy::ip()).unwrap();

        assert_eq!(id.signature.as_str(), "ip-10.0.0.1");
        assert_eq!(id.strategy, StrategyId::IP);
    }

    #[test]
    fn test_missing_peer_address() {
        let request = FakeRequest::new("/api", "not an ip");
        let id = derive_signature(&request, &[], &IdentityStrategy::ip()).unwrap();
        assert_eq!(id.signature.as_str(), "ip-unknown");
    }

    #[test]
    fn test_header_strategy() {
        let request = FakeRequest::new("/api", "10.0.0.1").with_header("X-Api-Key", "abc");
        let id = derive_signature(&request, &strategies(), &IdentityStrategy::ip()).unwrap();

        assert_eq!(id.signature.as_str(), "key-abc");
        assert_eq!(id.strategy, StrategyId::nth(1));
    }

    #[test]
    fn test_earlier_strategy_wins() {
        let request = FakeRequest::new("/api", "10.0.0.1")
            .with_header("X-Api-Key", "abc")
            .with_header("Authorization", "Bearer t1");
        let id = derive_signature(&request, &strategies(), &IdentityStrategy::ip()).unwrap();

        assert_eq!(id.signature.as_str(), "token-Bearer t1");
        assert_eq!(id.strategy, StrategyId::nth(0));
    }

    #[test]
    fn test_empty_header_is_skipped() {
        let request = FakeRequest::new("/api", "10.0.0.1")
            .with_header("Authorization", "")
            .with_header("X-Api-Key", "abc");
        let id = derive_signature(&request, &strategies(), &IdentityStrategy::ip()).unwrap();
        assert_eq!(id.signature.as_str(), "key-abc");
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        // The later, valid header must not be consulted
        let request = FakeRequest::new("/api", "10.0.0.1")
            .with_header("Authorization", "Basic zzz")
            .with_header("X-Api-Key", "abc");
        let rejection =
            derive_signature(&request, &strategies(), &IdentityStrategy::ip()).unwrap_err();

        assert_eq!(rejection.status_code, 401);
        assert_eq!(rejection.message, "bad token");
    }

    #[test]
    fn test_valid_value_without_key_is_rejected() {
        // {"sub":"user-42","n":7}
        let token = "Bearer eyJhbGciOiJub25lIn0.eyJzdWIiOiJ1c2VyLTQyIiwibiI6N30.sig";
        let strategies = vec![
            RateBy::header("user", "Authorization")
                .validate(Validator::Jwt)
                .signature(KeyDerivation::JwtClaim("email".to_string()))
                .reject_with(401, "token has no email")
                .build(StrategyId::nth(0))
                .unwrap(),
            RateBy::header("key", "X-Api-Key")
                .build(StrategyId::nth(1))
                .unwrap(),
        ];
        assert!(strategies[0].is_valid(token));

        let request = FakeRequest::new("/api", "10.0.0.1")
            .with_header("Authorization", token)
            .with_header("X-Api-Key", "abc");
        let rejection =
            derive_signature(&request, &strategies, &IdentityStrategy::ip()).unwrap_err();

        assert_eq!(rejection.status_code, 401);
        assert_eq!(rejection.message, "token has no email");
    }

    #[test]
    fn test_signatures_do_not_collide_across_strategies() {
        let by_ip = ClientSignature::new("ip", "1.2.3.4");
        let by_key = ClientSignature::new("key", "1.2.3.4");
        assert_ne!(by_ip, by_key);
    }
}
