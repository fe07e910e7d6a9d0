//! Client identification strategies ("rate-by" rules).
//!
//! A strategy names a request header, a validator for its value, and a
//! function turning the value into the key that identifies the client. The
//! set of validators and key functions is closed: everything is decided at
//! configuration load time and never changes afterwards.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::{HeaderName, StatusCode};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, UrsaError};

/// Name of the built-in strategy keyed by the client's IP address.
pub const IP_STRATEGY_NAME: &str = "ip";

/// Identity of a configured strategy.
///
/// Quotas are keyed by this id rather than by the strategy's fields, so two
/// strategies that look identical are still distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrategyId(usize);

impl StrategyId {
    /// The built-in IP strategy.
    pub const IP: StrategyId = StrategyId(0);

    pub(crate) fn nth(index: usize) -> Self {
        StrategyId(index + 1)
    }
}

/// Predicate applied to a header value before it may identify a client.
#[derive(Debug, Clone)]
pub enum Validator {
    /// Every value is accepted.
    Any,
    /// Rejects values that are only whitespace.
    NonEmpty,
    /// The value must match the pattern.
    Pattern(Regex),
    /// The value must be a compact JWT (optionally `Bearer `-prefixed) whose
    /// payload decodes to a JSON object. Signatures are not verified.
    Jwt,
}

impl Validator {
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            Validator::Any => true,
            Validator::NonEmpty => !value.trim().is_empty(),
            Validator::Pattern(re) => re.is_match(value),
            Validator::Jwt => jwt_claims(value).is_some(),
        }
    }
}

/// Function from a header value to the client key.
#[derive(Debug, Clone)]
pub enum KeyDerivation {
    /// The value itself.
    Identity,
    /// The first capture group of the pattern, or the whole match if the
    /// pattern has no groups.
    Capture(Regex),
    /// A string or numeric claim of the JWT payload, e.g. `sub`.
    JwtClaim(String),
}

impl KeyDerivation {
    pub fn derive(&self, value: &str) -> Option<String> {
        match self {
            KeyDerivation::Identity => Some(value.to_string()),
            KeyDerivation::Capture(re) => {
                let caps = re.captures(value)?;
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
            }
            KeyDerivation::JwtClaim(claim) => match jwt_claims(value)?.get(claim)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
        }
    }
}

/// Decode the payload of a compact JWT without verifying it.
fn jwt_claims(value: &str) -> Option<Map<String, Value>> {
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();

    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

/// Definition of a header-based strategy, before it is registered.
#[derive(Debug, Clone)]
pub struct RateBy {
    name: String,
    header: String,
    validator: Validator,
    key: KeyDerivation,
    rejection_code: u16,
    rejection_message: String,
}

impl RateBy {
    /// A strategy reading `header`, accepting any value as-is.
    pub fn header(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            validator: Validator::Any,
            key: KeyDerivation::Identity,
            rejection_code: 400,
            rejection_message: String::new(),
        }
    }

    pub fn validate(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn signature(mut self, key: KeyDerivation) -> Self {
        self.key = key;
        self
    }

    /// Status and body used when the header value fails validation.
    pub fn reject_with(mut self, code: u16, message: impl Into<String>) -> Self {
        self.rejection_code = code;
        self.rejection_message = message.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(self, id: StrategyId) -> Result<IdentityStrategy> {
        if self.name.is_empty() {
            return Err(UrsaError::config("rate-by strategy name must not be empty"));
        }
        // '-' separates the name from the key in a signature
        if self.name.contains('-') {
            return Err(UrsaError::config(format!(
                "rate-by strategy name '{}' must not contain '-'",
                self.name
            )));
        }
        if self.name.eq_ignore_ascii_case(IP_STRATEGY_NAME) {
            return Err(UrsaError::config(format!(
                "rate-by strategy name '{}' is reserved",
                IP_STRATEGY_NAME
            )));
        }
        let header = HeaderName::from_bytes(self.header.as_bytes()).map_err(|e| {
            UrsaError::config(format!(
                "strategy '{}' has invalid header '{}': {}",
                self.name, self.header, e
            ))
        })?;
        StatusCode::from_u16(self.rejection_code).map_err(|_| {
            UrsaError::config(format!(
                "strategy '{}' has invalid fail code {}",
                self.name, self.rejection_code
            ))
        })?;

        Ok(IdentityStrategy {
            id,
            name: self.name,
            header: Some(header),
            validator: self.validator,
            key: self.key,
            rejection_code: self.rejection_code,
            rejection_message: self.rejection_message,
        })
    }
}

/// A registered identification strategy.
#[derive(Debug, Clone)]
pub struct IdentityStrategy {
    id: StrategyId,
    name: String,
    /// `None` only for the IP strategy, which reads the peer address.
    header: Option<HeaderName>,
    validator: Validator,
    key: KeyDerivation,
    rejection_code: u16,
    rejection_message: String,
}

impl IdentityStrategy {
    /// The built-in fallback strategy keyed by client IP.
    pub fn ip() -> Self {
        Self {
            id: StrategyId::IP,
            name: IP_STRATEGY_NAME.to_string(),
            header: None,
            validator: Validator::Any,
            key: KeyDerivation::Identity,
            rejection_code: 400,
            rejection_message: String::new(),
        }
    }

    pub fn id(&self) -> StrategyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> Option<&HeaderName> {
        self.header.as_ref()
    }

    pub fn is_valid(&self, value: &str) -> bool {
        self.validator.is_valid(value)
    }

    pub fn derive_key(&self, value: &str) -> Option<String> {
        self.key.derive(value)
    }

    pub fn rejection_code(&self) -> u16 {
        self.rejection_code
    }

    pub fn rejection_message(&self) -> &str {
        &self.rejection_message
    }
}
