//! Ursa - rate limiting layer for HTTP reverse proxies
//!
//! This crate decides, per inbound request, whether to admit or reject it
//! based on a per-route, per-client quota. Clients are identified by a
//! configurable strategy (IP address, a header, or an identity derived from
//! a header such as a token). All state is local to the process.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
