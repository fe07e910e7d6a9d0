//! Glue between the limiter and an HTTP stack built on the `http` crate.
//!
//! The transport is expected to insert a [`ClientAddr`] extension into each
//! request; the forwarder acts on [`Decision::Allow`] and sends the response
//! built by [`rejection_response`] otherwise.

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use std::net::{IpAddr, SocketAddr};

use crate::ratelimit::{Decision, RequestView};

/// Address of the downstream peer, set by the transport as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

impl From<SocketAddr> for ClientAddr {
    fn from(addr: SocketAddr) -> Self {
        ClientAddr(addr.ip())
    }
}

impl<B> RequestView for Request<B> {
    fn path(&self) -> &str {
        self.uri().path()
    }

    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.extensions().get::<ClientAddr>().map(|addr| addr.0)
    }
}

/// Build the response for a rejected request, or `None` if it may be forwarded.
pub fn rejection_response(decision: &Decision) -> Option<Response<String>> {
    match decision {
        Decision::Allow => None,
        Decision::Deny { retry_after } => {
            // Round up so clients never retry before the refill
            let mut secs = retry_after.as_secs();
            if retry_after.subsec_nanos() > 0 {
                secs += 1;
            }
            let mut response = text_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            Some(response)
        }
        Decision::InvalidSignature {
            status_code,
            message,
        } => {
            let status = StatusCode::from_u16(*status_code).unwrap_or(StatusCode::BAD_REQUEST);
            Some(text_response(status, message))
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<String> {
    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
