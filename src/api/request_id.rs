//! Request ID middleware for the demo server.
//!
//! Every inbound request is assigned a unique `X-Request-ID`. The ID is:
//!
//! - Accepted from the caller if they already provide `X-Request-ID`
//! - Freshly generated (UUID v4) otherwise
//! - Written back onto the request, so inner layers (the problem details
//!   hook in particular) see it as a plain header
//! - Echoed back in the `X-Request-ID` response header
//!
//! Problem payloads carry the same ID as `traceId`, which ties a client's
//! error report to the server log lines for that request.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use problem_details::{ProblemDetails, RequestHead};
use tracing::Instrument as _;
use uuid::Uuid;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Axum middleware that assigns a request ID to every request.
///
/// Apply it **outside** the problem details layer so the ID is on the
/// request by the time a problem is written.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header_value = HeaderValue::from_str(&id).ok();
    if let Some(value) = &header_value {
        req.headers_mut().insert(REQUEST_ID, value.clone());
    }

    // Wrap the downstream handler in a span so every log line includes the ID.
    let span = tracing::info_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID, value);
    }

    response
}

/// Before-write hook: attach the request ID as `traceId`.
pub fn attach_trace_id(head: &RequestHead, details: &mut ProblemDetails) {
    if let Some(id) = head.headers.get(&REQUEST_ID).and_then(|v| v.to_str().ok()) {
        details.insert_extension("traceId", id);
    }
}
