//! What option callbacks get to see about the current exchange.

use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};

/// The parts of the request that survive handing the request to the inner
/// service.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

/// Request and response state handed to option predicates and mappers.
#[derive(Debug, Clone, Copy)]
pub struct ProblemContext<'a> {
    pub request: &'a RequestHead,
    /// Current response status: the handler's status for a completed
    /// response, or the reset status once the response has been cleared.
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    /// Whether the response body is known to be empty.
    pub body_is_empty: bool,
}
