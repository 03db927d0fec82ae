//! Error types that flow through the problem details middleware.
//!
//! axum handlers cannot fail in the tower sense: whatever they return becomes
//! a response. [`HandlerError`] bridges that gap. Returned from a handler, it
//! produces a plain `500` response that carries the error in a
//! [`RaisedError`] extension, and [`ProblemDetailsLayer`](crate::ProblemDetailsLayer)
//! picks it up from there as an unhandled error.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn my_handler(
//!     State(state): State<Arc<AppState>>,
//! ) -> Result<Json<Value>, HandlerError> {
//!     let result = state.some_fallible_operation().await?;
//!     Ok(Json(result))
//! }
//! ```

use std::{any::Any, error::Error as StdError, fmt, sync::Arc};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tower::BoxError;

use crate::{details::TracedError, problem::ProblemDetailsError};

/// Wraps any error so it can be returned from axum handlers.
///
/// Any type that implements `Into<BoxError>` (which includes
/// [`anyhow::Error`], `io::Error`, and any `#[derive(thiserror::Error)]`
/// type) converts into a [`HandlerError`] via the blanket [`From`]
/// implementation, so handlers propagate errors with `?`. The error is
/// wrapped in a [`TracedError`] so a backtrace is captured when
/// `RUST_BACKTRACE` is set.
#[derive(Debug)]
pub struct HandlerError(Arc<dyn StdError + Send + Sync>);

impl HandlerError {
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
        response.extensions_mut().insert(RaisedError(self.0));
        response
    }
}

/// Convert any `Into<BoxError>` into a [`HandlerError`].
impl<E> From<E> for HandlerError
where
    E: Into<BoxError>,
{
    fn from(e: E) -> Self {
        Self(Arc::new(TracedError::capture(e)))
    }
}

impl IntoResponse for ProblemDetailsError {
    fn into_response(self) -> Response {
        HandlerError::from(self).into_response()
    }
}

/// Response extension carrying an error raised by a handler.
#[derive(Clone)]
pub struct RaisedError(pub(crate) Arc<dyn StdError + Send + Sync>);

impl RaisedError {
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for RaisedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RaisedError").field(&self.0).finish()
    }
}

/// A caught panic, from the inner service or from a middleware callback.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else {
            "unknown panic payload".to_owned()
        };
        Self { message }
    }
}

/// Failure to serialize a problem payload.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to serialize problem details as JSON")]
    Json(#[from] serde_json::Error),
    #[error("`{0}` is not a valid XML element name")]
    InvalidXmlName(String),
    #[error("character {0:?} cannot appear in an XML document")]
    InvalidXmlChar(char),
}
