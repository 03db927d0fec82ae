//! RFC 7807 problem details for axum and tower services.
//!
//! [`ProblemDetailsLayer`] sits in front of a service and makes sure clients
//! never see a bare error. Unhandled errors (including panics and
//! [`HandlerError`]s returned from handlers) and content-less 4xx/5xx
//! responses are rewritten into `application/problem+json` or
//! `application/problem+xml` payloads, negotiated from `Accept`.
//!
//! ```rust,ignore
//! use problem_details::{ProblemDetailsLayer, ProblemDetailsOptions};
//!
//! let app = Router::new()
//!     .route("/orders/{id}", get(order))
//!     .layer(ProblemDetailsLayer::new(ProblemDetailsOptions::default()));
//! ```
//!
//! Error messages and source snippets are only included when
//! [`ProblemDetailsOptions::with_include_exception_details`] says so.

mod body;
pub mod config;
pub mod context;
pub mod details;
mod error;
pub mod middleware;
pub mod options;
pub mod problem;
pub mod writer;
mod xml;

pub use config::ProblemDetailsSettings;
pub use context::{ProblemContext, RequestHead};
pub use details::{
    ExceptionDetails, ExceptionDetailsProvider, FileProvider, PhysicalFileProvider, SourceSnippet,
    StackFrame, TracedError,
};
pub use error::{HandlerError, PanicError, RaisedError, WriteError};
pub use middleware::{ProblemDetailsLayer, ProblemDetailsService, ResponseStarted};
pub use options::{Mapped, ProblemDetailsOptions};
pub use problem::{ExceptionProblemDetails, Problem, ProblemDetails, ProblemDetailsError};
pub use writer::{ProblemFormat, APPLICATION_PROBLEM_JSON, APPLICATION_PROBLEM_XML};
