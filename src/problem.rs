//! RFC 7807 problem details payloads.
//!
//! [`ProblemDetails`] is the wire shape written to the client. [`Problem`] is
//! what error resolution produces before the middleware decides whether the
//! payload may carry exception details: either a finished [`ProblemDetails`]
//! or an [`ExceptionProblemDetails`] that still borrows the causing error.

use std::error::Error;

use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::details::ExceptionDetails;

/// Base URI for the `type` member of status-code problems.
pub const STATUS_TYPE_BASE: &str = "https://httpstatuses.io";

/// A problem details object (RFC 7807).
///
/// Every member is optional on the wire. Extension members live in
/// [`extensions`](Self::extensions) and are flattened into the top-level
/// object when serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct ProblemDetails {
    /// URI reference identifying the problem type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,

    /// Short, human-readable summary of the problem type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// HTTP status override. When set, the written response uses this status.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_status",
        deserialize_with = "deserialize_status"
    )]
    pub status: Option<StatusCode>,

    /// Explanation specific to this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// URI reference identifying this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// Extension members.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[allow(clippy::ref_option)] // serde hands us &Option<T>
fn serialize_status<S>(status: &Option<StatusCode>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match status {
        Some(status) => serializer.serialize_u16(status.as_u16()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<Option<StatusCode>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u16>::deserialize(deserializer)?
        .map(|code| StatusCode::from_u16(code).map_err(serde::de::Error::custom))
        .transpose()
}

impl ProblemDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generic payload for a bare status code: `type` points at the
    /// status documentation, `title` is the canonical reason phrase.
    pub fn for_status(status: StatusCode) -> Self {
        Self {
            problem_type: Some(format!("{STATUS_TYPE_BASE}/{}", status.as_u16())),
            title: status.canonical_reason().map(str::to_owned),
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, problem_type: impl Into<String>) -> Self {
        self.problem_type = Some(problem_type.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Add an extension member. Reserved member names are ignored.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert_extension(name, value);
        self
    }

    /// Set an extension member in place, e.g. from an on-before-write hook.
    ///
    /// Names that collide with the standard members (`type`, `title`,
    /// `status`, `detail`, `instance`) are dropped so serialization never
    /// emits duplicate keys.
    pub fn insert_extension(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if matches!(name.as_str(), "type" | "title" | "status" | "detail" | "instance") {
            return;
        }
        self.extensions.insert(name, value.into());
    }
}

/// The generic representation of an unhandled error.
///
/// Carries the causing error and an optional status override. It is never
/// serialized as-is: the middleware either turns it into a detailed payload
/// via [`with_exception_details`](Self::with_exception_details) or discards
/// it in favour of the status-code payload.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionProblemDetails<'e> {
    pub error: &'e (dyn Error + 'static),
    pub status: Option<StatusCode>,
}

impl<'e> ExceptionProblemDetails<'e> {
    pub fn new(error: &'e (dyn Error + 'static)) -> Self {
        Self { error, status: None }
    }

    pub fn with_status(error: &'e (dyn Error + 'static), status: StatusCode) -> Self {
        Self {
            error,
            status: Some(status),
        }
    }

    /// Build the developer-facing payload: the error message as `detail` and
    /// one `errors` entry per error in the source chain.
    pub fn with_exception_details(&self, details: Vec<ExceptionDetails>) -> ProblemDetails {
        let status = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let errors = serde_json::to_value(details).unwrap_or(Value::Array(Vec::new()));
        ProblemDetails::for_status(status)
            .with_detail(self.error.to_string())
            .with_extension("errors", errors)
    }
}

/// Outcome of resolving an error into a payload.
#[derive(Debug, Clone)]
pub enum Problem<'e> {
    /// A finished payload, written as-is.
    Details(ProblemDetails),
    /// The generic error representation, subject to detail gating.
    Exception(ExceptionProblemDetails<'e>),
}

/// An error that already knows its response.
///
/// Returning this from a handler (or from an inner tower service) makes the
/// middleware write [`details`](Self::details) verbatim, whatever the
/// exception-detail settings are.
///
/// ```rust,ignore
/// async fn handler() -> Result<Json<Value>, ProblemDetailsError> {
///     Err(ProblemDetails::for_status(StatusCode::CONFLICT)
///         .with_detail("order already shipped")
///         .into())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ProblemDetailsError {
    pub details: ProblemDetails,
}

impl std::fmt::Display for ProblemDetailsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let details = &self.details;
        f.write_str(
            details
                .title
                .as_deref()
                .or(details.detail.as_deref())
                .unwrap_or("problem details"),
        )
    }
}

impl Error for ProblemDetailsError {}

impl ProblemDetailsError {
    pub fn new(details: ProblemDetails) -> Self {
        Self { details }
    }
}

impl From<ProblemDetails> for ProblemDetailsError {
    fn from(details: ProblemDetails) -> Self {
        Self::new(details)
    }
}
