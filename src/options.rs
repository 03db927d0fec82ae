//! Runtime configuration of the problem details middleware.
//!
//! [`ProblemDetailsOptions`] is built once at startup, moved into the layer
//! and shared read-only by every request afterwards. Every callback has a
//! default matching common API conventions; override them with the `with_*`
//! builder methods.

use std::{collections::HashSet, error::Error, fmt, sync::Arc};

use http::{header, HeaderName, StatusCode};

use crate::{
    config::ProblemDetailsSettings,
    context::{ProblemContext, RequestHead},
    details::{FileProvider, PhysicalFileProvider, DEFAULT_SOURCE_CODE_LINE_COUNT},
    problem::ProblemDetails,
};

/// Decides whether a completed response should be rewritten as a problem.
pub type IsProblem = Arc<dyn Fn(&ProblemContext<'_>) -> bool + Send + Sync>;

/// Builds the payload for a bare status code.
pub type MapStatusCode = Arc<dyn Fn(&ProblemContext<'_>, StatusCode) -> ProblemDetails + Send + Sync>;

/// Tries to map an error to a payload; `None` when the mapper does not apply.
pub type MapException =
    Arc<dyn Fn(&ProblemContext<'_>, &(dyn Error + 'static)) -> Option<Mapped> + Send + Sync>;

/// Decides whether exception details may be included in the payload.
pub type IncludeExceptionDetails = Arc<dyn Fn(&ProblemContext<'_>) -> bool + Send + Sync>;

/// Decides whether an unhandled error is logged.
pub type ShouldLogUnhandledException =
    Arc<dyn Fn(&ProblemContext<'_>, &(dyn Error + 'static), &ProblemDetails) -> bool + Send + Sync>;

/// Last chance to adjust a payload before it is written.
pub type OnBeforeWriteDetails = Arc<dyn Fn(&RequestHead, &mut ProblemDetails) + Send + Sync>;

/// Result of an exception mapper.
#[derive(Debug, Clone)]
pub enum Mapped {
    /// Write this payload as-is.
    Details(ProblemDetails),
    /// Keep the generic error representation, with an optional status
    /// override. Exception-detail gating still applies.
    Exception { status: Option<StatusCode> },
}

#[derive(Clone)]
pub struct ProblemDetailsOptions {
    pub(crate) is_problem: IsProblem,
    pub(crate) map_status_code: MapStatusCode,
    pub(crate) mappers: Vec<MapException>,
    pub(crate) include_exception_details: IncludeExceptionDetails,
    pub(crate) should_log_unhandled_exception: ShouldLogUnhandledException,
    pub(crate) allowed_header_names: HashSet<HeaderName>,
    pub(crate) on_before_write_details: Option<OnBeforeWriteDetails>,
    pub(crate) file_provider: Option<Arc<dyn FileProvider>>,
    pub(crate) source_code_line_count: usize,
}

impl Default for ProblemDetailsOptions {
    fn default() -> Self {
        Self {
            is_problem: Arc::new(is_problem_by_default),
            map_status_code: Arc::new(|_: &ProblemContext<'_>, status: StatusCode| {
                ProblemDetails::for_status(status)
            }),
            mappers: Vec::new(),
            include_exception_details: Arc::new(|_: &ProblemContext<'_>| false),
            should_log_unhandled_exception: Arc::new(
                |_: &ProblemContext<'_>, _: &(dyn Error + 'static), details: &ProblemDetails| {
                    details.status.map_or(true, |s| s.is_server_error())
                },
            ),
            allowed_header_names: ProblemDetailsSettings::default()
                .header_names()
                .into_iter()
                .collect(),
            on_before_write_details: None,
            file_provider: None,
            source_code_line_count: DEFAULT_SOURCE_CODE_LINE_COUNT,
        }
    }
}

/// A 4xx/5xx response that carries no content.
fn is_problem_by_default(ctx: &ProblemContext<'_>) -> bool {
    if !(ctx.status.is_client_error() || ctx.status.is_server_error()) {
        return false;
    }
    if ctx.headers.contains_key(header::CONTENT_TYPE) {
        return false;
    }
    let has_length = ctx
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > 0);
    !has_length && ctx.body_is_empty
}

impl ProblemDetailsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options derived from file-based settings.
    ///
    /// The file provider reads from the settings' content root.
    pub fn from_settings(settings: &ProblemDetailsSettings) -> Self {
        let include = settings.include_exception_details;
        Self {
            include_exception_details: Arc::new(move |_: &ProblemContext<'_>| include),
            allowed_header_names: settings.header_names().into_iter().collect(),
            file_provider: Some(Arc::new(PhysicalFileProvider::new(
                settings.content_root.clone(),
            ))),
            source_code_line_count: settings.source_code_line_count,
            ..Self::default()
        }
    }

    pub fn with_is_problem<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProblemContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.is_problem = Arc::new(f);
        self
    }

    pub fn with_status_code_mapper<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProblemContext<'_>, StatusCode) -> ProblemDetails + Send + Sync + 'static,
    {
        self.map_status_code = Arc::new(f);
        self
    }

    /// Map errors of type `E` to a fixed payload.
    ///
    /// Mappers are tried in registration order; the first match wins.
    pub fn map<E, F>(mut self, f: F) -> Self
    where
        E: Error + 'static,
        F: Fn(&ProblemContext<'_>, &E) -> ProblemDetails + Send + Sync + 'static,
    {
        self.mappers.push(Arc::new(
            move |ctx: &ProblemContext<'_>, error: &(dyn Error + 'static)| {
                error
                    .downcast_ref::<E>()
                    .map(|e| Mapped::Details(f(ctx, e)))
            },
        ));
        self
    }

    /// Treat errors of type `E` as generic errors with the given status.
    ///
    /// Unlike [`map`](Self::map), the payload may still carry exception
    /// details when those are enabled.
    pub fn map_to_status<E>(mut self, status: StatusCode) -> Self
    where
        E: Error + 'static,
    {
        self.mappers.push(Arc::new(
            move |_: &ProblemContext<'_>, error: &(dyn Error + 'static)| {
                error.is::<E>().then_some(Mapped::Exception {
                    status: Some(status),
                })
            },
        ));
        self
    }

    /// Register an untyped mapper.
    pub fn with_exception_mapper<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProblemContext<'_>, &(dyn Error + 'static)) -> Option<Mapped> + Send + Sync + 'static,
    {
        self.mappers.push(Arc::new(f));
        self
    }

    pub fn with_include_exception_details<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProblemContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.include_exception_details = Arc::new(f);
        self
    }

    pub fn with_should_log_unhandled_exception<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProblemContext<'_>, &(dyn Error + 'static), &ProblemDetails) -> bool
            + Send
            + Sync
            + 'static,
    {
        self.should_log_unhandled_exception = Arc::new(f);
        self
    }

    /// Replace the header allow-list.
    pub fn with_allowed_header_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.allowed_header_names = names.into_iter().collect();
        self
    }

    pub fn with_on_before_write_details<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestHead, &mut ProblemDetails) + Send + Sync + 'static,
    {
        self.on_before_write_details = Some(Arc::new(f));
        self
    }

    pub fn with_file_provider(mut self, files: Arc<dyn FileProvider>) -> Self {
        self.file_provider = Some(files);
        self
    }

    pub fn with_source_code_line_count(mut self, count: usize) -> Self {
        self.source_code_line_count = count;
        self
    }

    pub fn is_problem(&self, ctx: &ProblemContext<'_>) -> bool {
        (self.is_problem)(ctx)
    }

    pub fn map_status_code(&self, ctx: &ProblemContext<'_>, status: StatusCode) -> ProblemDetails {
        (self.map_status_code)(ctx, status)
    }

    /// First mapper result for `error`, if any.
    pub fn try_map_problem_details(
        &self,
        ctx: &ProblemContext<'_>,
        error: &(dyn Error + 'static),
    ) -> Option<Mapped> {
        self.mappers.iter().find_map(|m| m(ctx, error))
    }

    pub fn include_exception_details(&self, ctx: &ProblemContext<'_>) -> bool {
        (self.include_exception_details)(ctx)
    }

    pub fn should_log_unhandled_exception(
        &self,
        ctx: &ProblemContext<'_>,
        error: &(dyn Error + 'static),
        details: &ProblemDetails,
    ) -> bool {
        (self.should_log_unhandled_exception)(ctx, error, details)
    }

    pub fn allowed_header_names(&self) -> &HashSet<HeaderName> {
        &self.allowed_header_names
    }

    pub fn source_code_line_count(&self) -> usize {
        self.source_code_line_count
    }
}

impl fmt::Debug for ProblemDetailsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProblemDetailsOptions")
            .field("mappers", &self.mappers.len())
            .field("allowed_header_names", &self.allowed_header_names)
            .field("on_before_write_details", &self.on_before_write_details.is_some())
            .field("file_provider", &self.file_provider.is_some())
            .field("source_code_line_count", &self.source_code_line_count)
            .finish_non_exhaustive()
    }
}
