//! The problem details layer.
//!
//! [`ProblemDetailsLayer`] wraps an inner service and rewrites two kinds of
//! outcomes into problem responses:
//!
//! - **Unhandled errors**: `Err` from the inner service, a panic, or a
//!   response carrying a [`RaisedError`] (what [`HandlerError`] produces in an
//!   axum handler). The response is reset to `500` and the error resolved to
//!   a payload: a [`ProblemDetailsError`] is written verbatim, a mapped error
//!   uses its mapper, anything else becomes the generic status payload (or a
//!   detailed one with source snippets when exception details are enabled).
//! - **Bare error responses**: completed responses for which the `is_problem`
//!   predicate holds (by default a 4xx/5xx without content) are reset to their
//!   own status and given the status-code payload.
//!
//! If building or writing the problem fails (a serialization error or a
//! panicking callback), the failure is logged and the original outcome is
//! handed back: `Err` is returned as-is, a panic resumes
//! unwinding, a raised handler error returns the handler's response.
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/orders", post(create_order))
//!     .layer(ProblemDetailsLayer::new(
//!         ProblemDetailsOptions::from_settings(&settings)
//!             .map_to_status::<NotImplementedYet>(StatusCode::NOT_IMPLEMENTED),
//!     ));
//! ```
//!
//! [`HandlerError`]: crate::HandlerError

use std::{
    any::Any,
    error::Error,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt as _};
use http::{HeaderMap, Request, Response, StatusCode};
use tower::{BoxError, Layer, Service};

use crate::{
    body::StartedBody,
    context::{ProblemContext, RequestHead},
    details::{peel, ExceptionDetailsProvider, PhysicalFileProvider},
    error::{PanicError, RaisedError, WriteError},
    options::{Mapped, ProblemDetailsOptions},
    problem::{ExceptionProblemDetails, Problem, ProblemDetails, ProblemDetailsError},
    writer::{clear_response, write_problem},
};

/// Response extension marking a response whose head must be treated as
/// already sent, e.g. a server-sent event stream. Such responses are never
/// rewritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseStarted;

pub(crate) fn log_response_started<D: fmt::Display + ?Sized>(cause: &D) {
    tracing::warn!(
        cause = %cause,
        "The response has already started, the problem details middleware will not be executed"
    );
}

fn log_middleware_error(error: &dyn Error) {
    tracing::error!(
        error = %error,
        "An error occurred while executing the problem details middleware"
    );
}

/// [`Layer`] that applies [`ProblemDetailsService`].
#[derive(Clone)]
pub struct ProblemDetailsLayer {
    shared: Arc<Shared>,
}

impl ProblemDetailsLayer {
    /// Build the layer. Without a configured file provider, source files are
    /// read relative to the working directory.
    pub fn new(options: ProblemDetailsOptions) -> Self {
        let files = options
            .file_provider
            .clone()
            .unwrap_or_else(|| Arc::new(PhysicalFileProvider::new(".")));
        let details = ExceptionDetailsProvider::new(files, options.source_code_line_count);
        Self {
            shared: Arc::new(Shared { options, details }),
        }
    }
}

impl fmt::Debug for ProblemDetailsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProblemDetailsLayer")
            .field("options", &self.shared.options)
            .finish()
    }
}

impl<S> Layer<S> for ProblemDetailsLayer {
    type Service = ProblemDetailsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProblemDetailsService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Middleware that turns unhandled errors and bare error responses into
/// problem details.
#[derive(Clone)]
pub struct ProblemDetailsService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ProblemDetailsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: http_body::Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + fmt::Display,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let head = RequestHead::from_request(&req);
        // Take the service that was driven to readiness, leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await;
            shared.invoke(&head, outcome)
        })
    }
}

/// An error the inner service did not handle, together with what is needed
/// to re-raise it.
enum Unhandled<E, B> {
    Service(E),
    Panic {
        error: PanicError,
        payload: Box<dyn Any + Send>,
    },
    Raised {
        error: RaisedError,
        response: Response<B>,
    },
}

impl<E, B> Unhandled<E, B>
where
    E: Error + 'static,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + fmt::Display,
{
    fn error(&self) -> &(dyn Error + 'static) {
        match self {
            Self::Service(error) => error as &(dyn Error + 'static),
            Self::Panic { error, .. } => error as &(dyn Error + 'static),
            Self::Raised { error, .. } => error.error() as &(dyn Error + 'static),
        }
    }

    fn previous_headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::Raised { response, .. } => Some(response.headers()),
            _ => None,
        }
    }

    fn has_started(&self) -> bool {
        match self {
            Self::Raised { response, .. } => has_started(response),
            _ => false,
        }
    }

    fn rethrow(self) -> Result<Response<Body>, E> {
        match self {
            Self::Service(error) => Err(error),
            Self::Panic { payload, .. } => std::panic::resume_unwind(payload),
            Self::Raised { response, .. } => Ok(pass_through(response)),
        }
    }
}

fn has_started<B>(response: &Response<B>) -> bool {
    response.extensions().get::<ResponseStarted>().is_some()
}

fn pass_through<B>(response: Response<B>) -> Response<Body>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + fmt::Display,
{
    response.map(|body| Body::new(StartedBody::new(body)))
}

/// Run one attempt at producing a problem response.
///
/// Serialization failures and panics from user callbacks (mappers,
/// predicates, the before-write hook) are logged and reported as `None`, so
/// the caller falls back to the original outcome.
fn guarded<T>(attempt: impl FnOnce() -> Result<T, WriteError>) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(attempt)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log_middleware_error(&e);
            None
        }
        Err(payload) => {
            log_middleware_error(&PanicError::from_payload(&*payload));
            None
        }
    }
}

struct Shared {
    options: ProblemDetailsOptions,
    details: ExceptionDetailsProvider,
}

impl Shared {
    fn invoke<E, B>(
        &self,
        head: &RequestHead,
        outcome: Result<Result<Response<B>, E>, Box<dyn Any + Send>>,
    ) -> Result<Response<Body>, E>
    where
        E: Error + 'static,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + fmt::Display,
    {
        match outcome {
            Ok(Ok(mut response)) => match response.extensions_mut().remove::<RaisedError>() {
                Some(error) => self.handle_error(head, Unhandled::Raised { error, response }),
                None => Ok(self.handle_response(head, response)),
            },
            Ok(Err(error)) => self.handle_error(head, Unhandled::<E, B>::Service(error)),
            Err(payload) => {
                let error = PanicError::from_payload(&*payload);
                self.handle_error(head, Unhandled::<E, B>::Panic { error, payload })
            }
        }
    }

    fn handle_error<E, B>(
        &self,
        head: &RequestHead,
        unhandled: Unhandled<E, B>,
    ) -> Result<Response<Body>, E>
    where
        E: Error + 'static,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + fmt::Display,
    {
        if unhandled.has_started() {
            log_response_started(unhandled.error());
            return unhandled.rethrow();
        }

        // Failing to write the problem must not mask the real error.
        match guarded(|| self.error_problem(head, &unhandled)) {
            Some(response) => Ok(response),
            None => unhandled.rethrow(),
        }
    }

    fn error_problem<E, B>(
        &self,
        head: &RequestHead,
        unhandled: &Unhandled<E, B>,
    ) -> Result<Response<Body>, WriteError>
    where
        E: Error + 'static,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + fmt::Display,
    {
        let error = unhandled.error();
        let cleared = clear_response(
            unhandled.previous_headers(),
            &self.options.allowed_header_names,
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        let ctx = ProblemContext {
            request: head,
            status: cleared.status(),
            headers: cleared.headers(),
            body_is_empty: true,
        };

        let details = self.get_details(&ctx, Some(error));

        if self.options.should_log_unhandled_exception(&ctx, error, &details) {
            tracing::error!(
                error = %error,
                method = %head.method,
                uri = %head.uri,
                "An unhandled error occurred while executing the request"
            );
        }

        self.write(head, cleared, details)
    }

    fn handle_response<B>(&self, head: &RequestHead, response: Response<B>) -> Response<Body>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + fmt::Display,
    {
        match guarded(|| self.status_problem(head, &response)) {
            Some(Some(problem)) => problem,
            _ => pass_through(response),
        }
    }

    /// The problem replacing `response`, `None` when it stays as is.
    fn status_problem<B>(
        &self,
        head: &RequestHead,
        response: &Response<B>,
    ) -> Result<Option<Response<Body>>, WriteError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + fmt::Display,
    {
        let ctx = ProblemContext {
            request: head,
            status: response.status(),
            headers: response.headers(),
            body_is_empty: response.body().size_hint().exact() == Some(0),
        };
        if !self.options.is_problem(&ctx) {
            return Ok(None);
        }

        if has_started(response) {
            log_response_started(&response.status());
            return Ok(None);
        }

        let cleared = clear_response(
            Some(response.headers()),
            &self.options.allowed_header_names,
            response.status(),
        );
        let details = {
            let ctx = ProblemContext {
                request: head,
                status: cleared.status(),
                headers: cleared.headers(),
                body_is_empty: true,
            };
            self.get_details(&ctx, None)
        };

        self.write(head, cleared, details).map(Some)
    }

    fn get_details(
        &self,
        ctx: &ProblemContext<'_>,
        error: Option<&(dyn Error + 'static)>,
    ) -> ProblemDetails {
        let Some(error) = error else {
            return self.options.map_status_code(ctx, ctx.status);
        };

        let exception = match self.resolve(ctx, error) {
            Problem::Details(details) => return details,
            Problem::Exception(exception) => exception,
        };

        // Exception details never leak unless explicitly enabled, even when
        // a mapper asked for the generic representation.
        let status = exception.status.unwrap_or(ctx.status);
        if !self.options.include_exception_details(ctx) {
            return self.options.map_status_code(ctx, status);
        }

        match self.details.get_details(exception.error) {
            Ok(details) => exception.with_exception_details(details),
            Err(e) => {
                log_middleware_error(&e);
                self.options.map_status_code(ctx, status)
            }
        }
    }

    fn resolve<'e>(&self, ctx: &ProblemContext<'_>, error: &'e (dyn Error + 'static)) -> Problem<'e> {
        let matched = peel(error);

        if let Some(problem) = matched.downcast_ref::<ProblemDetailsError>() {
            return Problem::Details(problem.details.clone());
        }

        match self.options.try_map_problem_details(ctx, matched) {
            Some(Mapped::Details(details)) => Problem::Details(details),
            Some(Mapped::Exception {
                status: Some(status),
            }) => Problem::Exception(ExceptionProblemDetails::with_status(error, status)),
            Some(Mapped::Exception { status: None }) | None => {
                Problem::Exception(ExceptionProblemDetails::new(error))
            }
        }
    }

    fn write(
        &self,
        head: &RequestHead,
        cleared: Response<()>,
        mut details: ProblemDetails,
    ) -> Result<Response<Body>, WriteError> {
        if let Some(hook) = &self.options.on_before_write_details {
            hook(head, &mut details);
        }
        write_problem(head, cleared, &details)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io, path::{Path, PathBuf}};

    use axum::{
        body::to_bytes,
        http::header,
        response::IntoResponse,
        routing::get,
        Extension, Router,
    };
    use serde_json::Value;
    use tower::{service_fn, ServiceExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        details::{FileProvider, StackFrame, TracedError},
        HandlerError,
    };

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    const MIDDLEWARE_ERROR: &str = "An error occurred while executing the problem details middleware";
    const UNHANDLED: &str = "An unhandled error occurred while executing the request";
    const STARTED: &str = "The response has already started";

    #[derive(Debug, thiserror::Error)]
    #[error("connection string is postgres://admin:hunter2@db")]
    struct LeakyError;

    #[derive(Debug, thiserror::Error)]
    #[error("out of credit: balance {0}")]
    struct OutOfCredit(u32);

    #[derive(Debug, thiserror::Error)]
    #[error("not implemented yet")]
    struct NotImplementedYet;

    #[derive(Debug, thiserror::Error)]
    #[error("backend exploded")]
    struct Boom;

    #[derive(Default)]
    struct MemoryFiles(HashMap<PathBuf, Option<String>>);

    impl FileProvider for MemoryFiles {
        fn read_source(&self, path: &Path) -> io::Result<Option<String>> {
            match self.0.get(path) {
                Some(Some(content)) => Ok(Some(content.clone())),
                Some(None) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
                None => Ok(None),
            }
        }
    }

    fn source_file(lines: usize) -> String {
        (1..=lines).map(|i| format!("let step_{i} = {i};\n")).collect()
    }

    async fn panicking() -> &'static str {
        panic!("at the disco")
    }

    async fn leaky() -> Result<&'static str, HandlerError> {
        Err(LeakyError.into())
    }

    async fn conflict() -> Result<&'static str, ProblemDetailsError> {
        Err(ProblemDetails::for_status(StatusCode::CONFLICT)
            .with_detail("order 7 already shipped")
            .with_extension("orderId", 7)
            .into())
    }

    async fn out_of_credit() -> Result<&'static str, HandlerError> {
        Err(OutOfCredit(30).into())
    }

    async fn not_implemented() -> Result<&'static str, HandlerError> {
        Err(NotImplementedYet.into())
    }

    async fn traced() -> Result<&'static str, HandlerError> {
        Err(TracedError::with_frames(
            anyhow::anyhow!("kaboom"),
            vec![
                StackFrame::new("app::orders::create", "src/orders.rs", 5),
                StackFrame::new("std::rt::lang_start", "/rustc/library/std/src/rt.rs", 12),
                StackFrame::new("app::main", "src/main.rs", 2),
            ],
        )
        .into())
    }

    async fn with_cors_then_fail() -> impl IntoResponse {
        (
            [
                ("access-control-allow-origin", "https://app.example"),
                ("x-internal", "yes"),
                ("cache-control", "max-age=600"),
            ],
            HandlerError::from(anyhow::anyhow!("db down")),
        )
    }

    async fn bare_not_found_with_headers() -> impl IntoResponse {
        (
            StatusCode::NOT_FOUND,
            [
                ("access-control-allow-origin", "*"),
                ("x-internal", "yes"),
                ("cache-control", "public, max-age=3600"),
                ("expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ],
        )
    }

    async fn started_then_fail() -> impl IntoResponse {
        (Extension(ResponseStarted), HandlerError::from(anyhow::anyhow!("mid-stream")))
    }

    async fn started_not_found() -> impl IntoResponse {
        (Extension(ResponseStarted), StatusCode::NOT_FOUND)
    }

    fn app(options: ProblemDetailsOptions) -> Router {
        Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/text-error", get(|| async { (StatusCode::BAD_REQUEST, "missing id") }))
            .route("/panic", get(panicking))
            .route("/leaky", get(leaky))
            .route("/conflict", get(conflict))
            .route("/out-of-credit", get(out_of_credit))
            .route("/not-implemented", get(not_implemented))
            .route("/traced", get(traced))
            .route("/cors-fail", get(with_cors_then_fail))
            .route("/bare-404", get(bare_not_found_with_headers))
            .route("/started-fail", get(started_then_fail))
            .route("/started-404", get(started_not_found))
            .layer(ProblemDetailsLayer::new(options))
    }

    fn with_details(files: MemoryFiles) -> ProblemDetailsOptions {
        ProblemDetailsOptions::default()
            .with_include_exception_details(|_| true)
            .with_file_provider(Arc::new(files))
            .with_source_code_line_count(1)
    }

    async fn send(app: Router, uri: &str, accept: Option<&str>) -> Response<Body> {
        let mut req = Request::get(uri);
        if let Some(accept) = accept {
            req = req.header(header::ACCEPT, accept);
        }
        app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response<Body>) -> Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn assert_not_cacheable(response: &Response<Body>) {
        let headers = response.headers();
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-store, must-revalidate");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::EXPIRES], "0");
    }

    // -----------------------------------------------------------------------
    // Pass-through
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_response_is_untouched() {
        let response = send(app(ProblemDetailsOptions::default()), "/ok", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::PRAGMA));
        assert_eq!(body_text(response).await, "fine");
    }

    #[tokio::test]
    async fn error_response_with_content_is_untouched() {
        let response = send(app(ProblemDetailsOptions::default()), "/text-error", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "missing id");
    }

    // -----------------------------------------------------------------------
    // Status-code problems
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_route_becomes_status_problem() {
        let response = send(app(ProblemDetailsOptions::default()), "/nope", None).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/problem+json");
        assert_not_cacheable(&response);
        let json = body_json(response).await;
        assert_eq!(json["status"], 404);
        assert_eq!(json["title"], "Not Found");
        assert_eq!(json["type"], "https://httpstatuses.io/404");
    }

    #[tokio::test]
    async fn status_problem_negotiates_xml() {
        let response = send(app(ProblemDetailsOptions::default()), "/nope", Some("application/xml")).await;

        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/problem+xml");
        let text = body_text(response).await;
        assert!(text.contains(r#"<problem xmlns="urn:ietf:rfc:7807">"#));
        assert!(text.contains("<status>404</status>"));
    }

    #[tokio::test]
    async fn custom_status_mapper_is_used() {
        let options = ProblemDetailsOptions::default().with_status_code_mapper(|ctx, status| {
            ProblemDetails::for_status(status).with_instance(ctx.request.uri.path())
        });
        let json = body_json(send(app(options), "/nope", None).await).await;
        assert_eq!(json["instance"], "/nope");
    }

    #[tokio::test]
    async fn allow_listed_headers_survive_reset_and_others_do_not() {
        let response = send(app(ProblemDetailsOptions::default()), "/bare-404", None).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!response.headers().contains_key("x-internal"));
        assert_not_cacheable(&response);
        assert_eq!(response.headers().get_all(header::CACHE_CONTROL).iter().count(), 1);
    }

    #[tokio::test]
    async fn custom_allow_list_replaces_the_default() {
        let options = ProblemDetailsOptions::default()
            .with_allowed_header_names([http::HeaderName::from_static("x-internal")]);
        let response = send(app(options), "/bare-404", None).await;

        assert_eq!(response.headers()["x-internal"], "yes");
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    #[traced_test]
    async fn started_error_response_is_left_alone() {
        let response = send(app(ProblemDetailsOptions::default()), "/started-404", None).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!response.headers().contains_key(header::PRAGMA));
        assert!(body_text(response).await.is_empty());
        assert!(logs_contain(STARTED));
    }

    // -----------------------------------------------------------------------
    // Unhandled errors
    // -----------------------------------------------------------------------

    #[tokio::test]
    #[traced_test]
    async fn handler_error_becomes_generic_500_without_leaking() {
        let response = send(app(ProblemDetailsOptions::default()), "/leaky", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_not_cacheable(&response);
        let text = body_text(response).await;
        assert!(!text.contains("hunter2"), "leaked: {text}");
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json, serde_json::to_value(ProblemDetails::for_status(StatusCode::INTERNAL_SERVER_ERROR)).unwrap());
        assert!(logs_contain(UNHANDLED));
    }

    #[tokio::test]
    async fn panic_becomes_generic_500() {
        let response = send(app(ProblemDetailsOptions::default()), "/panic", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(response).await;
        assert!(!text.contains("disco"));
        assert!(text.contains("Internal Server Error"));
    }

    #[tokio::test]
    async fn service_error_becomes_generic_500() {
        let svc = ProblemDetailsLayer::new(ProblemDetailsOptions::default())
            .layer(service_fn(|_req: Request<Body>| async { Err::<Response<Body>, Boom>(Boom) }));

        let response = svc
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .expect("error should be converted");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["status"], 500);
        assert!(json.get("detail").is_none());
    }

    #[tokio::test]
    async fn explicit_problem_is_written_verbatim_regardless_of_detail_setting() {
        for options in [ProblemDetailsOptions::default(), with_details(MemoryFiles::default())] {
            let response = send(app(options), "/conflict", None).await;

            assert_eq!(response.status(), StatusCode::CONFLICT);
            let json = body_json(response).await;
            let expected = ProblemDetails::for_status(StatusCode::CONFLICT)
                .with_detail("order 7 already shipped")
                .with_extension("orderId", 7);
            assert_eq!(json, serde_json::to_value(expected).unwrap());
        }
    }

    #[tokio::test]
    async fn explicit_problem_from_service_error_is_written_verbatim() {
        let svc = ProblemDetailsLayer::new(ProblemDetailsOptions::default()).layer(service_fn(
            |_req: Request<Body>| async {
                Err::<Response<Body>, _>(ProblemDetailsError::new(
                    ProblemDetails::for_status(StatusCode::TOO_MANY_REQUESTS),
                ))
            },
        ));

        let response = svc.oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn mapped_error_uses_its_payload() {
        let options = ProblemDetailsOptions::default().map::<OutOfCredit, _>(|_, e| {
            ProblemDetails::for_status(StatusCode::FORBIDDEN)
                .with_title("You do not have enough credit.")
                .with_extension("balance", e.0)
        });
        let response = send(app(options), "/out-of-credit", None).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["balance"], 30);
        assert_eq!(json["title"], "You do not have enough credit.");
    }

    #[tokio::test]
    async fn status_mapping_without_details_uses_override_status() {
        let options = ProblemDetailsOptions::default()
            .map_to_status::<NotImplementedYet>(StatusCode::NOT_IMPLEMENTED);
        let response = send(app(options), "/not-implemented", None).await;

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let json = body_json(response).await;
        assert_eq!(json["title"], "Not Implemented");
        assert!(json.get("detail").is_none());
    }

    #[tokio::test]
    async fn status_mapping_with_details_keeps_override_status() {
        let options = with_details(MemoryFiles::default())
            .map_to_status::<NotImplementedYet>(StatusCode::NOT_IMPLEMENTED);
        let response = send(app(options), "/not-implemented", None).await;

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let json = body_json(response).await;
        assert_eq!(json["detail"], "not implemented yet");
    }

    #[tokio::test]
    async fn allow_listed_headers_survive_unhandled_error() {
        let response = send(app(ProblemDetailsOptions::default()), "/cors-fail", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert!(!response.headers().contains_key("x-internal"));
        assert_not_cacheable(&response);
    }

    #[tokio::test]
    async fn on_before_write_hook_can_extend_payload() {
        let options = ProblemDetailsOptions::default().with_on_before_write_details(|head, details| {
            details.insert_extension("path", head.uri.path());
        });
        let json = body_json(send(app(options), "/leaky", None).await).await;
        assert_eq!(json["path"], "/leaky");
    }

    #[tokio::test]
    #[traced_test]
    async fn should_log_predicate_can_silence_unhandled_errors() {
        let options = ProblemDetailsOptions::default().with_should_log_unhandled_exception(|_, _, _| false);
        let response = send(app(options), "/leaky", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!logs_contain(UNHANDLED));
    }

    // -----------------------------------------------------------------------
    // Exception details
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn details_include_one_snippet_per_resolvable_frame() {
        let mut files = MemoryFiles::default();
        files.0.insert("src/orders.rs".into(), Some(source_file(10)));
        files.0.insert("src/main.rs".into(), Some(source_file(3)));

        let response = send(app(with_details(files)), "/traced", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["detail"], "kaboom");
        let frames = json["errors"][0]["stackFrames"].as_array().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["lineNumber"], 5);
        assert_eq!(frames[0]["function"], "app::orders::create");
        assert_eq!(frames[0]["contextCode"], "let step_5 = 5;");
        assert_eq!(frames[0]["preContextLine"], 4);
        assert_eq!(frames[0]["preContextCode"][0], "let step_4 = 4;");
        assert_eq!(frames[0]["postContextCode"][0], "let step_6 = 6;");
        assert_eq!(frames[1]["lineNumber"], 2);
        assert_eq!(frames[1]["fileName"], "main.rs");
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_enrichment_falls_back_and_logs_once() {
        let mut files = MemoryFiles::default();
        files.0.insert("src/orders.rs".into(), None);

        let response = send(app(with_details(files)), "/traced", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json, serde_json::to_value(ProblemDetails::for_status(StatusCode::INTERNAL_SERVER_ERROR)).unwrap());
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains(MIDDLEWARE_ERROR)).count() {
                1 => Ok(()),
                n => Err(format!("expected one middleware error, found {n}")),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Response already started
    // -----------------------------------------------------------------------

    #[tokio::test]
    #[traced_test]
    async fn started_response_rethrows_without_writing() {
        let response = send(app(ProblemDetailsOptions::default()), "/started-fail", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::CONTENT_TYPE));
        assert!(!response.headers().contains_key(header::PRAGMA));
        assert!(body_text(response).await.is_empty());
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains(STARTED)).count() {
                1 => Ok(()),
                n => Err(format!("expected one warning, found {n}")),
            }
        });
        assert!(!logs_contain(UNHANDLED));
    }

    // -----------------------------------------------------------------------
    // Write failures
    // -----------------------------------------------------------------------

    fn unwritable_as_xml() -> ProblemDetailsOptions {
        ProblemDetailsOptions::default().with_on_before_write_details(|_, details| {
            details.insert_extension("not an element", true);
        })
    }

    #[tokio::test]
    #[traced_test]
    async fn write_failure_rethrows_the_original_service_error() {
        let svc = ProblemDetailsLayer::new(unwritable_as_xml())
            .layer(service_fn(|_req: Request<Body>| async { Err::<Response<Body>, Boom>(Boom) }));

        let result = svc
            .oneshot(
                Request::get("/")
                    .header(header::ACCEPT, "application/problem+xml")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        let err = result.expect_err("original error should propagate");
        assert_eq!(err.to_string(), "backend exploded");
        assert!(logs_contain(MIDDLEWARE_ERROR));
        assert!(logs_contain("not an element"));
    }

    #[tokio::test]
    #[traced_test]
    async fn write_failure_returns_the_handler_response() {
        let response = send(app(unwritable_as_xml()), "/leaky", Some("application/xml")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::CONTENT_TYPE));
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    #[tokio::test]
    #[traced_test]
    async fn write_failure_on_status_problem_keeps_original_response() {
        let response = send(app(unwritable_as_xml()), "/bare-404", Some("text/xml")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-internal"], "yes");
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    // -----------------------------------------------------------------------
    // Failing callbacks
    // -----------------------------------------------------------------------

    #[tokio::test]
    #[traced_test]
    async fn hook_panic_rethrows_original_error() {
        let options =
            ProblemDetailsOptions::default().with_on_before_write_details(|_, _| panic!("hook exploded"));
        let svc = ProblemDetailsLayer::new(options)
            .layer(service_fn(|_req: Request<Body>| async { Err::<Response<Body>, Boom>(Boom) }));

        let result = svc.oneshot(Request::get("/").body(Body::empty()).unwrap()).await;

        let err = result.expect_err("original error should propagate");
        assert_eq!(err.to_string(), "backend exploded");
        assert!(logs_contain(MIDDLEWARE_ERROR));
        assert!(logs_contain("hook exploded"));
    }

    #[tokio::test]
    #[traced_test]
    async fn hook_panic_returns_the_handler_response() {
        let options =
            ProblemDetailsOptions::default().with_on_before_write_details(|_, _| panic!("hook exploded"));
        let response = send(app(options), "/leaky", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::CONTENT_TYPE));
        assert!(body_text(response).await.is_empty());
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    #[tokio::test]
    #[traced_test]
    async fn mapper_panic_falls_back_and_logs() {
        let options = ProblemDetailsOptions::default()
            .with_exception_mapper(|_, _| panic!("mapper exploded"));
        let response = send(app(options), "/leaky", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::PRAGMA));
        assert!(logs_contain(MIDDLEWARE_ERROR));
        assert!(logs_contain("mapper exploded"));
    }

    #[tokio::test]
    #[traced_test]
    async fn status_mapper_panic_keeps_original_response() {
        let options = ProblemDetailsOptions::default()
            .with_status_code_mapper(|_, _| panic!("status mapper exploded"));
        let response = send(app(options), "/bare-404", None).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-internal"], "yes");
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    #[tokio::test]
    #[traced_test]
    async fn is_problem_panic_passes_response_through() {
        let options = ProblemDetailsOptions::default().with_is_problem(|_| panic!("predicate exploded"));
        let response = send(app(options), "/ok", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fine");
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    #[tokio::test]
    #[traced_test]
    async fn unwritable_character_rethrows_original_error() {
        let options = ProblemDetailsOptions::default().with_on_before_write_details(|_, details| {
            details.detail = Some("bell \u{7} rings".to_owned());
        });
        let response = send(app(options), "/leaky", Some("application/xml")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::CONTENT_TYPE));
        assert!(logs_contain(MIDDLEWARE_ERROR));
    }

    #[tokio::test]
    async fn json_clients_are_unaffected_by_xml_only_failures() {
        let response = send(app(unwritable_as_xml()), "/leaky", None).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/problem+json");
        let json = body_json(response).await;
        assert_eq!(json["not an element"], true);
    }
}
