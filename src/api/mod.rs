//! HTTP surface of the demo server.

pub mod health;
pub mod request_id;
pub mod samples;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use problem_details::{ProblemDetails, ProblemDetailsLayer, ProblemDetailsOptions, ProblemDetailsSettings};
use tower_http::cors::CorsLayer;

use samples::{NotImplementedYet, OutOfCredit};

/// Options used by the demo: file settings plus the demo's mappers and the
/// trace-id hook.
pub fn problem_options(settings: &ProblemDetailsSettings) -> ProblemDetailsOptions {
    ProblemDetailsOptions::from_settings(settings)
        .map::<OutOfCredit, _>(|ctx, e| {
            ProblemDetails::for_status(StatusCode::FORBIDDEN)
                .with_type("https://example.com/probs/out-of-credit")
                .with_title("You do not have enough credit.")
                .with_detail(e.to_string())
                .with_instance(ctx.request.uri.path())
                .with_extension("balance", e.balance)
        })
        .map_to_status::<NotImplementedYet>(StatusCode::NOT_IMPLEMENTED)
        .with_on_before_write_details(request_id::attach_trace_id)
}

/// The demo application.
///
/// CORS sits inside the problem details layer so its headers show the
/// allow-list at work; the request ID sits outside so it reaches the hook.
pub fn router(options: ProblemDetailsOptions) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/orders/{id}", get(samples::order))
        .route("/checkout", post(samples::checkout))
        .route("/reports", get(samples::reports))
        .route("/fail", get(samples::fail))
        .route("/boom", get(samples::boom))
        .route("/gone", get(samples::gone))
        .layer(CorsLayer::permissive())
        .layer(ProblemDetailsLayer::new(options))
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
}
