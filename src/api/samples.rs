//! Sample routes that fail in each of the ways the problem details layer
//! handles.

use axum::{extract::Path, http::StatusCode, Json};
use problem_details::{HandlerError, ProblemDetails, ProblemDetailsError};
use serde_json::{json, Value};

/// Raised by `/checkout`; mapped to `403` with the balance attached.
#[derive(Debug, thiserror::Error)]
#[error("insufficient credit: balance is {balance}, cost is {cost}")]
pub struct OutOfCredit {
    pub balance: u32,
    pub cost: u32,
}

/// Raised by `/reports`; mapped to a generic `501`.
#[derive(Debug, thiserror::Error)]
#[error("report generation is not implemented yet")]
pub struct NotImplementedYet;

/// `GET /orders/{id}`: order 7 has shipped and cannot be viewed as pending.
pub async fn order(Path(id): Path<u64>) -> Result<Json<Value>, ProblemDetailsError> {
    if id == 7 {
        return Err(ProblemDetails::for_status(StatusCode::CONFLICT)
            .with_type("https://example.com/probs/order-shipped")
            .with_title("The order has already shipped.")
            .with_detail(format!("Order {id} left the warehouse and can no longer change."))
            .with_instance(format!("/orders/{id}"))
            .into());
    }
    Ok(Json(json!({ "id": id, "state": "pending" })))
}

/// `POST /checkout`
pub async fn checkout() -> Result<Json<Value>, HandlerError> {
    Err(OutOfCredit {
        balance: 30,
        cost: 50,
    }
    .into())
}

/// `GET /reports`
pub async fn reports() -> Result<Json<Value>, HandlerError> {
    Err(NotImplementedYet.into())
}

/// `GET /fail`: an I/O error nobody mapped.
pub async fn fail() -> Result<Json<Value>, HandlerError> {
    let content = tokio::fs::read_to_string("/definitely/not/here.json").await?;
    Ok(Json(json!({ "content": content })))
}

/// `GET /boom`
pub async fn boom() -> Json<Value> {
    panic!("the flux capacitor is out of alignment")
}

/// `GET /gone`: a bare status, rewritten as a status problem.
pub async fn gone() -> StatusCode {
    StatusCode::GONE
}
