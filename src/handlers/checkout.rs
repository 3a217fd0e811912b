use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::errors::ApiError;
use crate::handlers::common::{created_response, masked_error, success_response, validate_input};
use crate::services::checkout::{CheckoutLine, CheckoutSessionCreated};
use crate::services::verification::PaymentVerification;
use crate::AppState;

const START_FAILED: &str = "Payment could not be started";
const VERIFY_FAILED: &str = "Payment could not be verified";

/// One cart line as sent by the storefront
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    /// Accepted for compatibility; the catalog price is always used
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub price: Option<Decimal>,
    /// Accepted for compatibility; the catalog name is always used
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateCheckoutSessionRequest {
    #[validate(length(max = 100))]
    pub items: Vec<CheckoutItemRequest>,
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/session", post(create_checkout_session))
        .route("/webhook", post(crate::handlers::webhooks::payment_webhook))
        .route("/verify/:session_id", get(verify_checkout_session))
}

/// Start a hosted checkout for the caller's cart
#[utoipa::path(
    post,
    path = "/api/v1/checkout/session",
    request_body = CreateCheckoutSessionRequest,
    responses(
        (status = 201, description = "Checkout session created", body = CheckoutSessionCreated,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Empty checkout or invalid line item", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateCheckoutSessionRequest>,
) -> Result<Response, ApiError> {
    validate_input(&request)?;

    let lines: Vec<CheckoutLine> = request
        .items
        .iter()
        .map(|item| CheckoutLine {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();

    let created = state
        .services
        .checkout
        .initiate(user.user_id, &lines)
        .await
        .map_err(masked_error("create_checkout_session", START_FAILED))?;

    info!(
        user_id = %user.user_id,
        session_id = %created.session_id,
        "Checkout session handed to client"
    );
    Ok(created_response(created))
}

/// Payment status for the buyer returning from the hosted page
#[utoipa::path(
    get,
    path = "/api/v1/checkout/verify/{session_id}",
    params(("session_id" = String, Path, description = "Gateway checkout session id")),
    responses(
        (status = 200, description = "Current payment status", body = PaymentVerification),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown session", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn verify_checkout_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthUser,
) -> Result<Response, ApiError> {
    let verification = state
        .services
        .verification
        .verify(&session_id, &user)
        .await
        .map_err(masked_error("verify_checkout_session", VERIFY_FAILED))?;
    Ok(success_response(verification))
}
