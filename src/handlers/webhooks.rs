use axum::{extract::State, http::HeaderMap, response::Response};
use bytes::Bytes;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::handlers::common::success_response;
use crate::services::reconciliation::WebhookOutcome;
use crate::AppState;

/// Gateway event delivery.
///
/// The body is taken as raw bytes: the signature covers them exactly, so it
/// must be checked before any JSON parsing.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/webhook",
    request_body(content = String, description = "Raw gateway event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookOutcome),
        (status = 400, description = "Unparseable event", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 500, description = "Storage failure; the gateway should retry", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let outcome = state
        .services
        .reconciliation
        .handle_webhook(&body, &headers)
        .await
        .map_err(|e| {
            warn!(kind = e.kind(), error = %e, "Webhook not acknowledged");
            e
        })?;

    info!(?outcome, "Webhook acknowledged");
    Ok(success_response(outcome))
}
