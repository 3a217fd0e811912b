use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::{AdminUser, AuthUser};
use crate::entities::order::FulfillmentStatus;
use crate::errors::ApiError;
use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::services::orders::OrderView;
use crate::AppState;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateFulfillmentRequest {
    pub status: FulfillmentStatus,
    #[validate(length(min = 1, max = 128))]
    pub tracking_number: Option<String>,
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/fulfillment", put(update_fulfillment))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with its items", body = OrderView),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> Result<Response, ApiError> {
    let order = state
        .services
        .orders
        .get_order(id, &user)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}

/// Cancel an order that has not shipped; its units go back in stock
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderView),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already shipped or cancelled", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> Result<Response, ApiError> {
    let order = state
        .services
        .orders
        .cancel_order(id, &user)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}

/// Advance fulfillment by one step (admin only)
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/fulfillment",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateFulfillmentRequest,
    responses(
        (status = 200, description = "Fulfillment updated", body = OrderView),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_fulfillment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AdminUser(admin): AdminUser,
    Json(request): Json<UpdateFulfillmentRequest>,
) -> Result<Response, ApiError> {
    validate_input(&request)?;
    let order = state
        .services
        .orders
        .advance_fulfillment(id, request.status, request.tracking_number, &admin)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}
