use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Anime Store Checkout API",
        version = "0.1.0",
        description = r#"
# Anime Store Checkout API

Hosted checkout and payment reconciliation for the anime merchandise storefront.

## Flow

1. `POST /api/v1/checkout/session` prices the cart from the catalog and returns a
   hosted payment page URL.
2. The payment provider calls `POST /api/v1/checkout/webhook` once the payment
   settles; the order is created and stock is taken exactly once.
3. The storefront polls `GET /api/v1/checkout/verify/{session_id}` from the
   payment-success page.

## Authentication

Storefront endpoints require a bearer JWT issued by the storefront auth service:

```
Authorization: Bearer <your-jwt-token>
```

The webhook endpoint is authenticated by the provider's `Stripe-Signature` header only.

## Errors

Every error uses the same body:

```json
{
  "error": "Bad Request",
  "message": "Payment could not be started",
  "request_id": "2f0c...",
  "timestamp": "2026-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:5000", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Checkout sessions, provider webhooks and payment verification"),
        (name = "Orders", description = "Order lookup, cancellation and fulfillment"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::checkout::create_checkout_session,
        crate::handlers::checkout::verify_checkout_session,
        crate::handlers::webhooks::payment_webhook,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::update_fulfillment,
        crate::handlers::health::readiness_check,
    ),
    components(
        schemas(
            crate::handlers::checkout::CreateCheckoutSessionRequest,
            crate::handlers::checkout::CheckoutItemRequest,
            crate::services::checkout::CheckoutSessionCreated,
            crate::services::verification::PaymentVerification,
            crate::services::verification::VerificationStatus,
            crate::services::verification::OrderSummary,
            crate::services::reconciliation::WebhookOutcome,
            crate::handlers::orders::UpdateFulfillmentRequest,
            crate::services::orders::OrderView,
            crate::services::orders::OrderItemView,
            crate::entities::order::PaymentStatus,
            crate::entities::order::FulfillmentStatus,
            crate::handlers::health::HealthResponse,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}
