// REST client for a Stripe-compatible hosted checkout API.
// Requests are form encoded; session creation carries the correlation id as
// Idempotency-Key so a retried call never opens a second session.

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{
    signature, CheckoutSessionRequest, GatewayError, GatewaySession, PaymentGateway,
    CORRELATION_METADATA_KEY, USER_METADATA_KEY,
};
use crate::config::AppConfig;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    #[serde(rename = "type", default)]
    type_: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct StripeGateway {
    http: Client,
    api_key: String,
    base_url: String,
    webhook_secret: String,
    webhook_tolerance_secs: u64,
}

impl StripeGateway {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        webhook_secret: impl Into<String>,
        webhook_tolerance_secs: u64,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(format!("client build failed: {}", e)))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            webhook_secret: webhook_secret.into(),
            webhook_tolerance_secs,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, GatewayError> {
        Self::new(
            cfg.payment_gateway_api_key.clone(),
            cfg.payment_gateway_base_url.clone(),
            cfg.payment_webhook_secret.clone(),
            cfg.payment_webhook_tolerance_secs,
            cfg.gateway_timeout(),
        )
    }

    fn map_error(status: StatusCode, body: &str) -> GatewayError {
        let message = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(env) => format!(
                "{}: {}",
                env.error.type_.unwrap_or_else(|| "api_error".into()),
                env.error.message.unwrap_or_default()
            ),
            Err(_) => body.chars().take(200).collect(),
        };
        GatewayError::Api {
            status: status.as_u16(),
            message,
        }
    }

    async fn decode_session(response: reqwest::Response) -> Result<GatewaySession, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Checkout provider returned an error");
            return Err(Self::map_error(status, &body));
        }
        response
            .json::<GatewaySession>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

/// Converts a decimal amount to the provider's integer minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|v| *v >= 0)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("amount {} out of range", amount)))
}

fn session_form(request: &CheckoutSessionRequest) -> Result<Vec<(String, String)>, GatewayError> {
    let correlation = request.correlation_id.to_string();
    let currency = request.currency.to_lowercase();

    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("payment_method_types[0]".to_string(), "card".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        ("client_reference_id".to_string(), correlation.clone()),
        (format!("metadata[{}]", CORRELATION_METADATA_KEY), correlation),
        (
            format!("metadata[{}]", USER_METADATA_KEY),
            request.user_id.to_string(),
        ),
        (
            "expires_at".to_string(),
            request.expires_at.timestamp().to_string(),
        ),
    ];

    for (i, line) in request.line_items.iter().enumerate() {
        let prefix = format!("line_items[{}]", i);
        form.push((format!("{prefix}[price_data][currency]"), currency.clone()));
        form.push((
            format!("{prefix}[price_data][product_data][name]"),
            line.name.clone(),
        ));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            to_minor_units(line.unit_price)?.to_string(),
        ));
        form.push((format!("{prefix}[quantity]"), line.quantity.to_string()));
    }

    Ok(form)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        let form = session_form(request)?;

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", request.correlation_id.to_string())
            .form(&form)
            .send()
            .await?;

        let session = Self::decode_session(response).await?;
        info!(session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), GatewayError> {
        let signature_header = headers
            .get(signature::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        signature::verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            self.webhook_tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, GatewayError> {
        let well_formed = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            return Err(GatewayError::InvalidRequest("malformed session id".into()));
        }

        let response = self
            .http
            .get(format!("{}/v1/checkout/sessions/{}", self.base_url, session_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Self::decode_session(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::pending_payment::LineItemSnapshot;
    use crate::gateway::{sign_payload, GatewaySessionStatus};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer, timeout: Duration) -> StripeGateway {
        StripeGateway::new("sk_test_key", server.uri(), "whsec_test", 300, timeout).unwrap()
    }

    fn request() -> CheckoutSessionRequest {
        CheckoutSessionRequest {
            correlation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            currency: "USD".into(),
            line_items: vec![LineItemSnapshot {
                product_id: Uuid::new_v4(),
                name: "Chainsaw Man keychain".into(),
                unit_price: dec!(12.00),
                quantity: 2,
            }],
            success_url: "http://localhost:5173/payment-success?session_id={CHECKOUT_SESSION_ID}"
                .into(),
            cancel_url: "http://localhost:5173/cart".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(2),
        }
    }

    #[test]
    fn minor_units_round_half_away() {
        assert_eq!(to_minor_units(dec!(12.00)).unwrap(), 1200);
        assert_eq!(to_minor_units(dec!(0.995)).unwrap(), 100);
        assert!(to_minor_units(dec!(-1)).is_err());
    }

    #[test]
    fn session_closes_at_the_pending_payment_deadline() {
        let req = request();
        let form = session_form(&req).unwrap();
        let expires_at: Vec<&str> = form
            .iter()
            .filter(|(key, _)| key == "expires_at")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(expires_at, vec![req.expires_at.timestamp().to_string().as_str()]);
    }

    #[tokio::test]
    async fn creates_session_with_idempotency_key_and_server_prices() {
        let server = MockServer::start().await;
        let req = request();

        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test_key"))
            .and(header("idempotency-key", req.correlation_id.to_string().as_str()))
            .and(body_string_contains(format!(
                "client_reference_id={}",
                req.correlation_id
            )))
            .and(body_string_contains("unit_amount%5D=1200"))
            .and(body_string_contains(format!(
                "expires_at={}",
                req.expires_at.timestamp()
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_abc",
                "url": "https://checkout.example.com/pay/cs_test_abc",
                "status": "open",
                "payment_status": "unpaid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = gateway(&server, Duration::from_secs(5))
            .create_checkout_session(&req)
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_abc");
        assert_eq!(session.status, GatewaySessionStatus::Open);
        assert!(session.url.is_some());
    }

    #[tokio::test]
    async fn provider_errors_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "error": {"type": "invalid_request_error", "message": "No such price"}
            })))
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(5))
            .create_checkout_session(&request())
            .await
            .unwrap_err();
        match err {
            GatewayError::Api { status, message } => {
                assert_eq!(status, 402);
                assert!(message.contains("No such price"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"id": "cs_late", "status": "open"})),
            )
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_millis(300))
            .create_checkout_session(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout));
    }

    #[tokio::test]
    async fn retrieves_expired_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_old",
                "url": null,
                "status": "expired",
                "payment_status": "unpaid"
            })))
            .mount(&server)
            .await;

        let session = gateway(&server, Duration::from_secs(5))
            .retrieve_session("cs_test_old")
            .await
            .unwrap();
        assert_eq!(session.status, GatewaySessionStatus::Expired);
    }

    #[tokio::test]
    async fn rejects_path_injection_in_session_id() {
        let server = MockServer::start().await;
        let err = gateway(&server, Duration::from_secs(5))
            .retrieve_session("../customers")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn verifies_webhook_with_configured_secret() {
        let server = MockServer::start().await;
        let gw = gateway(&server, Duration::from_secs(5));
        let body = br#"{"id":"evt_1"}"#;
        let mut headers = HeaderMap::new();
        assert!(gw.verify_webhook_signature(body, &headers).is_err());

        let signature = sign_payload("whsec_test", chrono::Utc::now().timestamp(), body);
        headers.insert(signature::SIGNATURE_HEADER, signature.parse().unwrap());
        assert!(gw.verify_webhook_signature(body, &headers).is_ok());
    }
}
