//! Hosted checkout provider abstraction.
//!
//! The engine only needs three capabilities from the provider: open a hosted
//! checkout session, authenticate webhook deliveries and look a session up
//! again. [`stripe::StripeGateway`] implements them over the provider's REST
//! API; tests substitute their own implementation.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::pending_payment::LineItemSnapshot;

pub mod signature;
pub mod stripe;

pub use signature::{sign_payload, verify_signature, SIGNATURE_HEADER};

/// Metadata key carrying the pending payment id through the provider
pub const CORRELATION_METADATA_KEY: &str = "correlation_id";
/// Metadata key carrying the buyer's user id
pub const USER_METADATA_KEY: &str = "user_id";

pub const EVENT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(String),

    #[error("gateway rejected request (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Http(err.to_string())
        }
    }
}

/// Everything the provider needs to open a hosted checkout page
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionRequest {
    pub correlation_id: Uuid,
    pub user_id: Uuid,
    pub currency: String,
    pub line_items: Vec<LineItemSnapshot>,
    pub success_url: String,
    pub cancel_url: String,
    /// When the hosted page stops accepting payment; matches the pending payment deadline
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewaySessionStatus {
    Open,
    Complete,
    Expired,
    #[serde(other)]
    Unknown,
}

/// Provider-side view of a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySession {
    pub id: String,
    /// Hosted page the customer is redirected to; absent once the session closed
    #[serde(default)]
    pub url: Option<String>,
    pub status: GatewaySessionStatus,
    #[serde(default)]
    pub payment_status: Option<String>,
}

/// Webhook envelope: `{"id", "type", "data": {"object": ...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// The parts of a checkout session object the reconciler reads
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Decodes `data.object` as a checkout session
    pub fn checkout_session(&self) -> Result<CheckoutSessionObject, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }
}

impl CheckoutSessionObject {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    /// Pending payment id from metadata, falling back to `client_reference_id`
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.metadata
            .get(CORRELATION_METADATA_KEY)
            .map(String::as_str)
            .or(self.client_reference_id.as_deref())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted checkout session for the given priced lines.
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError>;

    /// Authenticates a webhook delivery over its raw body bytes.
    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), GatewayError>;

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, GatewayError>;
}
