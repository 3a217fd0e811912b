use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::DbPool;
use crate::entities::order::{self, FulfillmentStatus, PaymentStatus};
use crate::entities::pending_payment::{self, PendingPaymentStatus};
use crate::errors::ServiceError;
use crate::gateway::{GatewaySessionStatus, PaymentGateway};

/// Failure reason reported when the gateway closed the session unpaid
pub const FAILURE_SESSION_EXPIRED: &str = "session_expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Paid,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub order_number: String,
    #[schema(value_type = String, example = "24.00")]
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl From<order::Model> for OrderSummary {
    fn from(order: order::Model) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number,
            total_amount: order.total_amount,
            currency: order.currency,
            payment_status: order.payment_status,
            fulfillment_status: order.fulfillment_status,
            paid_at: order.paid_at,
        }
    }
}

/// What the payment-success page shows after the gateway redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PaymentVerification {
    pub session_id: String,
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Read-only status lookup for the buyer returning from the hosted page.
#[derive(Clone)]
pub struct VerificationService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    gateway_timeout: Duration,
}

impl VerificationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            gateway_timeout,
        }
    }

    /// Reports the state of `session_id` to its owner. Never mutates anything.
    ///
    /// Admins get no exemption here; the page is the buyer's own receipt.
    #[instrument(skip(self, requester), fields(user_id = %requester.user_id))]
    pub async fn verify(
        &self,
        session_id: &str,
        requester: &AuthUser,
    ) -> Result<PaymentVerification, ServiceError> {
        let db = &*self.db_pool;

        let order = order::Entity::find()
            .filter(order::Column::SessionReference.eq(session_id))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(order) = order {
            ensure_owner(order.user_id, requester)?;
            let status = match order.payment_status {
                PaymentStatus::Failed => VerificationStatus::Failed,
                _ => VerificationStatus::Paid,
            };
            return Ok(PaymentVerification {
                session_id: session_id.to_string(),
                status,
                order: Some(order.into()),
                failure_reason: None,
            });
        }

        let pending = pending_payment::Entity::find()
            .filter(pending_payment::Column::SessionReference.eq(session_id))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("checkout session {session_id}")))?;
        ensure_owner(pending.user_id, requester)?;

        let (status, failure_reason) = match pending.status {
            PendingPaymentStatus::Initiated => self.gateway_view(session_id).await,
            PendingPaymentStatus::Confirmed => (VerificationStatus::Pending, None),
            PendingPaymentStatus::Failed | PendingPaymentStatus::Expired => (
                VerificationStatus::Failed,
                Some(
                    pending
                        .failure_reason
                        .unwrap_or_else(|| FAILURE_SESSION_EXPIRED.to_string()),
                ),
            ),
        };

        Ok(PaymentVerification {
            session_id: session_id.to_string(),
            status,
            order: None,
            failure_reason,
        })
    }

    /// Asks the gateway about a session we have no verdict for yet.
    /// Any gateway trouble degrades to `pending`.
    async fn gateway_view(&self, session_id: &str) -> (VerificationStatus, Option<String>) {
        let lookup =
            tokio::time::timeout(self.gateway_timeout, self.gateway.retrieve_session(session_id))
                .await;
        match lookup {
            Ok(Ok(session)) if session.status == GatewaySessionStatus::Expired => (
                VerificationStatus::Failed,
                Some(FAILURE_SESSION_EXPIRED.to_string()),
            ),
            Ok(Ok(_)) => (VerificationStatus::Pending, None),
            Ok(Err(e)) => {
                warn!(%session_id, error = %e, "Gateway lookup failed during verification");
                (VerificationStatus::Pending, None)
            }
            Err(_) => {
                debug!(%session_id, "Gateway lookup timed out during verification");
                (VerificationStatus::Pending, None)
            }
        }
    }
}

fn ensure_owner(owner_id: Uuid, requester: &AuthUser) -> Result<(), ServiceError> {
    if owner_id == requester.user_id {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "checkout session belongs to another user".into(),
        ))
    }
}
