//! Turns authenticated gateway webhooks into orders.
//!
//! Delivery is at-least-once and unordered, so every step is idempotent:
//! the pending payment is claimed with a conditional update, stock moves
//! through [`StockLedger`] inside the same transaction, and the unique
//! constraints on `orders.session_reference` / `orders.pending_payment_id`
//! decide which of two racing deliveries creates the order.

use axum::http::HeaderMap;
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, DatabaseTransaction, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::{is_unique_violation, DbPool};
use crate::entities::order::{self, FulfillmentStatus, PaymentStatus};
use crate::entities::order_item;
use crate::entities::pending_payment::{self, PendingPaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{
    CheckoutSessionObject, PaymentGateway, WebhookEvent, EVENT_ASYNC_PAYMENT_SUCCEEDED,
    EVENT_SESSION_COMPLETED,
};
use crate::services::cart::CartService;
use crate::services::inventory::{StockLedger, StockLine};

/// Failure reason recorded when stock ran out between payment and confirmation
pub const FAILURE_INSUFFICIENT_STOCK: &str = "insufficient_stock";

/// Failure reason recorded when payment lands after the pending payment expired
pub const FAILURE_PAID_AFTER_CLOSE: &str = "paid_after_checkout_closed";

/// Result of processing one authenticated webhook delivery.
///
/// Every variant is acknowledged to the gateway with HTTP 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    OrderCreated { order_id: Uuid },
    AlreadyProcessed,
    Ignored { event_type: String },
    StockUnavailable { pending_payment_id: Uuid },
    CheckoutClosed { pending_payment_id: Uuid },
}

enum Confirmation {
    Created(order::Model),
    Lost,
    OutOfStock,
}

#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    cart: CartService,
    event_sender: EventSender,
}

impl ReconciliationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            cart: CartService::new(db_pool.clone()),
            db_pool,
            gateway,
            event_sender,
        }
    }

    /// Authenticates, parses and applies one webhook delivery.
    ///
    /// Signature and parse failures are errors (the delivery is not
    /// acknowledged); domain outcomes are `Ok`. Database errors propagate so
    /// the gateway retries.
    #[instrument(skip_all, fields(payload_len = payload.len()))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookOutcome, ServiceError> {
        self.gateway
            .verify_webhook_signature(payload, headers)
            .map_err(|e| {
                warn!(error = %e, "Rejected webhook with invalid signature");
                ServiceError::InvalidSignature(e.to_string())
            })?;

        counter!("checkout.webhook.received", 1);

        let event = WebhookEvent::parse(payload)
            .map_err(|e| ServiceError::MalformedPayload(e.to_string()))?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Webhook authenticated");

        let session = match event.event_type.as_str() {
            EVENT_SESSION_COMPLETED | EVENT_ASYNC_PAYMENT_SUCCEEDED => event
                .checkout_session()
                .map_err(|e| ServiceError::MalformedPayload(e.to_string()))?,
            _ => {
                debug!(event_type = %event.event_type, "Ignoring unhandled webhook event");
                return Ok(WebhookOutcome::Ignored {
                    event_type: event.event_type,
                });
            }
        };

        // completed sessions with delayed payment methods are confirmed later by async_payment_succeeded
        if event.event_type == EVENT_SESSION_COMPLETED && !session.is_paid() {
            info!(session_reference = %session.id, "Checkout completed without payment yet");
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type,
            });
        }

        self.confirm_payment(&event.event_type, &session).await
    }

    /// Confirms the pending payment behind a paid checkout session.
    #[instrument(skip(self, session), fields(session_reference = %session.id))]
    pub async fn confirm_payment(
        &self,
        event_type: &str,
        session: &CheckoutSessionObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        let db = &*self.db_pool;

        let existing = order::Entity::find()
            .filter(order::Column::SessionReference.eq(session.id.as_str()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(existing) = existing {
            counter!("checkout.webhook.duplicate", 1);
            debug!(order_id = %existing.id, "Order already exists for session");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(pending) = self.find_pending(session).await? else {
            warn!("Paid session has no matching pending payment");
            return Ok(WebhookOutcome::Ignored {
                event_type: event_type.to_string(),
            });
        };

        match pending.status {
            PendingPaymentStatus::Initiated => {}
            PendingPaymentStatus::Expired | PendingPaymentStatus::Failed => {
                return self.flag_closed_checkout(&pending, &session.id).await;
            }
            PendingPaymentStatus::Confirmed => {
                counter!("checkout.webhook.duplicate", 1);
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
        }

        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let confirmation = match self.confirm_in_txn(&txn, &pending, &session.id).await {
            Ok(c) => c,
            Err(e) => {
                rollback(txn).await;
                return Err(e);
            }
        };

        match confirmation {
            Confirmation::Created(order) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    pending_payment_id = %pending.id,
                    total = %order.total_amount,
                    "Order created from confirmed payment"
                );

                self.cart.clear_best_effort(order.user_id).await;
                self.event_sender
                    .send_or_log(Event::OrderCreated {
                        order_id: order.id,
                        user_id: order.user_id,
                        session_reference: order.session_reference.clone(),
                        total_amount: order.total_amount,
                    })
                    .await;

                Ok(WebhookOutcome::OrderCreated { order_id: order.id })
            }
            Confirmation::Lost => {
                rollback(txn).await;
                counter!("checkout.webhook.duplicate", 1);
                debug!(pending_payment_id = %pending.id, "Concurrent delivery already confirmed payment");
                Ok(WebhookOutcome::AlreadyProcessed)
            }
            Confirmation::OutOfStock => {
                rollback(txn).await;
                self.mark_out_of_stock(&pending, &session.id).await
            }
        }
    }

    async fn find_pending(
        &self,
        session: &CheckoutSessionObject,
    ) -> Result<Option<pending_payment::Model>, ServiceError> {
        let db = &*self.db_pool;

        let by_reference = pending_payment::Entity::find()
            .filter(pending_payment::Column::SessionReference.eq(session.id.as_str()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if by_reference.is_some() {
            return Ok(by_reference);
        }

        // the webhook can arrive before the initiator stored the session id
        let Some(correlation_id) = session.correlation_id() else {
            return Ok(None);
        };
        let by_id = pending_payment::Entity::find_by_id(correlation_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;

        match by_id {
            Some(p) if p.session_reference.as_deref().is_some_and(|r| r != session.id) => {
                warn!(
                    pending_payment_id = %p.id,
                    stored_reference = ?p.session_reference,
                    "Correlation id points at a pending payment bound to another session"
                );
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn confirm_in_txn(
        &self,
        txn: &DatabaseTransaction,
        pending: &pending_payment::Model,
        session_reference: &str,
    ) -> Result<Confirmation, ServiceError> {
        let now = Utc::now();

        let claimed = pending_payment::Entity::update_many()
            .set(pending_payment::ActiveModel {
                status: Set(PendingPaymentStatus::Confirmed),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(pending_payment::Column::Id.eq(pending.id))
            .filter(pending_payment::Column::Status.eq(PendingPaymentStatus::Initiated))
            .exec(txn)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected == 0 {
            return Ok(Confirmation::Lost);
        }

        if pending.session_reference.is_none() {
            pending_payment::Entity::update_many()
                .col_expr(
                    pending_payment::Column::SessionReference,
                    Expr::value(session_reference),
                )
                .filter(pending_payment::Column::Id.eq(pending.id))
                .filter(pending_payment::Column::SessionReference.is_null())
                .exec(txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        let lines: Vec<StockLine> = pending.line_items.iter().map(StockLine::from).collect();
        match StockLedger::reserve(txn, &lines).await {
            Ok(()) => {}
            Err(ServiceError::InsufficientStock(detail)) => {
                warn!(pending_payment_id = %pending.id, %detail, "Stock ran out before confirmation");
                return Ok(Confirmation::OutOfStock);
            }
            Err(e) => return Err(e),
        }

        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order::order_number_for(order_id)),
            user_id: Set(pending.user_id),
            pending_payment_id: Set(pending.id),
            session_reference: Set(session_reference.to_string()),
            total_amount: Set(pending.total_amount),
            currency: Set(pending.currency.clone()),
            payment_status: Set(PaymentStatus::Paid),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            tracking_number: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            paid_at: Set(Some(now)),
            delivered_at: Set(None),
            cancelled_at: Set(None),
        };
        let order = match order.insert(txn).await {
            Ok(order) => order,
            Err(e) if is_unique_violation(&e) => return Ok(Confirmation::Lost),
            Err(e) => return Err(ServiceError::db_error(e)),
        };

        let items: Vec<order_item::ActiveModel> = pending
            .line_items
            .iter()
            .map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.line_total()),
            })
            .collect();
        if !items.is_empty() {
            order_item::Entity::insert_many(items)
                .exec(txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        Ok(Confirmation::Created(order))
    }

    async fn mark_out_of_stock(
        &self,
        pending: &pending_payment::Model,
        session_reference: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        let updated = pending_payment::Entity::update_many()
            .set(pending_payment::ActiveModel {
                status: Set(PendingPaymentStatus::Failed),
                failure_reason: Set(Some(FAILURE_INSUFFICIENT_STOCK.to_string())),
                session_reference: Set(Some(session_reference.to_string())),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(pending_payment::Column::Id.eq(pending.id))
            .filter(pending_payment::Column::Status.eq(PendingPaymentStatus::Initiated))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        if updated.rows_affected == 0 {
            // another delivery settled it in the meantime
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        counter!("checkout.stock_unavailable_after_capture", 1);
        self.event_sender
            .send_or_log(Event::PaymentCapturedWithoutStock {
                pending_payment_id: pending.id,
                user_id: pending.user_id,
                session_reference: session_reference.to_string(),
                total_amount: pending.total_amount,
            })
            .await;

        Ok(WebhookOutcome::StockUnavailable {
            pending_payment_id: pending.id,
        })
    }

    /// Records a capture against a pending payment that was already closed.
    ///
    /// No stock moves and no order is created. The row keeps its status and
    /// gets a failure reason, which makes the alert fire once per session;
    /// stock-out failures were alerted when they were recorded.
    async fn flag_closed_checkout(
        &self,
        pending: &pending_payment::Model,
        session_reference: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        let updated = pending_payment::Entity::update_many()
            .set(pending_payment::ActiveModel {
                failure_reason: Set(Some(FAILURE_PAID_AFTER_CLOSE.to_string())),
                session_reference: Set(Some(session_reference.to_string())),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(pending_payment::Column::Id.eq(pending.id))
            .filter(pending_payment::Column::Status.is_in([
                PendingPaymentStatus::Expired,
                PendingPaymentStatus::Failed,
            ]))
            .filter(pending_payment::Column::FailureReason.is_null())
            .filter(
                Condition::any()
                    .add(pending_payment::Column::SessionReference.is_null())
                    .add(pending_payment::Column::SessionReference.eq(session_reference)),
            )
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        if updated.rows_affected == 0 {
            counter!("checkout.webhook.duplicate", 1);
            debug!(pending_payment_id = %pending.id, status = ?pending.status, "Closed checkout already settled");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        counter!("checkout.payment_for_closed_checkout", 1);
        self.event_sender
            .send_or_log(Event::PaymentCapturedForClosedCheckout {
                pending_payment_id: pending.id,
                user_id: pending.user_id,
                session_reference: session_reference.to_string(),
                status: pending.status,
                total_amount: pending.total_amount,
            })
            .await;

        Ok(WebhookOutcome::CheckoutClosed {
            pending_payment_id: pending.id,
        })
    }
}

async fn rollback(txn: DatabaseTransaction) {
    if let Err(e) = txn.rollback().await {
        error!(error = %e, "Failed to roll back confirmation transaction");
    }
}
