use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::DbPool;
use crate::entities::order::{self, FulfillmentStatus, PaymentStatus};
use crate::entities::order_item;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{StockLedger, StockLine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    #[schema(value_type = String, example = "12.00")]
    pub unit_price: Decimal,
    pub quantity: i32,
    #[schema(value_type = String, example = "24.00")]
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            name: item.name,
            unit_price: item.unit_price,
            quantity: item.quantity,
            line_total: item.line_total,
        }
    }
}

/// Order as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub session_reference: String,
    #[schema(value_type = String, example = "24.00")]
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub tracking_number: Option<String>,
    pub items: Vec<OrderItemView>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl OrderView {
    fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            session_reference: order.session_reference,
            total_amount: order.total_amount,
            currency: order.currency,
            payment_status: order.payment_status,
            fulfillment_status: order.fulfillment_status,
            tracking_number: order.tracking_number,
            items: items.into_iter().map(OrderItemView::from).collect(),
            created_at: order.created_at,
            paid_at: order.paid_at,
            delivered_at: order.delivered_at,
            cancelled_at: order.cancelled_at,
        }
    }
}

/// Post-payment order lifecycle: lookup, cancellation and fulfillment steps.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn load<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    async fn items<C: ConnectionTrait>(
        conn: &C,
        order: &order::Model,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        order
            .find_related(order_item::Entity)
            .order_by_asc(order_item::Column::Name)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    fn authorize(order: &order::Model, requester: &AuthUser) -> Result<(), ServiceError> {
        if requester.can_access(order.user_id) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "order belongs to another user".into(),
            ))
        }
    }

    #[instrument(skip(self, requester))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let db = &*self.db_pool;
        let order = Self::load(db, order_id).await?;
        Self::authorize(&order, requester)?;
        let items = Self::items(db, &order).await?;
        Ok(OrderView::new(order, items))
    }

    /// Cancels an order that has not shipped yet and puts its units back in stock.
    ///
    /// Payment status is left untouched; refunds are handled outside this service.
    #[instrument(skip(self, requester))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let db = &*self.db_pool;
        let order = Self::load(db, order_id).await?;
        Self::authorize(&order, requester)?;
        if !order.fulfillment_status.is_cancellable() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} cannot be cancelled once {}",
                order.order_number,
                order.fulfillment_status.as_str()
            )));
        }

        let now = Utc::now();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let updated = order::Entity::update_many()
            .set(order::ActiveModel {
                fulfillment_status: Set(FulfillmentStatus::Cancelled),
                cancelled_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(
                order::Column::FulfillmentStatus
                    .is_in([FulfillmentStatus::Pending, FulfillmentStatus::Processing]),
            )
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if updated.rows_affected == 0 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            warn!(%order_id, "Order changed status while cancelling");
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is no longer cancellable",
                order.order_number
            )));
        }

        let items = Self::items(&txn, &order).await?;
        let lines: Vec<StockLine> = items.iter().map(StockLine::from).collect();
        let restored_units = StockLedger::release(&txn, &lines).await?;
        let cancelled = Self::load(&txn, order_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(%order_id, restored_units, "Order cancelled");
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                restored_units,
            })
            .await;

        Ok(OrderView::new(cancelled, items))
    }

    /// Moves an order exactly one fulfillment step forward. Admin only.
    ///
    /// A `cancelled` target goes through [`cancel_order`](Self::cancel_order)
    /// so stock is restored.
    #[instrument(skip(self, requester, tracking_number))]
    pub async fn advance_fulfillment(
        &self,
        order_id: Uuid,
        target: FulfillmentStatus,
        tracking_number: Option<String>,
        requester: &AuthUser,
    ) -> Result<OrderView, ServiceError> {
        if !requester.is_admin() {
            return Err(ServiceError::Forbidden(
                "fulfillment updates require the admin role".into(),
            ));
        }
        if target == FulfillmentStatus::Cancelled {
            return self.cancel_order(order_id, requester).await;
        }

        let db = &*self.db_pool;
        let order = Self::load(db, order_id).await?;
        let current = order.fulfillment_status;
        if current.next() != Some(target) {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} cannot move from {} to {}",
                order.order_number,
                current.as_str(),
                target.as_str()
            )));
        }

        let now = Utc::now();
        let mut changes = order::ActiveModel {
            fulfillment_status: Set(target),
            updated_at: Set(now),
            ..Default::default()
        };
        if target == FulfillmentStatus::Delivered {
            changes.delivered_at = Set(Some(now));
        }
        if let Some(tracking) = tracking_number.filter(|t| !t.trim().is_empty()) {
            changes.tracking_number = Set(Some(tracking.trim().to_string()));
        }

        // guarded on the status we validated against
        let updated = order::Entity::update_many()
            .set(changes)
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::FulfillmentStatus.eq(current))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} changed status concurrently",
                order.order_number
            )));
        }

        info!(%order_id, from = current.as_str(), to = target.as_str(), "Fulfillment advanced");
        self.event_sender
            .send_or_log(Event::OrderFulfillmentAdvanced {
                order_id,
                status: target.as_str().to_string(),
            })
            .await;

        let order = Self::load(db, order_id).await?;
        let items = Self::items(db, &order).await?;
        Ok(OrderView::new(order, items))
    }
}
