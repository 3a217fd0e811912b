use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::entities::pending_payment::{self, LineItemSnapshot, LineItems, PendingPaymentStatus};
use crate::errors::ServiceError;
use crate::gateway::{CheckoutSessionRequest, PaymentGateway};
use crate::services::catalog::ProductCatalog;

/// Product and quantity requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Knobs the initiator reads from configuration
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub max_line_quantity: i32,
    pub pending_payment_ttl: ChronoDuration,
    pub gateway_timeout: Duration,
    pub success_url: String,
    pub cancel_url: String,
}

impl From<&AppConfig> for CheckoutSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            currency: cfg.default_currency.to_uppercase(),
            max_line_quantity: cfg.max_line_quantity,
            pending_payment_ttl: cfg.pending_payment_ttl(),
            gateway_timeout: cfg.gateway_timeout(),
            success_url: cfg.checkout_success_url(),
            cancel_url: cfg.checkout_cancel_url(),
        }
    }
}

/// What the client needs to redirect to the hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CheckoutSessionCreated {
    pub pending_payment_id: Uuid,
    pub session_id: String,
    pub redirect_url: String,
    #[schema(value_type = String, example = "24.00")]
    pub total_amount: Decimal,
    pub currency: String,
}

/// Merges duplicate product ids (summing quantities), keeping first-seen order.
pub fn merge_lines(lines: &[CheckoutLine]) -> Vec<CheckoutLine> {
    let mut merged: Vec<CheckoutLine> = Vec::with_capacity(lines.len());
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    for line in lines {
        match index.get(&line.product_id) {
            Some(&i) => merged[i].quantity = merged[i].quantity.saturating_add(line.quantity),
            None => {
                index.insert(line.product_id, merged.len());
                merged.push(*line);
            }
        }
    }
    merged
}

#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DbPool>,
    catalog: ProductCatalog,
    gateway: Arc<dyn PaymentGateway>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            catalog: ProductCatalog::new(db_pool.clone()),
            db_pool,
            gateway,
            settings,
        }
    }

    fn validate_lines(&self, lines: &[CheckoutLine]) -> Result<Vec<CheckoutLine>, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::EmptyCheckout);
        }
        if let Some(bad) = lines.iter().find(|l| l.quantity <= 0) {
            return Err(ServiceError::InvalidLineItem(format!(
                "quantity for product {} must be positive",
                bad.product_id
            )));
        }

        let merged = merge_lines(lines);
        if let Some(bad) = merged
            .iter()
            .find(|l| l.quantity > self.settings.max_line_quantity)
        {
            return Err(ServiceError::InvalidLineItem(format!(
                "quantity for product {} exceeds the limit of {}",
                bad.product_id, self.settings.max_line_quantity
            )));
        }
        Ok(merged)
    }

    /// Prices the requested lines from the catalog. Client prices never reach this point.
    async fn price_lines(
        &self,
        lines: &[CheckoutLine],
    ) -> Result<Vec<LineItemSnapshot>, ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let products = self.catalog.get_products(&ids).await?;

        lines
            .iter()
            .map(|line| {
                let product = products
                    .get(&line.product_id)
                    .filter(|p| p.is_active)
                    .ok_or_else(|| {
                        ServiceError::InvalidLineItem(format!(
                            "product {} is not available",
                            line.product_id
                        ))
                    })?;

                if !product.currency.eq_ignore_ascii_case(&self.settings.currency) {
                    return Err(ServiceError::InvalidLineItem(format!(
                        "product {} is priced in {}",
                        product.id, product.currency
                    )));
                }

                // advisory; the authoritative check happens at confirmation
                if product.stock < line.quantity {
                    return Err(ServiceError::InsufficientStock(format!(
                        "product {} has {} units left",
                        product.id, product.stock
                    )));
                }

                Ok(LineItemSnapshot {
                    product_id: product.id,
                    name: product.name.clone(),
                    unit_price: product.price,
                    quantity: line.quantity,
                })
            })
            .collect()
    }

    /// Creates a pending payment and a hosted checkout session for it.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn initiate(
        &self,
        user_id: Uuid,
        lines: &[CheckoutLine],
    ) -> Result<CheckoutSessionCreated, ServiceError> {
        let merged = self.validate_lines(lines)?;
        let snapshot = LineItems(self.price_lines(&merged).await?);
        let total = snapshot.total();

        let now = Utc::now();
        let expires_at = now + self.settings.pending_payment_ttl;
        let pending_id = Uuid::new_v4();
        let pending = pending_payment::ActiveModel {
            id: Set(pending_id),
            user_id: Set(user_id),
            line_items: Set(snapshot.clone()),
            total_amount: Set(total),
            currency: Set(self.settings.currency.clone()),
            session_reference: Set(None),
            status: Set(PendingPaymentStatus::Initiated),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            expires_at: Set(expires_at),
        };
        pending
            .insert(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let request = CheckoutSessionRequest {
            correlation_id: pending_id,
            user_id,
            currency: self.settings.currency.clone(),
            line_items: snapshot.0,
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
            expires_at,
        };

        // the pending payment stays initiated on failure and is reaped by the expiry sweep
        let session = match tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.create_checkout_session(&request),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!(pending_payment_id = %pending_id, error = %e, "Checkout session creation failed");
                return Err(e.into());
            }
            Err(_) => {
                error!(pending_payment_id = %pending_id, "Checkout session creation timed out");
                return Err(ServiceError::GatewayUnavailable("timed out".into()));
            }
        };

        let redirect_url = session.url.clone().ok_or_else(|| {
            warn!(session_id = %session.id, "Gateway returned a session without a redirect url");
            ServiceError::GatewayUnavailable("session has no redirect url".into())
        })?;

        pending_payment::ActiveModel {
            id: Set(pending_id),
            session_reference: Set(Some(session.id.clone())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&*self.db_pool)
        .await
        .map_err(ServiceError::db_error)?;

        counter!("checkout.sessions.created", 1);
        info!(
            pending_payment_id = %pending_id,
            session_reference = %session.id,
            %total,
            "Checkout session initiated"
        );

        Ok(CheckoutSessionCreated {
            pending_payment_id: pending_id,
            session_id: session.id,
            redirect_url,
            total_amount: total,
            currency: self.settings.currency.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::product;
    use crate::gateway::{GatewayError, GatewaySession, GatewaySessionStatus, MockPaymentGateway};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use sea_orm::EntityTrait;

    async fn pool() -> Arc<DbPool> {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(pool)
    }

    async fn seed_product(db: &DbPool, price: Decimal, stock: i32, active: bool) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set("Frieren figure".into()),
            price: Set(price),
            currency: Set("USD".into()),
            is_active: Set(active),
            stock: Set(stock),
            sold: Set(0),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();
        id
    }

    fn settings() -> CheckoutSettings {
        CheckoutSettings {
            currency: "USD".into(),
            max_line_quantity: 10,
            pending_payment_ttl: ChronoDuration::hours(1),
            gateway_timeout: Duration::from_secs(2),
            success_url: "http://shop/payment-success?session_id={CHECKOUT_SESSION_ID}".into(),
            cancel_url: "http://shop/cart".into(),
        }
    }

    fn open_session(id: &str) -> GatewaySession {
        GatewaySession {
            id: id.into(),
            url: Some(format!("https://pay.example.com/{id}")),
            status: GatewaySessionStatus::Open,
            payment_status: Some("unpaid".into()),
        }
    }

    #[test]
    fn duplicate_products_are_merged() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_lines(&[
            CheckoutLine { product_id: a, quantity: 1 },
            CheckoutLine { product_id: b, quantity: 2 },
            CheckoutLine { product_id: a, quantity: 3 },
        ]);
        assert_eq!(
            merged,
            vec![
                CheckoutLine { product_id: a, quantity: 4 },
                CheckoutLine { product_id: b, quantity: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn empty_checkout_never_reaches_gateway() {
        let db = pool().await;
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_checkout_session().never();

        let service = CheckoutService::new(db, Arc::new(gateway), settings());
        let err = service.initiate(Uuid::new_v4(), &[]).await.unwrap_err();
        assert_matches!(err, ServiceError::EmptyCheckout);
    }

    #[tokio::test]
    async fn rejects_non_positive_and_oversized_quantities() {
        let db = pool().await;
        let id = seed_product(&db, dec!(5), 100, true).await;
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_checkout_session().never();
        let service = CheckoutService::new(db, Arc::new(gateway), settings());

        let err = service
            .initiate(Uuid::new_v4(), &[CheckoutLine { product_id: id, quantity: 0 }])
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidLineItem(_));

        let err = service
            .initiate(
                Uuid::new_v4(),
                &[
                    CheckoutLine { product_id: id, quantity: 6 },
                    CheckoutLine { product_id: id, quantity: 5 },
                ],
            )
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidLineItem(_));
    }

    #[tokio::test]
    async fn inactive_or_unknown_products_are_invalid() {
        let db = pool().await;
        let inactive = seed_product(&db, dec!(5), 100, false).await;
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_checkout_session().never();
        let service = CheckoutService::new(db, Arc::new(gateway), settings());

        for product_id in [inactive, Uuid::new_v4()] {
            let err = service
                .initiate(Uuid::new_v4(), &[CheckoutLine { product_id, quantity: 1 }])
                .await
                .unwrap_err();
            assert_matches!(err, ServiceError::InvalidLineItem(_));
        }
    }

    #[tokio::test]
    async fn prices_come_from_catalog() {
        let db = pool().await;
        let id = seed_product(&db, dec!(12.00), 5, true).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_checkout_session()
            .withf(move |req| {
                req.line_items.len() == 1
                    && req.line_items[0].unit_price == dec!(12.00)
                    && req.line_items[0].quantity == 2
                    && (req.expires_at - chrono::Utc::now() - chrono::Duration::hours(1))
                        .num_seconds()
                        .abs()
                        < 60
            })
            .times(1)
            .returning(|_| Ok(open_session("cs_test_price")));

        let service = CheckoutService::new(db.clone(), Arc::new(gateway), settings());
        let user = Uuid::new_v4();
        let created = service
            .initiate(user, &[CheckoutLine { product_id: id, quantity: 2 }])
            .await
            .unwrap();

        assert_eq!(created.total_amount, dec!(24.00));
        assert_eq!(created.session_id, "cs_test_price");

        let pending = pending_payment::Entity::find_by_id(created.pending_payment_id)
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.user_id, user);
        assert_eq!(pending.status, PendingPaymentStatus::Initiated);
        assert_eq!(pending.session_reference.as_deref(), Some("cs_test_price"));
        assert_eq!(pending.total_amount, dec!(24.00));
        assert!(pending.expires_at > chrono::Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn gateway_failure_leaves_pending_payment_initiated() {
        let db = pool().await;
        let id = seed_product(&db, dec!(3.50), 5, true).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_checkout_session()
            .returning(|_| Err(GatewayError::Http("connection refused".into())));

        let service = CheckoutService::new(db.clone(), Arc::new(gateway), settings());
        let err = service
            .initiate(Uuid::new_v4(), &[CheckoutLine { product_id: id, quantity: 1 }])
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::GatewayUnavailable(_));

        let rows = pending_payment::Entity::find().all(&*db).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PendingPaymentStatus::Initiated);
        assert!(rows[0].session_reference.is_none());
    }

    #[tokio::test]
    async fn stock_pre_check_rejects_early() {
        let db = pool().await;
        let id = seed_product(&db, dec!(3.50), 1, true).await;
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_checkout_session().never();

        let service = CheckoutService::new(db, Arc::new(gateway), settings());
        let err = service
            .initiate(Uuid::new_v4(), &[CheckoutLine { product_id: id, quantity: 2 }])
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InsufficientStock(_));
    }
}
