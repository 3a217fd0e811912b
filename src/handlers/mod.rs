pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod webhooks;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::gateway::PaymentGateway;
use crate::services::{
    checkout::{CheckoutService, CheckoutSettings},
    orders::OrderService,
    reconciliation::ReconciliationService,
    verification::VerificationService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub verification: Arc<VerificationService>,
    pub orders: Arc<OrderService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
        config: &AppConfig,
    ) -> Self {
        Self {
            checkout: Arc::new(CheckoutService::new(
                db_pool.clone(),
                gateway.clone(),
                CheckoutSettings::from(config),
            )),
            reconciliation: Arc::new(ReconciliationService::new(
                db_pool.clone(),
                gateway.clone(),
                event_sender.clone(),
            )),
            verification: Arc::new(VerificationService::new(
                db_pool.clone(),
                gateway,
                config.gateway_timeout(),
            )),
            orders: Arc::new(OrderService::new(db_pool, event_sender)),
        }
    }
}
