use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::db::DbPool;
use crate::entities::pending_payment::{self, PendingPaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Expires checkout attempts that were never paid.
#[derive(Clone)]
pub struct ExpirySweeper {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl ExpirySweeper {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Marks every `initiated` pending payment past its deadline as `expired`.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = pending_payment::Entity::update_many()
            .set(pending_payment::ActiveModel {
                status: Set(PendingPaymentStatus::Expired),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(pending_payment::Column::Status.eq(PendingPaymentStatus::Initiated))
            .filter(pending_payment::Column::ExpiresAt.lt(now))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let expired = result.rows_affected;
        if expired > 0 {
            counter!("checkout.pending_payments.expired", expired);
            info!(expired, "Expired stale pending payments");
            self.event_sender
                .send_or_log(Event::PendingPaymentsExpired {
                    count: expired,
                    at: now,
                })
                .await;
        } else {
            debug!("No pending payments to expire");
        }
        Ok(expired)
    }

    /// Runs [`sweep_once`](Self::sweep_once) every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    error!(error = %e, "Pending payment expiry sweep failed");
                }
            }
        })
    }
}
