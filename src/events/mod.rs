use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::pending_payment::PendingPaymentStatus;

/// Capacity of the in-process event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the consumer is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Domain events raised by the checkout engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        session_reference: String,
        total_amount: Decimal,
    },
    OrderCancelled {
        order_id: Uuid,
        restored_units: i64,
    },
    OrderFulfillmentAdvanced {
        order_id: Uuid,
        status: String,
    },
    PendingPaymentsExpired {
        count: u64,
        at: DateTime<Utc>,
    },
    /// The customer was charged but stock ran out before confirmation.
    /// Needs a manual refund or backorder.
    PaymentCapturedWithoutStock {
        pending_payment_id: Uuid,
        user_id: Uuid,
        session_reference: String,
        total_amount: Decimal,
    },
    /// The customer paid after the pending payment had already closed.
    /// No order exists; needs a manual refund or a hand-made order.
    PaymentCapturedForClosedCheckout {
        pending_payment_id: Uuid,
        user_id: Uuid,
        session_reference: String,
        status: PendingPaymentStatus,
        total_amount: Decimal,
    },
}

/// Consumes events until every sender has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated {
                order_id,
                user_id,
                session_reference,
                total_amount,
            } => {
                info!(
                    %order_id,
                    %user_id,
                    %session_reference,
                    %total_amount,
                    "Order created"
                );
            }
            Event::OrderCancelled {
                order_id,
                restored_units,
            } => {
                info!(%order_id, restored_units, "Order cancelled");
            }
            Event::OrderFulfillmentAdvanced { order_id, status } => {
                info!(%order_id, %status, "Order fulfillment advanced");
            }
            Event::PendingPaymentsExpired { count, at } => {
                info!(count, %at, "Pending payments expired");
            }
            Event::PaymentCapturedWithoutStock {
                pending_payment_id,
                user_id,
                session_reference,
                total_amount,
            } => {
                error!(
                    alert = true,
                    %pending_payment_id,
                    %user_id,
                    %session_reference,
                    %total_amount,
                    "Payment captured but stock unavailable; manual refund required"
                );
            }
            Event::PaymentCapturedForClosedCheckout {
                pending_payment_id,
                user_id,
                session_reference,
                status,
                total_amount,
            } => {
                error!(
                    alert = true,
                    %pending_payment_id,
                    %user_id,
                    %session_reference,
                    ?status,
                    %total_amount,
                    "Payment captured after checkout closed; manual refund required"
                );
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_delivers_events_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        let order_id = Uuid::new_v4();
        sender
            .send(Event::OrderCancelled {
                order_id,
                restored_units: 3,
            })
            .await
            .unwrap();
        sender
            .send(Event::PendingPaymentsExpired {
                count: 2,
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Event::OrderCancelled {
                order_id,
                restored_units: 3
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(Event::PendingPaymentsExpired { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn send_fails_once_consumer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::OrderCancelled {
                order_id: Uuid::new_v4(),
                restored_units: 0
            })
            .await
            .is_err());
        // must not panic
        sender
            .send_or_log(Event::PendingPaymentsExpired {
                count: 0,
                at: Utc::now(),
            })
            .await;
    }

    #[tokio::test]
    async fn process_events_drains_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .send(Event::PaymentCapturedWithoutStock {
                pending_payment_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                session_reference: "cs_test_1".into(),
                total_amount: Decimal::new(2400, 2),
            })
            .await
            .unwrap();
        sender
            .send(Event::PaymentCapturedForClosedCheckout {
                pending_payment_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                session_reference: "cs_test_2".into(),
                status: PendingPaymentStatus::Expired,
                total_amount: Decimal::new(1200, 2),
            })
            .await
            .unwrap();
        drop(sender);
        process_events(rx).await;
    }
}
