use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, ShippingStatus};

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

    /// Fire-and-forget delivery. A closed or full channel never fails the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events published after the writes that caused them have committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderConfirmed(Uuid),
    OrderCompleted(Uuid),
    OrderCancelled(Uuid),
    OrderReturned(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    ShippingStatusChanged {
        order_id: Uuid,
        old_status: ShippingStatus,
        new_status: ShippingStatus,
    },
    ShipmentCreated {
        order_id: Uuid,
        tracking_number: String,
    },
    OrderDelivered {
        order_id: Uuid,
        tracking_number: Option<String>,
    },
    PaymentRecorded {
        order_id: Uuid,
        receipt_number: String,
        amount: Decimal,
    },
    RefundIssued {
        order_id: Uuid,
        receipt_number: String,
        amount: Decimal,
    },
    ReturnSubmitted {
        order_id: Uuid,
        return_id: Uuid,
        code: String,
    },
    ExchangeCompleted {
        original_order_id: Uuid,
        new_order_id: Uuid,
    },
    OrdersMerged {
        target_order_id: Uuid,
        source_order_ids: Vec<Uuid>,
    },
    StockAdjusted {
        warehouse_id: Uuid,
        product_id: Uuid,
        delta: i32,
    },
}

impl Event {
    /// Events that reach customers through the notification collaborator.
    pub fn is_customer_facing(&self) -> bool {
        matches!(
            self,
            Event::OrderConfirmed(_)
                | Event::ShipmentCreated { .. }
                | Event::OrderDelivered { .. }
                | Event::RefundIssued { .. }
        )
    }
}

/// Outbound notification channel (SMS, e-mail, chat). Failures are logged by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<(), String>;
}

/// Default notifier used when no delivery channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &Event) -> Result<(), String> {
        info!(?event, "customer notification");
        Ok(())
    }
}

/// Consumer loop: forwards customer-facing events to the notifier until the channel closes.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        info!("Received event: {:?}", event);

        if !event.is_customer_facing() {
            continue;
        }

        if let Err(e) = notifier.notify(&event).await {
            error!(error = %e, ?event, "notification delivery failed");
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<Event>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &Event) -> Result<(), String> {
            self.seen.lock().unwrap().push(event.clone());
            if self.fail {
                Err("smtp unavailable".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn only_customer_facing_events_are_notified() {
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let notifier = Arc::new(RecordingNotifier::default());

        let order_id = Uuid::new_v4();
        sender.send_or_log(Event::OrderCreated(order_id)).await;
        sender.send_or_log(Event::OrderConfirmed(order_id)).await;
        drop(sender);

        process_events(rx, notifier.clone()).await;

        let seen = notifier.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Event::OrderConfirmed(order_id)]);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_stop_the_loop() {
        let (tx, rx) = mpsc::channel(8);
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });

        for _ in 0..2 {
            tx.send(Event::OrderConfirmed(Uuid::new_v4())).await.unwrap();
        }
        drop(tx);

        process_events(rx, notifier.clone()).await;
        assert_eq!(notifier.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn closed_channel_is_not_an_error_for_callers() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx)
            .send_or_log(Event::OrderCancelled(Uuid::new_v4()))
            .await;
    }
}
