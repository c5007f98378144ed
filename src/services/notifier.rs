//! Outbound notification hook
//!
//! Status transitions and overdue pending transactions are published on a
//! broadcast channel. Delivery to operators is handled by whoever subscribes.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::entities::transactions;
use crate::models::transaction::TransactionStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEventKind {
    StatusChanged {
        from: Option<TransactionStatus>,
        to: TransactionStatus,
    },
    PendingOverdue,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub order_id: String,
    pub franchise: Option<String>,
    pub kind: TransactionEventKind,
    /// Seconds between the request date and the event
    pub elapsed_secs: Option<i64>,
    pub snapshot: transactions::Model,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<TransactionEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TransactionEvent) {
        trace!(order_id = %event.order_id, kind = ?event.kind, "Publishing transaction event");
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Transaction event dropped: no subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
