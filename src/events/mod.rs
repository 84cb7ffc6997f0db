use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving half of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing. Used after a commit, where the
    /// state change already happened and a lost notification must not undo it.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Event dropped after commit");
        }
    }
}

/// Events published once a unit of work has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderShipped(Uuid),
    OrderCancelled(Uuid),

    // Cart events
    CartCleared(Uuid),

    // Appointment events
    AppointmentBooked {
        appointment_id: Uuid,
        staff_id: Uuid,
    },
    AppointmentStatusChanged {
        appointment_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Inventory events
    InventoryReserved {
        variant_id: Uuid,
        location_code: String,
        quantity: i32,
        reference: Option<String>,
    },
    InventoryReleased {
        variant_id: Uuid,
        location_code: String,
        quantity: i32,
        reference: Option<String>,
    },
    InventoryDeducted {
        variant_id: Uuid,
        location_code: String,
        quantity: i32,
        reference: Option<String>,
    },
    InventoryAdjusted {
        variant_id: Uuid,
        location_code: String,
        old_quantity: i32,
        new_quantity: i32,
        reference: Option<String>,
    },
    InventoryReceived {
        variant_id: Uuid,
        location_code: String,
        quantity: i32,
        reference: Option<String>,
    },
    InventoryTransferred {
        transfer_id: Uuid,
        variant_id: Uuid,
        from_location: String,
        to_location: String,
        quantity: i32,
    },
    LowStock {
        variant_id: Uuid,
        location_code: String,
        available: i32,
        reorder_threshold: i32,
    },

    // Maintenance events
    ReconciliationCompleted {
        date: NaiveDate,
        items_checked: usize,
        discrepancies: usize,
    },
}

impl Event {
    /// Short stable name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderShipped(_) => "order_shipped",
            Event::OrderCancelled(_) => "order_cancelled",
            Event::CartCleared(_) => "cart_cleared",
            Event::AppointmentBooked { .. } => "appointment_booked",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::InventoryReserved { .. } => "inventory_reserved",
            Event::InventoryReleased { .. } => "inventory_released",
            Event::InventoryDeducted { .. } => "inventory_deducted",
            Event::InventoryAdjusted { .. } => "inventory_adjusted",
            Event::InventoryReceived { .. } => "inventory_received",
            Event::InventoryTransferred { .. } => "inventory_transferred",
            Event::LowStock { .. } => "low_stock",
            Event::ReconciliationCompleted { .. } => "reconciliation_completed",
        }
    }
}

/// Outbound notification boundary. Delivery (mail, push, SMS) lives behind this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<(), String>;
}

/// Sink that only writes events to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn deliver(&self, event: &Event) -> Result<(), String> {
        match event {
            Event::LowStock {
                variant_id,
                location_code,
                available,
                reorder_threshold,
            } => {
                warn!(
                    %variant_id,
                    %location_code,
                    available,
                    reorder_threshold,
                    "Stock at or below reorder threshold"
                );
            }
            Event::ReconciliationCompleted {
                discrepancies, ..
            } if *discrepancies > 0 => {
                warn!(?event, "Reconciliation found discrepancies");
            }
            other => {
                let payload = serde_json::to_string(other).map_err(|e| e.to_string())?;
                info!(event = other.name(), %payload, "Event");
            }
        }
        Ok(())
    }
}

/// Drains the channel and hands every event to `sink` until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, sink: Arc<dyn NotificationSink>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("petcare_events.received", 1, "event" => event.name());
        if let Err(e) = sink.deliver(&event).await {
            error!(event = event.name(), error = %e, "Failed to deliver event");
            metrics::counter!("petcare_events.failed", 1, "event" => event.name());
        }
    }

    info!("Event processing loop stopped");
}
