use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Notifications emitted once a state change has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated { order_id: Uuid },
    OrderConfirmed { order_id: Uuid },
    OrderFulfilled { order_id: Uuid },
    OrderFullyPaid { order_id: Uuid },
    OrderCanceled { order_id: Uuid },
    OrderRefunded { order_id: Uuid, amount: Decimal },
    OrderReturned { order_id: Uuid },
    FulfillmentCreated {
        order_id: Uuid,
        fulfillment_id: Uuid,
        notify_customer: bool,
    },
    FulfillmentApproved {
        order_id: Uuid,
        fulfillment_id: Uuid,
        notify_customer: bool,
    },
    FulfillmentCanceled { order_id: Uuid, fulfillment_id: Uuid },
    InvoiceRequested { order_id: Uuid, invoice_id: Uuid },
    InvoiceSent { order_id: Uuid, invoice_id: Uuid },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderConfirmed { .. } => "order_confirmed",
            Event::OrderFulfilled { .. } => "order_fulfilled",
            Event::OrderFullyPaid { .. } => "order_fully_paid",
            Event::OrderCanceled { .. } => "order_canceled",
            Event::OrderRefunded { .. } => "order_refunded",
            Event::OrderReturned { .. } => "order_returned",
            Event::FulfillmentCreated { .. } => "fulfillment_created",
            Event::FulfillmentApproved { .. } => "fulfillment_approved",
            Event::FulfillmentCanceled { .. } => "fulfillment_canceled",
            Event::InvoiceRequested { .. } => "invoice_requested",
            Event::InvoiceSent { .. } => "invoice_sent",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id }
            | Event::OrderConfirmed { order_id }
            | Event::OrderFulfilled { order_id }
            | Event::OrderFullyPaid { order_id }
            | Event::OrderCanceled { order_id }
            | Event::OrderRefunded { order_id, .. }
            | Event::OrderReturned { order_id }
            | Event::FulfillmentCreated { order_id, .. }
            | Event::FulfillmentApproved { order_id, .. }
            | Event::FulfillmentCanceled { order_id, .. }
            | Event::InvoiceRequested { order_id, .. }
            | Event::InvoiceSent { order_id, .. } => *order_id,
        }
    }
}

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
}

/// Fire-and-forget notification sink.
///
/// Services call it only after their transaction committed; an
/// implementation must never fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, event: Event);

    async fn order_created(&self, order_id: Uuid) {
        self.dispatch(Event::OrderCreated { order_id }).await
    }

    async fn order_confirmed(&self, order_id: Uuid) {
        self.dispatch(Event::OrderConfirmed { order_id }).await
    }

    async fn order_fulfilled(&self, order_id: Uuid) {
        self.dispatch(Event::OrderFulfilled { order_id }).await
    }

    async fn order_fully_paid(&self, order_id: Uuid) {
        self.dispatch(Event::OrderFullyPaid { order_id }).await
    }

    async fn order_canceled(&self, order_id: Uuid) {
        self.dispatch(Event::OrderCanceled { order_id }).await
    }

    async fn order_refunded(&self, order_id: Uuid, amount: Decimal) {
        self.dispatch(Event::OrderRefunded { order_id, amount }).await
    }

    async fn order_returned(&self, order_id: Uuid) {
        self.dispatch(Event::OrderReturned { order_id }).await
    }

    async fn fulfillment_created(&self, order_id: Uuid, fulfillment_id: Uuid, notify_customer: bool) {
        self.dispatch(Event::FulfillmentCreated {
            order_id,
            fulfillment_id,
            notify_customer,
        })
        .await
    }

    async fn fulfillment_approved(&self, order_id: Uuid, fulfillment_id: Uuid, notify_customer: bool) {
        self.dispatch(Event::FulfillmentApproved {
            order_id,
            fulfillment_id,
            notify_customer,
        })
        .await
    }

    async fn fulfillment_canceled(&self, order_id: Uuid, fulfillment_id: Uuid) {
        self.dispatch(Event::FulfillmentCanceled {
            order_id,
            fulfillment_id,
        })
        .await
    }

    async fn invoice_requested(&self, order_id: Uuid, invoice_id: Uuid) {
        self.dispatch(Event::InvoiceRequested {
            order_id,
            invoice_id,
        })
        .await
    }

    async fn invoice_sent(&self, order_id: Uuid, invoice_id: Uuid) {
        self.dispatch(Event::InvoiceSent {
            order_id,
            invoice_id,
        })
        .await
    }
}

/// Forwards notifications to the in-process event channel.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: EventSender,
}

impl EventNotifier {
    pub fn new(sender: EventSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn dispatch(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.sender.send(event).await {
            warn!(event = name, error = %e, "notification dropped");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn dispatch(&self, _event: Event) {}
}

/// Keeps every dispatched notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(
                event = event.name(),
                order_id = %event.order_id(),
                payload = %payload,
                "notification delivered"
            ),
            Err(e) => warn!(event = event.name(), error = %e, "failed to encode notification"),
        }
    }

    info!("Event processing loop stopped");
}
