//! Append-only audit log of order changes.
//!
//! Writers always pass the connection of the transaction that performs the
//! change being described, so an event commits or rolls back together with it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::order_discount::DiscountValueType;
use crate::entities::{order_event, order_line};
use crate::errors::ServiceError;

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    User(Uuid),
    App(Uuid),
    System,
}

impl Actor {
    fn user_id(self) -> Option<Uuid> {
        match self {
            Actor::User(id) => Some(id),
            _ => None,
        }
    }

    fn app_id(self) -> Option<Uuid> {
        match self {
            Actor::App(id) => Some(id),
            _ => None,
        }
    }

    pub fn from_ids(user_id: Option<Uuid>, app_id: Option<Uuid>) -> Self {
        match (user_id, app_id) {
            (Some(id), _) => Actor::User(id),
            (None, Some(id)) => Actor::App(id),
            (None, None) => Actor::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLine {
    pub line_id: Uuid,
    pub quantity: i32,
    pub item: String,
}

impl EventLine {
    pub fn new(line: &order_line::Model, quantity: i32) -> Self {
        Self {
            line_id: line.id,
            quantity,
            item: format!("{} ({})", line.product_name, line.variant_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDiscount {
    pub value_type: DiscountValueType,
    pub value: Decimal,
    pub amount: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Shipping,
    Billing,
}

/// Closed set of order events. The variant name is the stored event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEventPayload {
    DraftCreated,
    DraftCreatedFromReplace {
        related_order_id: Uuid,
        lines: Vec<EventLine>,
    },
    Placed,
    PlacedFromDraft,
    Confirmed,
    OversoldItems {
        items: Vec<String>,
    },
    AddedProducts {
        lines: Vec<EventLine>,
    },
    RemovedProducts {
        lines: Vec<EventLine>,
    },
    Canceled,
    OrderMarkedAsPaid {
        transaction_reference: Option<String>,
    },
    OrderFullyPaid,
    OrderReplacementCreated {
        related_order_id: Uuid,
    },
    OrderDiscountAdded {
        discount: EventDiscount,
    },
    OrderDiscountUpdated {
        discount: EventDiscount,
        old_discount: EventDiscount,
    },
    OrderDiscountDeleted {
        discount: EventDiscount,
    },
    OrderLineDiscountUpdated {
        line: EventLine,
        discount: EventDiscount,
        old_discount: Option<EventDiscount>,
    },
    OrderLineDiscountRemoved {
        line: EventLine,
    },
    UpdatedAddress {
        kind: AddressKind,
        address: serde_json::Value,
    },
    UpdatedCustomer {
        user_id: Option<Uuid>,
        user_email: Option<String>,
    },
    UpdatedShippingMethod {
        shipping_method_id: Uuid,
        name: String,
        price: Decimal,
    },
    UpdatedCustomerNote {
        note: String,
    },
    PaymentAuthorized {
        payment_id: Uuid,
        amount: Decimal,
    },
    PaymentCaptured {
        payment_id: Uuid,
        amount: Decimal,
    },
    PaymentRefunded {
        payment_id: Uuid,
        amount: Decimal,
    },
    PaymentVoided {
        payment_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        message: String,
    },
    InvoiceRequested {
        invoice_id: Uuid,
    },
    InvoiceGenerated {
        invoice_id: Uuid,
        number: String,
    },
    InvoiceUpdated {
        invoice_id: Uuid,
        number: Option<String>,
        url: Option<String>,
    },
    InvoiceSent {
        invoice_id: Uuid,
    },
    FulfillmentCanceled {
        fulfillment_id: Uuid,
        warehouse_id: Option<Uuid>,
    },
    FulfillmentRestockedItems {
        warehouse_id: Uuid,
        quantity: i32,
    },
    FulfillmentFulfilledItems {
        fulfillment_id: Uuid,
        lines: Vec<EventLine>,
    },
    FulfillmentAwaitsApproval {
        fulfillment_id: Uuid,
        lines: Vec<EventLine>,
    },
    FulfillmentApproved {
        fulfillment_id: Uuid,
    },
    FulfillmentRefunded {
        amount: Decimal,
        shipping_costs_included: bool,
        lines: Vec<EventLine>,
    },
    FulfillmentReturned {
        lines: Vec<EventLine>,
    },
    FulfillmentReplaced {
        lines: Vec<EventLine>,
    },
    TrackingUpdated {
        fulfillment_id: Uuid,
        tracking_number: String,
    },
    NoteAdded {
        message: String,
    },
}

impl OrderEventPayload {
    /// The stored event type, identical to the serde tag.
    pub fn event_type(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEventRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub date: DateTime<Utc>,
    pub actor: Actor,
    pub payload: OrderEventPayload,
}

#[instrument(skip(conn, payload), fields(order_id = %order_id))]
pub async fn append<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    actor: Actor,
    payload: OrderEventPayload,
) -> Result<order_event::Model, ServiceError> {
    let parameters = serde_json::to_value(&payload)?;
    let event_type = payload.event_type();
    debug!(event_type = %event_type, "appending order event");

    let event = order_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        event_type: Set(event_type),
        user_id: Set(actor.user_id()),
        app_id: Set(actor.app_id()),
        parameters: Set(parameters),
        date: Set(Utc::now()),
    };
    Ok(event.insert(conn).await?)
}

/// Appends several events in order.
pub async fn append_all<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    actor: Actor,
    payloads: Vec<OrderEventPayload>,
) -> Result<(), ServiceError> {
    for payload in payloads {
        append(conn, order_id, actor, payload).await?;
    }
    Ok(())
}

#[instrument(skip(conn), fields(order_id = %order_id))]
pub async fn list_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<OrderEventRecord>, ServiceError> {
    let events = order_event::Entity::find()
        .filter(order_event::Column::OrderId.eq(order_id))
        .order_by_asc(order_event::Column::Date)
        .all(conn)
        .await?;

    events
        .into_iter()
        .map(|event| {
            Ok(OrderEventRecord {
                id: event.id,
                order_id: event.order_id,
                date: event.date,
                actor: Actor::from_ids(event.user_id, event.app_id),
                payload: serde_json::from_value(event.parameters)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn event_type_matches_tag() {
        assert_eq!(OrderEventPayload::Placed.event_type(), "placed");
        assert_eq!(
            OrderEventPayload::PaymentCaptured {
                payment_id: Uuid::nil(),
                amount: dec!(10),
            }
            .event_type(),
            "payment_captured"
        );
        assert_eq!(
            OrderEventPayload::FulfillmentRestockedItems {
                warehouse_id: Uuid::nil(),
                quantity: 1,
            }
            .event_type(),
            "fulfillment_restocked_items"
        );
    }

    #[test]
    fn payload_survives_storage_form() {
        let payload = OrderEventPayload::OversoldItems {
            items: vec!["Shirt (XL)".into()],
        };
        let stored = serde_json::to_value(&payload).unwrap();
        assert_eq!(stored["type"], "oversold_items");
        let restored: OrderEventPayload = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn actor_is_rebuilt_from_columns() {
        let user = Uuid::new_v4();
        assert_eq!(Actor::from_ids(Some(user), None), Actor::User(user));
        assert_eq!(Actor::from_ids(None, None), Actor::System);
        assert_eq!(Actor::User(user).user_id(), Some(user));
        assert_eq!(Actor::System.app_id(), None);
    }
}
