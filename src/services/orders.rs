//! Order lifecycle: drafts, confirmation, cancellation, line and discount
//! edits, payment actions and recalculation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::{self, DbPool};
use crate::entities::fulfillment::{self, FulfillmentStatus};
use crate::entities::order::{self, OrderOrigin, OrderStatus};
use crate::entities::order_discount::{self, DiscountValueType, OrderDiscountType};
use crate::entities::payment_transaction::{self, TransactionKind};
use crate::entities::{
    channel, fulfillment_line, gift_card, order_line, payment, product_variant, shipping_method,
    variant_channel_listing,
};
use crate::errors::{PaymentError, PaymentErrorCode, ServiceError};
use crate::events::Notifier;
use crate::services::address::{country_of, Address};
use crate::services::order_events::{
    self, Actor, AddressKind, EventDiscount, EventLine, OrderEventPayload, OrderEventRecord,
};
use crate::services::payments::{NewPayment, PaymentEngine, TransactionOutcome, MANUAL_GATEWAY};
use crate::services::pricing::{self, Discount, LineInput, PricingContext, PricingProvider};
use crate::services::stock_ledger::{self, LineRequest, Reservation, ReservationContext};
use crate::services::EngineSettings;

lazy_static! {
    static ref ORDERS_CANCELED: IntCounter =
        IntCounter::new("orders_canceled_total", "Total number of canceled orders")
            .expect("metric can be created");
}

// ---------------------------------------------------------------------------
// Status derivation
// ---------------------------------------------------------------------------

/// Quantities an order's fulfillment status is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FulfillmentTotals {
    /// Ordered quantity over all lines.
    pub total: i32,
    /// Quantity in `fulfilled` fulfillments.
    pub shipped: i32,
    /// Quantity in `returned`, `refunded_and_returned` and `replaced` fulfillments.
    pub returned: i32,
    /// Quantity in `refunded` fulfillments.
    pub refunded: i32,
}

/// Status an order should have given its fulfillments.
///
/// Drafts, unconfirmed and canceled orders keep their status.
pub fn derive_status(current: OrderStatus, totals: FulfillmentTotals) -> OrderStatus {
    if matches!(
        current,
        OrderStatus::Draft | OrderStatus::Unconfirmed | OrderStatus::Canceled
    ) || totals.total == 0
    {
        return current;
    }

    let effective = totals.total - totals.refunded;
    if totals.returned > 0 {
        return if totals.returned >= effective {
            OrderStatus::Returned
        } else {
            OrderStatus::PartiallyReturned
        };
    }
    if totals.shipped == 0 && effective > 0 {
        OrderStatus::Unfulfilled
    } else if totals.shipped < effective {
        OrderStatus::PartiallyFulfilled
    } else {
        OrderStatus::Fulfilled
    }
}

// ---------------------------------------------------------------------------
// Shared order helpers
// ---------------------------------------------------------------------------

pub(crate) async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))
}

pub(crate) async fn load_channel<C: ConnectionTrait>(
    conn: &C,
    channel_id: Uuid,
) -> Result<channel::Model, ServiceError> {
    channel::Entity::find_by_id(channel_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Channel", channel_id))
}

pub(crate) async fn order_lines<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_line::Model>, ServiceError> {
    Ok(order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .order_by_asc(order_line::Column::CreatedAt)
        .all(conn)
        .await?)
}

async fn order_discounts<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_discount::Model>, ServiceError> {
    Ok(order_discount::Entity::find()
        .filter(order_discount::Column::OrderId.eq(order_id))
        .order_by_asc(order_discount::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Next sequential order number.
pub(crate) async fn next_order_number<C: ConnectionTrait>(conn: &C) -> Result<i64, ServiceError> {
    let max: Option<Option<i64>> = order::Entity::find()
        .select_only()
        .column_as(order::Column::Number.max(), "max")
        .into_tuple::<Option<i64>>()
        .one(conn)
        .await?;
    Ok(max.flatten().unwrap_or(0) + 1)
}

/// Active model of `order` with its version bumped.
pub(crate) fn touched(order: order::Model) -> order::ActiveModel {
    let version = order.version + 1;
    let mut active: order::ActiveModel = order.into();
    active.version = Set(version);
    active.updated_at = Set(Utc::now());
    active
}

/// Destination country used for pricing and warehouse ranking.
pub(crate) fn order_country(order: &order::Model, channel: &channel::Model) -> String {
    country_of(order.shipping_address.as_ref())
        .or_else(|| country_of(order.billing_address.as_ref()))
        .unwrap_or_else(|| channel.default_country.to_ascii_uppercase())
}

pub(crate) fn pricing_context(order: &order::Model, channel: &channel::Model) -> PricingContext {
    PricingContext {
        channel_id: channel.id,
        currency: order.currency.clone(),
        country_code: order_country(order, channel),
    }
}

pub(crate) fn reservation_context(order: &order::Model, channel: &channel::Model) -> ReservationContext {
    ReservationContext::new(channel, order_country(order, channel), order.collection_point_id)
}

/// Variant and channel listing of a variant that can be sold in the channel.
pub(crate) async fn purchasable_variant<C: ConnectionTrait>(
    conn: &C,
    channel_id: Uuid,
    variant_id: Uuid,
) -> Result<(product_variant::Model, variant_channel_listing::Model), ServiceError> {
    let variant = product_variant::Entity::find_by_id(variant_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::invalid_field("variant_id", format!("Variant {variant_id} does not exist"))
        })?;
    let listing = variant_channel_listing::Entity::find()
        .filter(variant_channel_listing::Column::VariantId.eq(variant_id))
        .filter(variant_channel_listing::Column::ChannelId.eq(channel_id))
        .one(conn)
        .await?
        .filter(|listing| listing.is_available_for_purchase)
        .ok_or_else(|| {
            ServiceError::invalid_field(
                "variant_id",
                format!("Variant {variant_id} is not available in this channel"),
            )
        })?;
    Ok((variant, listing))
}

/// Copies a variant into a new order line. Prices are filled in by recalculation.
pub(crate) fn line_snapshot(
    order: &order::Model,
    variant: &product_variant::Model,
    base_unit_price: Decimal,
    quantity: i32,
) -> order_line::ActiveModel {
    order_line::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        variant_id: Set(Some(variant.id)),
        product_name: Set(variant.product_name.clone()),
        variant_name: Set(variant.name.clone()),
        product_sku: Set(variant.sku.clone()),
        quantity: Set(quantity),
        quantity_fulfilled: Set(0),
        is_shipping_required: Set(variant.requires_shipping),
        is_gift_card: Set(variant.is_gift_card),
        currency: Set(order.currency.clone()),
        base_unit_price: Set(base_unit_price),
        undiscounted_unit_price_net: Set(Decimal::ZERO),
        undiscounted_unit_price_gross: Set(Decimal::ZERO),
        unit_price_net: Set(Decimal::ZERO),
        unit_price_gross: Set(Decimal::ZERO),
        total_price_net: Set(Decimal::ZERO),
        total_price_gross: Set(Decimal::ZERO),
        unit_discount_type: Set(None),
        unit_discount_value: Set(Decimal::ZERO),
        unit_discount_amount: Set(Decimal::ZERO),
        unit_discount_reason: Set(None),
        created_at: Set(Utc::now()),
    }
}

/// A new order row with zero totals.
pub(crate) fn new_order(
    number: i64,
    status: OrderStatus,
    origin: OrderOrigin,
    channel: &channel::Model,
) -> order::ActiveModel {
    let now = Utc::now();
    order::ActiveModel {
        id: Set(Uuid::new_v4()),
        number: Set(number),
        status: Set(status),
        origin: Set(origin),
        original_id: Set(None),
        channel_id: Set(channel.id),
        checkout_token: Set(None),
        user_id: Set(None),
        user_email: Set(None),
        currency: Set(channel.currency.clone()),
        shipping_address: Set(None),
        billing_address: Set(None),
        shipping_method_id: Set(None),
        shipping_method_name: Set(None),
        collection_point_id: Set(None),
        collection_point_name: Set(None),
        base_shipping_price: Set(Decimal::ZERO),
        shipping_price_net: Set(Decimal::ZERO),
        shipping_price_gross: Set(Decimal::ZERO),
        undiscounted_total_net: Set(Decimal::ZERO),
        undiscounted_total_gross: Set(Decimal::ZERO),
        subtotal_net: Set(Decimal::ZERO),
        subtotal_gross: Set(Decimal::ZERO),
        total_net: Set(Decimal::ZERO),
        total_gross: Set(Decimal::ZERO),
        total_charged: Set(Decimal::ZERO),
        customer_note: Set(String::new()),
        version: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

/// Recomputes and stores every price of the order from its current lines,
/// discounts and shipping method.
#[instrument(skip(conn, pricing, order), fields(order_id = %order.id))]
pub(crate) async fn recalculate_order<C: ConnectionTrait>(
    conn: &C,
    pricing: &dyn PricingProvider,
    order: order::Model,
) -> Result<order::Model, ServiceError> {
    let channel = load_channel(conn, order.channel_id).await?;
    let lines = order_lines(conn, order.id).await?;
    let discounts = order_discounts(conn, order.id).await?;
    let ctx = pricing_context(&order, &channel);

    let inputs: Vec<LineInput> = lines
        .iter()
        .map(|line| LineInput {
            line_id: line.id,
            quantity: line.quantity,
            base_unit_price: line.base_unit_price,
            discount: line.unit_discount_type.map(|value_type| Discount {
                value_type,
                value: line.unit_discount_value,
            }),
        })
        .collect();
    let order_level: Vec<Discount> = discounts
        .iter()
        .map(|discount| Discount {
            value_type: discount.value_type,
            value: discount.value,
        })
        .collect();
    let shipping_net = (order.shipping_method_id.is_some()
        && lines.iter().any(|line| line.is_shipping_required))
    .then_some(order.base_shipping_price);

    let prices = pricing::recalculate(pricing, &ctx, &inputs, &order_level, shipping_net);

    for line in lines {
        let Some(price) = prices.line(line.id).cloned() else {
            continue;
        };
        let mut active: order_line::ActiveModel = line.into();
        active.undiscounted_unit_price_net = Set(price.undiscounted_unit.net);
        active.undiscounted_unit_price_gross = Set(price.undiscounted_unit.gross);
        active.unit_price_net = Set(price.unit.net);
        active.unit_price_gross = Set(price.unit.gross);
        active.total_price_net = Set(price.total.net);
        active.total_price_gross = Set(price.total.gross);
        active.unit_discount_amount = Set(price.unit_discount_amount);
        active.update(conn).await?;
    }

    for (discount, amount) in discounts.into_iter().zip(prices.discount_amounts.iter().copied()) {
        if discount.amount != amount {
            let mut active: order_discount::ActiveModel = discount.into();
            active.amount = Set(amount);
            active.update(conn).await?;
        }
    }

    let mut active = touched(order);
    active.shipping_price_net = Set(prices.shipping.net);
    active.shipping_price_gross = Set(prices.shipping.gross);
    active.undiscounted_total_net = Set(prices.undiscounted_total.net);
    active.undiscounted_total_gross = Set(prices.undiscounted_total.gross);
    active.subtotal_net = Set(prices.subtotal.net);
    active.subtotal_gross = Set(prices.subtotal.gross);
    active.total_net = Set(prices.total.net);
    active.total_gross = Set(prices.total.gross);
    Ok(active.update(conn).await?)
}

/// Keeps `total_charged` equal to what the order's payments captured.
pub(crate) async fn sync_total_charged<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<order::Model, ServiceError> {
    let charged: Decimal = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order.id))
        .all(conn)
        .await?
        .iter()
        .map(|payment| payment.captured_amount)
        .sum();
    if charged == order.total_charged {
        return Ok(order);
    }
    let mut active = touched(order);
    active.total_charged = Set(charged);
    Ok(active.update(conn).await?)
}

/// Re-derives the order status from its lines and fulfillments.
pub(crate) async fn refresh_status<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<order::Model, ServiceError> {
    let lines = order_lines(conn, order.id).await?;
    let fulfillments = fulfillment::Entity::find()
        .filter(fulfillment::Column::OrderId.eq(order.id))
        .filter(fulfillment::Column::Status.ne(FulfillmentStatus::Canceled))
        .find_with_related(fulfillment_line::Entity)
        .all(conn)
        .await?;

    let mut totals = FulfillmentTotals {
        total: lines.iter().map(|line| line.quantity).sum(),
        ..Default::default()
    };
    for (fulfillment, fulfillment_lines) in fulfillments {
        let quantity: i32 = fulfillment_lines.iter().map(|line| line.quantity).sum();
        match fulfillment.status {
            FulfillmentStatus::Fulfilled => totals.shipped += quantity,
            FulfillmentStatus::Refunded => totals.refunded += quantity,
            FulfillmentStatus::Returned
            | FulfillmentStatus::RefundedAndReturned
            | FulfillmentStatus::Replaced => totals.returned += quantity,
            FulfillmentStatus::WaitingForApproval | FulfillmentStatus::Canceled => {}
        }
    }

    let status = derive_status(order.status, totals);
    if status == order.status {
        return Ok(order);
    }
    info!(order_id = %order.id, from = %order.status, to = %status, "order status derived");
    let mut active = touched(order);
    active.status = Set(status);
    Ok(active.update(conn).await?)
}

/// Appends the order event describing a payment transaction.
pub(crate) async fn record_payment_outcome<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    actor: Actor,
    outcome: &TransactionOutcome,
) -> Result<(), ServiceError> {
    let payment_id = outcome.payment.id;
    let amount = outcome.transaction.amount;
    let payload = if let Some(error) = &outcome.error {
        OrderEventPayload::PaymentFailed {
            payment_id,
            message: error.message.clone(),
        }
    } else {
        match outcome.transaction.kind {
            TransactionKind::Auth => OrderEventPayload::PaymentAuthorized { payment_id, amount },
            TransactionKind::Capture => OrderEventPayload::PaymentCaptured { payment_id, amount },
            TransactionKind::Refund => OrderEventPayload::PaymentRefunded { payment_id, amount },
            TransactionKind::Void => OrderEventPayload::PaymentVoided { payment_id },
            _ => return Ok(()),
        }
    };
    order_events::append(conn, order_id, actor, payload).await?;
    Ok(())
}

pub(crate) fn event_discount(discount: &order_discount::Model) -> EventDiscount {
    EventDiscount {
        value_type: discount.value_type,
        value: discount.value,
        amount: discount.amount,
        reason: discount.reason.clone(),
    }
}

fn event_line_discount(line: &order_line::Model) -> Option<EventDiscount> {
    line.unit_discount_type.map(|value_type| EventDiscount {
        value_type,
        value: line.unit_discount_value,
        amount: line.unit_discount_amount,
        reason: line.unit_discount_reason.clone(),
    })
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLineInput {
    pub variant_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be greater than zero"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DiscountInput {
    pub value_type: DiscountValueType,
    pub value: Decimal,
    #[validate(length(max = 255))]
    pub reason: Option<String>,
}

impl DiscountInput {
    fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;
        if self.value <= Decimal::ZERO {
            return Err(ServiceError::invalid_field("value", "Value must be greater than zero"));
        }
        if self.value_type == DiscountValueType::Percentage && self.value > Decimal::ONE_HUNDRED {
            return Err(ServiceError::invalid_field(
                "value",
                "Percentage discount cannot exceed 100",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DraftOrderCreate {
    pub channel_id: Uuid,
    pub user_id: Option<Uuid>,
    #[validate(email)]
    pub user_email: Option<String>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub shipping_method_id: Option<Uuid>,
    #[serde(default)]
    pub lines: Vec<OrderLineInput>,
    pub discount: Option<DiscountInput>,
    #[serde(default)]
    pub customer_note: String,
}

/// Fields of a draft order to change. Every present field is applied on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DraftOrderUpdate {
    pub user_id: Option<Uuid>,
    #[validate(email)]
    pub user_email: Option<String>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub shipping_method_id: Option<Uuid>,
    pub customer_note: Option<String>,
}

impl DraftOrderUpdate {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.user_email.is_none()
            && self.shipping_address.is_none()
            && self.billing_address.is_none()
            && self.shipping_method_id.is_none()
            && self.customer_note.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentDetails {
    #[serde(flatten)]
    pub fulfillment: fulfillment::Model,
    pub lines: Vec<fulfillment_line::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
    pub discounts: Vec<order_discount::Model>,
    pub fulfillments: Vec<FulfillmentDetails>,
    pub payments: Vec<payment::Model>,
}

pub(crate) async fn load_details<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderDetails, ServiceError> {
    let lines = order_lines(conn, order.id).await?;
    let discounts = order_discounts(conn, order.id).await?;
    let fulfillments = fulfillment::Entity::find()
        .filter(fulfillment::Column::OrderId.eq(order.id))
        .order_by_asc(fulfillment::Column::FulfillmentOrder)
        .find_with_related(fulfillment_line::Entity)
        .all(conn)
        .await?
        .into_iter()
        .map(|(fulfillment, lines)| FulfillmentDetails { fulfillment, lines })
        .collect();
    let payments = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order.id))
        .order_by_asc(payment::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(OrderDetails {
        order,
        lines,
        discounts,
        fulfillments,
        payments,
    })
}

/// Outcome of deleting a draft order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DraftDeletion {
    Deleted { id: Uuid },
    Canceled { order: Box<OrderDetails> },
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPaymentResult {
    pub order: OrderDetails,
    pub transaction: payment_transaction::Model,
    pub error: Option<PaymentError>,
}

/// Notifications to send once the transaction committed.
#[derive(Debug, Default)]
struct Pending {
    created: bool,
    confirmed: bool,
    fully_paid: bool,
    canceled: bool,
    refunded: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
    pricing: Arc<dyn PricingProvider>,
    payments: PaymentEngine,
    settings: EngineSettings,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        notifier: Arc<dyn Notifier>,
        pricing: Arc<dyn PricingProvider>,
        payments: PaymentEngine,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            notifier,
            pricing,
            payments,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn notify(&self, order_id: Uuid, pending: Pending) {
        if pending.created {
            self.notifier.order_created(order_id).await;
        }
        if pending.confirmed {
            self.notifier.order_confirmed(order_id).await;
        }
        if pending.fully_paid {
            self.notifier.order_fully_paid(order_id).await;
        }
        if let Some(amount) = pending.refunded {
            self.notifier.order_refunded(order_id, amount).await;
        }
        if pending.canceled {
            self.notifier.order_canceled(order_id).await;
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        load_details(&*self.db, order).await
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEventRecord>, ServiceError> {
        load_order(&*self.db, order_id).await?;
        order_events::list_for_order(&*self.db, order_id).await
    }

    // -- drafts -------------------------------------------------------------

    #[instrument(skip(self, input), fields(channel_id = %input.channel_id))]
    pub async fn draft_order_create(
        &self,
        actor: Actor,
        input: DraftOrderCreate,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        for line in &input.lines {
            line.validate()?;
        }
        if let Some(discount) = &input.discount {
            discount.check()?;
        }
        let shipping_address = input.shipping_address.as_ref().map(Address::to_json).transpose()?;
        let billing_address = input.billing_address.as_ref().map(Address::to_json).transpose()?;

        let txn = self.db.begin().await?;
        let result = async {
            let channel = channel::Entity::find_by_id(input.channel_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::invalid_field("channel_id", "Channel does not exist"))?;
            let number = next_order_number(&txn).await?;

            let mut active = new_order(number, OrderStatus::Draft, OrderOrigin::Draft, &channel);
            active.user_id = Set(input.user_id);
            active.user_email = Set(input.user_email.clone());
            active.shipping_address = Set(shipping_address);
            active.billing_address = Set(billing_address);
            active.customer_note = Set(input.customer_note.clone());
            if let Some(method_id) = input.shipping_method_id {
                let method = self.shipping_method_for(&txn, &channel, method_id).await?;
                active.shipping_method_id = Set(Some(method.id));
                active.shipping_method_name = Set(Some(method.name));
                active.base_shipping_price = Set(method.price);
            }
            let order = active.insert(&txn).await?;

            let mut merged: Vec<(Uuid, i32)> = Vec::new();
            for line in &input.lines {
                match merged.iter_mut().find(|(variant_id, _)| *variant_id == line.variant_id) {
                    Some((_, quantity)) => *quantity += line.quantity,
                    None => merged.push((line.variant_id, line.quantity)),
                }
            }
            let mut added = Vec::with_capacity(merged.len());
            for (variant_id, quantity) in merged {
                let (variant, listing) = purchasable_variant(&txn, channel.id, variant_id).await?;
                let line = line_snapshot(&order, &variant, listing.price_amount, quantity)
                    .insert(&txn)
                    .await?;
                added.push(EventLine::new(&line, quantity));
            }

            if let Some(discount) = &input.discount {
                self.insert_manual_discount(&txn, order.id, discount).await?;
            }

            order_events::append(&txn, order.id, actor, OrderEventPayload::DraftCreated).await?;
            if !added.is_empty() {
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::AddedProducts { lines: added },
                )
                .await?;
            }

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        let details = db::finish(txn, result).await?;
        info!(order_id = %details.order.id, number = details.order.number, "draft order created");
        Ok(details)
    }

    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn draft_order_update(
        &self,
        actor: Actor,
        order_id: Uuid,
        input: DraftOrderUpdate,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        if input.is_empty() {
            return Err(ServiceError::invalid_field(
                "input",
                "At least one field must be given to update a draft order",
            ));
        }
        let shipping_address = input.shipping_address.as_ref().map(Address::to_json).transpose()?;
        let billing_address = input.billing_address.as_ref().map(Address::to_json).transpose()?;

        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if order.status != OrderStatus::Draft {
                return Err(ServiceError::InvalidOrderStatusForAction(format!(
                    "Only draft orders can be updated, order is {}",
                    order.status
                )));
            }
            let channel = load_channel(&txn, order.channel_id).await?;

            let mut events = Vec::new();
            if input.user_id.is_some() || input.user_email.is_some() {
                events.push(OrderEventPayload::UpdatedCustomer {
                    user_id: input.user_id.or(order.user_id),
                    user_email: input.user_email.clone().or_else(|| order.user_email.clone()),
                });
            }
            let mut active = touched(order);
            if let Some(user_id) = input.user_id {
                active.user_id = Set(Some(user_id));
            }
            if let Some(email) = &input.user_email {
                active.user_email = Set(Some(email.clone()));
            }
            if let Some(address) = shipping_address {
                active.shipping_address = Set(Some(address.clone()));
                events.push(OrderEventPayload::UpdatedAddress {
                    kind: AddressKind::Shipping,
                    address,
                });
            }
            if let Some(address) = billing_address {
                active.billing_address = Set(Some(address.clone()));
                events.push(OrderEventPayload::UpdatedAddress {
                    kind: AddressKind::Billing,
                    address,
                });
            }
            if let Some(method_id) = input.shipping_method_id {
                let method = self.shipping_method_for(&txn, &channel, method_id).await?;
                events.push(OrderEventPayload::UpdatedShippingMethod {
                    shipping_method_id: method.id,
                    name: method.name.clone(),
                    price: method.price,
                });
                active.shipping_method_id = Set(Some(method.id));
                active.shipping_method_name = Set(Some(method.name));
                active.base_shipping_price = Set(method.price);
            }
            if let Some(note) = &input.customer_note {
                active.customer_note = Set(note.clone());
                events.push(OrderEventPayload::UpdatedCustomerNote { note: note.clone() });
            }
            let order = active.update(&txn).await?;
            order_events::append_all(&txn, order.id, actor, events).await?;

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Places a draft order.
    ///
    /// Lines that cannot be allocated do not block the order: they stay
    /// unallocated and are listed in an `OversoldItems` event.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn draft_order_complete(
        &self,
        actor: Actor,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if order.status != OrderStatus::Draft {
                return Err(ServiceError::InvalidOrderStatusForAction(format!(
                    "Only draft orders can be completed, order is {}",
                    order.status
                )));
            }
            let channel = load_channel(&txn, order.channel_id).await?;
            let lines = order_lines(&txn, order.id).await?;
            if lines.is_empty() {
                return Err(ServiceError::invalid_field("lines", "Could not create order without any products"));
            }
            if order.user_email.is_none() && order.user_id.is_none() {
                return Err(ServiceError::invalid_field("user_email", "Email is required to place an order"));
            }
            if lines.iter().any(|line| line.is_shipping_required) {
                let Some(country) = country_of(order.shipping_address.as_ref()) else {
                    return Err(ServiceError::invalid_field("shipping_address", "Shipping address is required"));
                };
                let Some(method_id) = order.shipping_method_id else {
                    return Err(ServiceError::invalid_field("shipping_method", "Shipping method is required"));
                };
                let method = self.shipping_method_for(&txn, &channel, method_id).await?;
                if !method.ships_to(&country) {
                    return Err(ServiceError::DeliveryMethodNotApplicable {
                        field: "shipping_method".into(),
                        message: format!("Shipping method does not ship to {country}"),
                    });
                }
            }

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            let ctx = reservation_context(&order, &channel);
            let mut pending: Vec<LineRequest> = lines
                .iter()
                .filter_map(|line| {
                    line.variant_id.map(|variant_id| LineRequest {
                        line_id: line.id,
                        variant_id,
                        quantity: line.quantity,
                    })
                })
                .collect();
            let mut oversold = Vec::new();
            while !pending.is_empty() {
                match stock_ledger::reserve(&txn, &ctx, &pending).await? {
                    Reservation::Allocated(_) => break,
                    Reservation::Insufficient(insufficient) => {
                        let unmet = insufficient.line_ids();
                        pending.retain(|line| !unmet.contains(&line.line_id));
                        oversold.extend(unmet);
                    }
                }
            }

            let confirmed = channel.automatically_confirm_all_new_orders;
            let mut active = touched(order);
            active.status = Set(if confirmed {
                OrderStatus::Unfulfilled
            } else {
                OrderStatus::Unconfirmed
            });
            let order = active.update(&txn).await?;

            order_events::append(&txn, order.id, actor, OrderEventPayload::PlacedFromDraft).await?;
            if !oversold.is_empty() {
                let items = lines
                    .iter()
                    .filter(|line| oversold.contains(&line.id))
                    .map(|line| format!("{} ({})", line.product_name, line.variant_name))
                    .collect();
                warn!(order_id = %order.id, lines = oversold.len(), "draft order placed with oversold lines");
                order_events::append(&txn, order.id, actor, OrderEventPayload::OversoldItems { items })
                    .await?;
            }
            if confirmed {
                order_events::append(&txn, order.id, actor, OrderEventPayload::Confirmed).await?;
            }
            Ok((load_details(&txn, order).await?, confirmed))
        }
        .await;
        let (details, confirmed) = db::finish(txn, result).await?;
        info!(order_id = %order_id, status = %details.order.status, "draft order completed");
        self.notify(
            order_id,
            Pending {
                created: true,
                confirmed,
                ..Default::default()
            },
        )
        .await;
        Ok(details)
    }

    /// Deletes a draft, or cancels an unconfirmed order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn draft_order_delete(
        &self,
        actor: Actor,
        order_id: Uuid,
    ) -> Result<DraftDeletion, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        match order.status {
            OrderStatus::Draft => {
                let txn = self.db.begin().await?;
                let result = async {
                    order_discount::Entity::delete_many()
                        .filter(order_discount::Column::OrderId.eq(order_id))
                        .exec(&txn)
                        .await?;
                    order_line::Entity::delete_many()
                        .filter(order_line::Column::OrderId.eq(order_id))
                        .exec(&txn)
                        .await?;
                    order.delete(&txn).await?;
                    Ok(())
                }
                .await;
                db::finish(txn, result).await?;
                info!(order_id = %order_id, "draft order deleted");
                Ok(DraftDeletion::Deleted { id: order_id })
            }
            OrderStatus::Unconfirmed => {
                let details = self.cancel(actor, order_id).await?;
                Ok(DraftDeletion::Canceled {
                    order: Box::new(details),
                })
            }
            status => Err(ServiceError::InvalidOrderStatusForAction(format!(
                "Cannot delete an order that is {status}"
            ))),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm(&self, actor: Actor, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if order.status != OrderStatus::Unconfirmed {
                return Err(ServiceError::InvalidOrderStatusForAction(format!(
                    "Provided order is {}, only unconfirmed orders can be confirmed",
                    order.status
                )));
            }
            if order_lines(&txn, order.id).await?.is_empty() {
                return Err(ServiceError::invalid_field("lines", "Provided order has no lines"));
            }
            let channel = load_channel(&txn, order.channel_id).await?;

            let mut active = touched(order);
            active.status = Set(OrderStatus::Unfulfilled);
            let mut order = active.update(&txn).await?;
            order_events::append(&txn, order.id, actor, OrderEventPayload::Confirmed).await?;

            let mut pending = Pending {
                confirmed: true,
                ..Default::default()
            };
            if channel.automatically_capture_authorized_payments {
                if let Some(payment) = self.payments.active_for_order(&txn, order.id).await? {
                    if payment.can_capture() && !payment.to_confirm {
                        let outcome = self.payments.capture(&txn, payment.id, None).await?;
                        record_payment_outcome(&txn, order.id, actor, &outcome).await?;
                        let was_paid = order.is_fully_paid();
                        order = sync_total_charged(&txn, order).await?;
                        if !was_paid && order.is_fully_paid() && outcome.is_success() {
                            order_events::append(&txn, order.id, actor, OrderEventPayload::OrderFullyPaid)
                                .await?;
                            pending.fully_paid = true;
                        }
                    }
                }
            }
            Ok((load_details(&txn, order).await?, pending))
        }
        .await;
        let (details, pending) = db::finish(txn, result).await?;
        info!(order_id = %order_id, "order confirmed");
        self.notify(order_id, pending).await;
        Ok(details)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel(&self, actor: Actor, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if !order.status.can_cancel() {
                return Err(ServiceError::CannotCancel(format!(
                    "Order is {} and cannot be canceled",
                    order.status
                )));
            }
            let active_fulfillments = fulfillment::Entity::find()
                .filter(fulfillment::Column::OrderId.eq(order.id))
                .filter(fulfillment::Column::Status.ne(FulfillmentStatus::Canceled))
                .one(&txn)
                .await?;
            if active_fulfillments.is_some() {
                return Err(ServiceError::CannotCancel(
                    "Order has fulfillments, cancel them first".into(),
                ));
            }

            stock_ledger::release_order(&txn, order.id).await?;
            let refunded = self.settle_payment_on_cancel(&txn, actor, order.id).await?;

            gift_card::Entity::update_many()
                .col_expr(gift_card::Column::IsActive, Expr::value(false))
                .filter(gift_card::Column::BoughtInOrderId.eq(order.id))
                .exec(&txn)
                .await?;

            let mut active = touched(order);
            active.status = Set(OrderStatus::Canceled);
            let order = active.update(&txn).await?;
            let order = sync_total_charged(&txn, order).await?;
            order_events::append(&txn, order.id, actor, OrderEventPayload::Canceled).await?;
            Ok((load_details(&txn, order).await?, refunded))
        }
        .await;
        let (details, refunded) = db::finish(txn, result).await?;
        ORDERS_CANCELED.inc();
        info!(order_id = %order_id, "order canceled");
        self.notify(
            order_id,
            Pending {
                canceled: true,
                refunded,
                ..Default::default()
            },
        )
        .await;
        Ok(details)
    }

    /// Voids an authorized payment or refunds a captured one. A gateway
    /// failure is recorded but does not stop the cancellation.
    async fn settle_payment_on_cancel<C: ConnectionTrait>(
        &self,
        conn: &C,
        actor: Actor,
        order_id: Uuid,
    ) -> Result<Option<Decimal>, ServiceError> {
        let Some(payment) = self.payments.active_for_order(conn, order_id).await? else {
            return Ok(None);
        };
        let result = if payment.can_refund() && payment.captured_amount > Decimal::ZERO {
            self.payments.refund(conn, payment.id, None).await
        } else if payment.can_void() {
            self.payments.void(conn, payment.id).await
        } else {
            return Ok(None);
        };

        match result {
            Ok(outcome) => {
                record_payment_outcome(conn, order_id, actor, &outcome).await?;
                let refunded = (outcome.is_success()
                    && outcome.transaction.kind == TransactionKind::Refund)
                    .then_some(outcome.transaction.amount);
                Ok(refunded)
            }
            Err(ServiceError::Payment(err)) => {
                warn!(order_id = %order_id, error = %err, "payment left untouched on cancel");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // -- lines --------------------------------------------------------------

    async fn editable_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        let order = load_order(conn, order_id).await?;
        if !order.status.is_editable() {
            return Err(ServiceError::InvalidOrderStatusForAction(format!(
                "Only draft and unconfirmed orders can be edited, order is {}",
                order.status
            )));
        }
        Ok(order)
    }

    /// Reserves more units for a line of an unconfirmed order.
    async fn allocate_more<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &order::Model,
        line: &order_line::Model,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if order.status != OrderStatus::Unconfirmed || quantity <= 0 {
            return Ok(());
        }
        let Some(variant_id) = line.variant_id else {
            return Ok(());
        };
        let channel = load_channel(conn, order.channel_id).await?;
        let ctx = reservation_context(order, &channel);
        stock_ledger::reserve(
            conn,
            &ctx,
            &[LineRequest {
                line_id: line.id,
                variant_id,
                quantity,
            }],
        )
        .await?
        .into_result()?;
        Ok(())
    }

    #[instrument(skip(self, lines), fields(order_id = %order_id))]
    pub async fn order_lines_create(
        &self,
        actor: Actor,
        order_id: Uuid,
        lines: Vec<OrderLineInput>,
    ) -> Result<OrderDetails, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::invalid_field("lines", "At least one line is required"));
        }
        for line in &lines {
            line.validate()?;
        }

        let txn = self.db.begin().await?;
        let result = async {
            let order = self.editable_order(&txn, order_id).await?;
            let existing = order_lines(&txn, order.id).await?;
            let mut by_variant: HashMap<Uuid, order_line::Model> = existing
                .into_iter()
                .filter_map(|line| line.variant_id.map(|variant_id| (variant_id, line)))
                .collect();

            let mut added = Vec::with_capacity(lines.len());
            for input in &lines {
                let (variant, listing) =
                    purchasable_variant(&txn, order.channel_id, input.variant_id).await?;
                let line = match by_variant.remove(&variant.id) {
                    Some(line) => {
                        let quantity = line.quantity + input.quantity;
                        let mut active: order_line::ActiveModel = line.into();
                        active.quantity = Set(quantity);
                        active.update(&txn).await?
                    }
                    None => {
                        line_snapshot(&order, &variant, listing.price_amount, input.quantity)
                            .insert(&txn)
                            .await?
                    }
                };
                self.allocate_more(&txn, &order, &line, input.quantity).await?;
                added.push(EventLine::new(&line, input.quantity));
                by_variant.insert(variant.id, line);
            }

            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::AddedProducts { lines: added },
            )
            .await?;
            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Sets a line's quantity; zero deletes the line.
    #[instrument(skip(self), fields(order_line_id = %line_id))]
    pub async fn order_line_update(
        &self,
        actor: Actor,
        line_id: Uuid,
        quantity: i32,
    ) -> Result<OrderDetails, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::invalid_field("quantity", "Quantity cannot be negative"));
        }
        if quantity == 0 {
            return self.order_line_delete(actor, line_id).await;
        }

        let txn = self.db.begin().await?;
        let result = async {
            let line = self.load_line(&txn, line_id).await?;
            let order = self.editable_order(&txn, line.order_id).await?;
            let previous = line.quantity;
            let mut active: order_line::ActiveModel = line.into();
            active.quantity = Set(quantity);
            let line = active.update(&txn).await?;

            let diff = quantity - previous;
            if diff > 0 {
                self.allocate_more(&txn, &order, &line, diff).await?;
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::AddedProducts {
                        lines: vec![EventLine::new(&line, diff)],
                    },
                )
                .await?;
            } else if diff < 0 {
                stock_ledger::release(&txn, line.id, -diff).await?;
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::RemovedProducts {
                        lines: vec![EventLine::new(&line, -diff)],
                    },
                )
                .await?;
            }

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(order_line_id = %line_id))]
    pub async fn order_line_delete(
        &self,
        actor: Actor,
        line_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let line = self.load_line(&txn, line_id).await?;
            let order = self.editable_order(&txn, line.order_id).await?;
            stock_ledger::release(&txn, line.id, i32::MAX).await?;
            let removed = EventLine::new(&line, line.quantity);
            line.delete(&txn).await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::RemovedProducts {
                    lines: vec![removed],
                },
            )
            .await?;
            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    async fn load_line<C: ConnectionTrait>(
        &self,
        conn: &C,
        line_id: Uuid,
    ) -> Result<order_line::Model, ServiceError> {
        order_line::Entity::find_by_id(line_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order line", line_id))
    }

    async fn shipping_method_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        channel: &channel::Model,
        method_id: Uuid,
    ) -> Result<shipping_method::Model, ServiceError> {
        shipping_method::Entity::find_by_id(method_id)
            .one(conn)
            .await?
            .filter(|method| method.channel_id == channel.id)
            .ok_or_else(|| {
                ServiceError::invalid_field(
                    "shipping_method",
                    "Shipping method is not available in this channel",
                )
            })
    }

    // -- discounts ----------------------------------------------------------

    async fn insert_manual_discount<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        input: &DiscountInput,
    ) -> Result<order_discount::Model, ServiceError> {
        let existing = order_discount::Entity::find()
            .filter(order_discount::Column::OrderId.eq(order_id))
            .filter(order_discount::Column::DiscountType.eq(OrderDiscountType::Manual))
            .one(conn)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::invalid_field(
                "discount",
                "Only one manual discount can be applied to an order",
            ));
        }
        Ok(order_discount::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            discount_type: Set(OrderDiscountType::Manual),
            value_type: Set(input.value_type),
            value: Set(input.value),
            amount: Set(Decimal::ZERO),
            name: Set(None),
            reason: Set(input.reason.clone()),
            voucher_code: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?)
    }

    async fn load_discount<C: ConnectionTrait>(
        &self,
        conn: &C,
        discount_id: Uuid,
    ) -> Result<order_discount::Model, ServiceError> {
        order_discount::Entity::find_by_id(discount_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order discount", discount_id))
    }

    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn order_discount_add(
        &self,
        actor: Actor,
        order_id: Uuid,
        input: DiscountInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.check()?;
        let txn = self.db.begin().await?;
        let result = async {
            let order = self.editable_order(&txn, order_id).await?;
            let discount = self.insert_manual_discount(&txn, order.id, &input).await?;
            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            let discount = self.load_discount(&txn, discount.id).await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderDiscountAdded {
                    discount: event_discount(&discount),
                },
            )
            .await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, input), fields(discount_id = %discount_id))]
    pub async fn order_discount_update(
        &self,
        actor: Actor,
        discount_id: Uuid,
        input: DiscountInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.check()?;
        let txn = self.db.begin().await?;
        let result = async {
            let discount = self.load_discount(&txn, discount_id).await?;
            let order = self.editable_order(&txn, discount.order_id).await?;
            let old_discount = event_discount(&discount);

            let mut active: order_discount::ActiveModel = discount.into();
            active.value_type = Set(input.value_type);
            active.value = Set(input.value);
            active.reason = Set(input.reason.clone());
            active.update(&txn).await?;

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            let discount = self.load_discount(&txn, discount_id).await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderDiscountUpdated {
                    discount: event_discount(&discount),
                    old_discount,
                },
            )
            .await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(discount_id = %discount_id))]
    pub async fn order_discount_delete(
        &self,
        actor: Actor,
        discount_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let discount = self.load_discount(&txn, discount_id).await?;
            let order = self.editable_order(&txn, discount.order_id).await?;
            let removed = event_discount(&discount);
            discount.delete(&txn).await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderDiscountDeleted { discount: removed },
            )
            .await?;
            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, input), fields(order_line_id = %line_id))]
    pub async fn order_line_discount_update(
        &self,
        actor: Actor,
        line_id: Uuid,
        input: DiscountInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.check()?;
        let txn = self.db.begin().await?;
        let result = async {
            let line = self.load_line(&txn, line_id).await?;
            let order = self.editable_order(&txn, line.order_id).await?;
            let old_discount = event_line_discount(&line);

            let mut active: order_line::ActiveModel = line.into();
            active.unit_discount_type = Set(Some(input.value_type));
            active.unit_discount_value = Set(input.value);
            active.unit_discount_reason = Set(input.reason.clone());
            active.update(&txn).await?;

            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            let line = self.load_line(&txn, line_id).await?;
            let discount = event_line_discount(&line).ok_or_else(|| {
                ServiceError::InternalError("line discount missing after update".into())
            })?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderLineDiscountUpdated {
                    line: EventLine::new(&line, line.quantity),
                    discount,
                    old_discount,
                },
            )
            .await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(order_line_id = %line_id))]
    pub async fn order_line_discount_remove(
        &self,
        actor: Actor,
        line_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let line = self.load_line(&txn, line_id).await?;
            let order = self.editable_order(&txn, line.order_id).await?;
            let event_line = EventLine::new(&line, line.quantity);

            let mut active: order_line::ActiveModel = line.into();
            active.unit_discount_type = Set(None);
            active.unit_discount_value = Set(Decimal::ZERO);
            active.unit_discount_amount = Set(Decimal::ZERO);
            active.unit_discount_reason = Set(None);
            active.update(&txn).await?;

            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderLineDiscountRemoved { line: event_line },
            )
            .await?;
            let order = recalculate_order(&txn, self.pricing.as_ref(), order).await?;
            load_details(&txn, order).await
        }
        .await;
        db::finish(txn, result).await
    }

    // -- payments -----------------------------------------------------------

    async fn payable_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        let order = load_order(conn, order_id).await?;
        if matches!(order.status, OrderStatus::Draft | OrderStatus::Canceled) {
            return Err(ServiceError::InvalidOrderStatusForAction(format!(
                "Payments cannot be processed for an order that is {}",
                order.status
            )));
        }
        Ok(order)
    }

    async fn active_payment<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        self.payments
            .active_for_order(conn, order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::Payment(PaymentError::new(
                    PaymentErrorCode::NotFound,
                    "There is no active payment for this order",
                ))
            })
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_as_paid(
        &self,
        actor: Actor,
        order_id: Uuid,
        transaction_reference: Option<String>,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = self.payable_order(&txn, order_id).await?;
            let existing = payment::Entity::find()
                .filter(payment::Column::OrderId.eq(order.id))
                .one(&txn)
                .await?;
            if existing.is_some() {
                return Err(ServiceError::Payment(PaymentError::new(
                    PaymentErrorCode::AlreadyPaid,
                    "Orders with payments can not be manually marked as paid",
                )));
            }

            let payment = self
                .payments
                .create(
                    &txn,
                    NewPayment {
                        gateway: MANUAL_GATEWAY.to_string(),
                        token: transaction_reference.clone().unwrap_or_default(),
                        total: order.total_gross,
                        currency: order.currency.clone(),
                        checkout_token: None,
                        order_id: Some(order.id),
                        billing_email: order.user_email.clone(),
                        psp_reference: transaction_reference.clone(),
                    },
                )
                .await?;
            if order.total_gross > Decimal::ZERO {
                self.payments.capture(&txn, payment.id, None).await?;
            }

            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::OrderMarkedAsPaid {
                    transaction_reference,
                },
            )
            .await?;
            let order = sync_total_charged(&txn, order).await?;
            order_events::append(&txn, order.id, actor, OrderEventPayload::OrderFullyPaid).await?;
            load_details(&txn, order).await
        }
        .await;
        let details = db::finish(txn, result).await?;
        info!(order_id = %order_id, "order marked as paid");
        self.notify(
            order_id,
            Pending {
                fully_paid: true,
                ..Default::default()
            },
        )
        .await;
        Ok(details)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_capture(
        &self,
        actor: Actor,
        order_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<OrderPaymentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = self.payable_order(&txn, order_id).await?;
            let payment = self.active_payment(&txn, order.id).await?;
            let outcome = self.payments.capture(&txn, payment.id, amount).await?;
            record_payment_outcome(&txn, order.id, actor, &outcome).await?;

            let was_paid = order.is_fully_paid();
            let order = sync_total_charged(&txn, order).await?;
            let mut pending = Pending::default();
            if outcome.is_success() && !was_paid && order.is_fully_paid() {
                order_events::append(&txn, order.id, actor, OrderEventPayload::OrderFullyPaid).await?;
                pending.fully_paid = true;
            }
            Ok((self.payment_result(&txn, order, outcome).await?, pending))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        self.notify(order_id, pending).await;
        Ok(result)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_void(
        &self,
        actor: Actor,
        order_id: Uuid,
    ) -> Result<OrderPaymentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = self.payable_order(&txn, order_id).await?;
            let payment = self.active_payment(&txn, order.id).await?;
            let outcome = self.payments.void(&txn, payment.id).await?;
            record_payment_outcome(&txn, order.id, actor, &outcome).await?;
            self.payment_result(&txn, order, outcome).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_refund(
        &self,
        actor: Actor,
        order_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<OrderPaymentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = self.payable_order(&txn, order_id).await?;
            let payment = self.active_payment(&txn, order.id).await?;
            let outcome = self.payments.refund(&txn, payment.id, amount).await?;
            record_payment_outcome(&txn, order.id, actor, &outcome).await?;
            let order = sync_total_charged(&txn, order).await?;
            let refunded = outcome.is_success().then_some(outcome.transaction.amount);
            Ok((self.payment_result(&txn, order, outcome).await?, refunded))
        }
        .await;
        let (result, refunded) = db::finish(txn, result).await?;
        self.notify(
            order_id,
            Pending {
                refunded,
                ..Default::default()
            },
        )
        .await;
        Ok(result)
    }

    async fn payment_result<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        outcome: TransactionOutcome,
    ) -> Result<OrderPaymentResult, ServiceError> {
        Ok(OrderPaymentResult {
            order: load_details(conn, order).await?,
            transaction: outcome.transaction,
            error: outcome.error,
        })
    }

    // -- notes --------------------------------------------------------------

    #[instrument(skip(self, message), fields(order_id = %order_id))]
    pub async fn add_note(
        &self,
        actor: Actor,
        order_id: Uuid,
        message: String,
    ) -> Result<OrderEventRecord, ServiceError> {
        let message = message.trim().to_string();
        if message.is_empty() {
            return Err(ServiceError::invalid_field("message", "Message can't be empty"));
        }
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            let payload = OrderEventPayload::NoteAdded { message };
            let event = order_events::append(&txn, order.id, actor, payload.clone()).await?;
            Ok(OrderEventRecord {
                id: event.id,
                order_id: event.order_id,
                date: event.date,
                actor,
                payload,
            })
        }
        .await;
        db::finish(txn, result).await
    }
}
