//! Fulfillments: shipping order lines out of warehouses, approving,
//! canceling, refunding and returning them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::fulfillment::{self, FulfillmentStatus};
use crate::entities::order::{self, OrderOrigin, OrderStatus};
use crate::entities::{
    fulfillment_line, gift_card, order_line, product_variant, stock, warehouse,
};
use crate::errors::ServiceError;
use crate::events::Notifier;
use crate::services::order_events::{self, Actor, EventLine, OrderEventPayload};
use crate::services::orders::{
    load_channel, load_details, load_order, new_order, next_order_number, order_lines,
    recalculate_order, record_payment_outcome, refresh_status, sync_total_charged,
    FulfillmentDetails, OrderDetails,
};
use crate::services::payments::PaymentEngine;
use crate::services::pricing::{round_money, PricingProvider};
use crate::services::stock_ledger;
use crate::services::EngineSettings;

lazy_static! {
    static ref FULFILLMENTS_CREATED: IntCounter = IntCounter::new(
        "fulfillments_created_total",
        "Total number of fulfillments created"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillStock {
    pub warehouse_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillLine {
    pub order_line_id: Uuid,
    pub stocks: Vec<FulfillStock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillInput {
    pub lines: Vec<FulfillLine>,
    #[serde(default)]
    pub notify_customer: bool,
    #[serde(default)]
    pub allow_stock_to_be_exceeded: bool,
    /// Overrides the configured auto-approval.
    pub approved: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderLineQuantity {
    pub order_line_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FulfillmentLineQuantity {
    pub fulfillment_line_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundProductsInput {
    #[serde(default)]
    pub order_lines: Vec<OrderLineQuantity>,
    #[serde(default)]
    pub fulfillment_lines: Vec<FulfillmentLineQuantity>,
    pub amount_to_refund: Option<Decimal>,
    #[serde(default)]
    pub include_shipping_costs: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnProductsInput {
    #[serde(default)]
    pub order_lines: Vec<OrderLineQuantity>,
    #[serde(default)]
    pub fulfillment_lines: Vec<FulfillmentLineQuantity>,
    #[serde(default)]
    pub refund: bool,
    pub amount_to_refund: Option<Decimal>,
    #[serde(default)]
    pub include_shipping_costs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentResult {
    pub order: OrderDetails,
    pub fulfillments: Vec<FulfillmentDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnResult {
    pub order: OrderDetails,
    pub fulfillments: Vec<FulfillmentDetails>,
    pub replace_order: Option<OrderDetails>,
}

/// One unit of work against an order line: where it came from and how much.
#[derive(Debug, Clone)]
struct Movement {
    line: order_line::Model,
    quantity: i32,
    /// Source fulfillment line, `None` for unfulfilled quantity.
    source: Option<fulfillment_line::Model>,
    replace: bool,
}

#[derive(Debug, Default)]
struct Pending {
    created: Vec<(Uuid, bool)>,
    approved: Vec<(Uuid, bool)>,
    canceled: Vec<Uuid>,
    refunded: Option<Decimal>,
    returned: bool,
    fulfilled: bool,
}

fn invalid_status(fulfillment: &fulfillment::Model, action: &str) -> ServiceError {
    ServiceError::InvalidOperation(format!(
        "Cannot {action} a fulfillment that is {}",
        fulfillment.status
    ))
}

async fn load_fulfillment<C: ConnectionTrait>(
    conn: &C,
    fulfillment_id: Uuid,
) -> Result<fulfillment::Model, ServiceError> {
    fulfillment::Entity::find_by_id(fulfillment_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Fulfillment", fulfillment_id))
}

async fn fulfillment_lines<C: ConnectionTrait>(
    conn: &C,
    fulfillment_id: Uuid,
) -> Result<Vec<fulfillment_line::Model>, ServiceError> {
    Ok(fulfillment_line::Entity::find()
        .filter(fulfillment_line::Column::FulfillmentId.eq(fulfillment_id))
        .all(conn)
        .await?)
}

async fn next_fulfillment_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<i32, ServiceError> {
    let max: Option<Option<i32>> = fulfillment::Entity::find()
        .select_only()
        .column_as(fulfillment::Column::FulfillmentOrder.max(), "max")
        .filter(fulfillment::Column::OrderId.eq(order_id))
        .into_tuple::<Option<i32>>()
        .one(conn)
        .await?;
    Ok(max.flatten().unwrap_or(0) + 1)
}

async fn insert_fulfillment<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: FulfillmentStatus,
    warehouse_id: Option<Uuid>,
) -> Result<fulfillment::Model, ServiceError> {
    let fulfillment_order = next_fulfillment_order(conn, order_id).await?;
    Ok(fulfillment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        fulfillment_order: Set(fulfillment_order),
        status: Set(status),
        warehouse_id: Set(warehouse_id),
        tracking_number: Set(String::new()),
        shipping_refund_amount: Set(None),
        total_refund_amount: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}

async fn insert_line<C: ConnectionTrait>(
    conn: &C,
    fulfillment_id: Uuid,
    order_line_id: Uuid,
    stock_id: Option<Uuid>,
    quantity: i32,
) -> Result<fulfillment_line::Model, ServiceError> {
    Ok(fulfillment_line::ActiveModel {
        id: Set(Uuid::new_v4()),
        fulfillment_id: Set(fulfillment_id),
        order_line_id: Set(order_line_id),
        stock_id: Set(stock_id),
        quantity: Set(quantity),
    }
    .insert(conn)
    .await?)
}

/// Moves `delta` units of a line between unfulfilled and processed.
///
/// The bounds are re-checked by the update itself, so concurrent callers can
/// never push `quantity_fulfilled` past `quantity` or below zero.
async fn shift_fulfilled<C: ConnectionTrait>(
    conn: &C,
    line: &order_line::Model,
    delta: i32,
) -> Result<(), ServiceError> {
    let bound = if delta >= 0 {
        Expr::expr(Expr::col(order_line::Column::QuantityFulfilled).add(delta))
            .lte(Expr::col(order_line::Column::Quantity))
    } else {
        Expr::expr(Expr::col(order_line::Column::QuantityFulfilled).add(delta)).gte(0)
    };
    let result = order_line::Entity::update_many()
        .col_expr(
            order_line::Column::QuantityFulfilled,
            Expr::col(order_line::Column::QuantityFulfilled).add(delta),
        )
        .filter(order_line::Column::Id.eq(line.id))
        .filter(bound)
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        let fresh = order_line::Entity::find_by_id(line.id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order line", line.id))?;
        return Err(ServiceError::invalid_field(
            "order_line_id",
            format!(
                "Only {} items of {} can be fulfilled",
                fresh.quantity_unfulfilled(),
                line.product_name
            ),
        ));
    }
    Ok(())
}

/// Issues one gift card per shipped unit of a gift card line.
async fn issue_gift_cards<C: ConnectionTrait>(
    conn: &C,
    line: &order_line::Model,
    quantity: i32,
) -> Result<(), ServiceError> {
    if !line.is_gift_card {
        return Ok(());
    }
    for _ in 0..quantity {
        let code = Uuid::new_v4().simple().to_string()[..16].to_ascii_uppercase();
        gift_card::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code),
            bought_in_order_id: Set(Some(line.order_id)),
            initial_balance: Set(line.unit_price_gross),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
    }
    info!(order_line_id = %line.id, quantity, "gift cards issued");
    Ok(())
}

fn processable(order: &order::Model) -> Result<(), ServiceError> {
    if matches!(
        order.status,
        OrderStatus::Draft | OrderStatus::Unconfirmed | OrderStatus::Canceled
    ) {
        return Err(ServiceError::InvalidOrderStatusForAction(format!(
            "Cannot process lines of an order that is {}",
            order.status
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct FulfillmentService {
    db: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
    pricing: Arc<dyn PricingProvider>,
    payments: PaymentEngine,
    settings: EngineSettings,
}

impl FulfillmentService {
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

    async fn notify(&self, order_id: Uuid, pending: Pending) {
        for (fulfillment_id, notify_customer) in pending.created {
            self.notifier
                .fulfillment_created(order_id, fulfillment_id, notify_customer)
                .await;
        }
        for (fulfillment_id, notify_customer) in pending.approved {
            self.notifier
                .fulfillment_approved(order_id, fulfillment_id, notify_customer)
                .await;
        }
        for fulfillment_id in pending.canceled {
            self.notifier.fulfillment_canceled(order_id, fulfillment_id).await;
        }
        if pending.fulfilled {
            self.notifier.order_fulfilled(order_id).await;
        }
        if let Some(amount) = pending.refunded {
            self.notifier.order_refunded(order_id, amount).await;
        }
        if pending.returned {
            self.notifier.order_returned(order_id).await;
        }
    }

    fn ensure_paid(&self, order: &order::Model) -> Result<(), ServiceError> {
        if !self.settings.fulfillment_allow_unpaid && !order.is_fully_paid() {
            return Err(ServiceError::InvalidOperation(
                "Cannot fulfill an unpaid order".into(),
            ));
        }
        Ok(())
    }

    /// Takes the shipped units of an approved fulfillment out of stock.
    async fn consume_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        fulfillment: &fulfillment::Model,
        lines: &[(order_line::Model, i32)],
        allow_stock_to_be_exceeded: bool,
    ) -> Result<(), ServiceError> {
        let warehouse_id = fulfillment.warehouse_id.ok_or_else(|| {
            ServiceError::InternalError(format!("fulfillment {} has no warehouse", fulfillment.id))
        })?;
        for (line, quantity) in lines {
            if let Some(variant_id) = line.variant_id {
                stock_ledger::decrease_stock(
                    conn,
                    line.id,
                    variant_id,
                    warehouse_id,
                    *quantity,
                    allow_stock_to_be_exceeded,
                )
                .await?;
            }
            issue_gift_cards(conn, line, *quantity).await?;
        }
        Ok(())
    }

    /// Ships order lines, one fulfillment per warehouse.
    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn create_fulfillments(
        &self,
        actor: Actor,
        order_id: Uuid,
        input: FulfillInput,
    ) -> Result<FulfillmentResult, ServiceError> {
        let mut requested: Vec<(Uuid, Uuid, i32)> = Vec::new();
        for line in &input.lines {
            for stock in &line.stocks {
                if stock.quantity < 0 {
                    return Err(ServiceError::invalid_field("quantity", "Quantity cannot be negative"));
                }
                if stock.quantity > 0 {
                    requested.push((stock.warehouse_id, line.order_line_id, stock.quantity));
                }
            }
        }
        if requested.is_empty() {
            return Err(ServiceError::invalid_field(
                "lines",
                "Total quantity must be larger than 0",
            ));
        }
        let approved = input.approved.unwrap_or(self.settings.fulfillment_auto_approve);

        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if !order.status.is_fulfillable() {
                return Err(ServiceError::InvalidOrderStatusForAction(format!(
                    "Cannot fulfill an order that is {}",
                    order.status
                )));
            }
            self.ensure_paid(&order)?;

            let lines: HashMap<Uuid, order_line::Model> = order_lines(&txn, order.id)
                .await?
                .into_iter()
                .map(|line| (line.id, line))
                .collect();
            let mut totals: HashMap<Uuid, i32> = HashMap::new();
            for (_, line_id, quantity) in &requested {
                let line = lines.get(line_id).ok_or_else(|| {
                    ServiceError::invalid_field("order_line_id", format!("Line {line_id} is not part of this order"))
                })?;
                if let Some(variant_id) = line.variant_id {
                    let variant = product_variant::Entity::find_by_id(variant_id).one(&txn).await?;
                    if variant.map_or(false, |variant| variant.is_preorder_active(Utc::now())) {
                        return Err(ServiceError::invalid_field(
                            "order_line_id",
                            "Can not fulfill preorder variant",
                        ));
                    }
                }
                *totals.entry(*line_id).or_default() += quantity;
            }
            for (line_id, total) in &totals {
                let line = &lines[line_id];
                if *total > line.quantity_unfulfilled() {
                    return Err(ServiceError::invalid_field(
                        "order_line_id",
                        format!(
                            "Only {} items of {} can be fulfilled",
                            line.quantity_unfulfilled(),
                            line.product_name
                        ),
                    ));
                }
            }

            let mut warehouses: Vec<Uuid> = Vec::new();
            for (warehouse_id, _, _) in &requested {
                if !warehouses.contains(warehouse_id) {
                    warehouses.push(*warehouse_id);
                }
            }

            let status = if approved {
                FulfillmentStatus::Fulfilled
            } else {
                FulfillmentStatus::WaitingForApproval
            };
            let mut created = Vec::with_capacity(warehouses.len());
            for warehouse_id in warehouses {
                warehouse::Entity::find_by_id(warehouse_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| ServiceError::invalid_field("warehouse_id", "Warehouse does not exist"))?;
                let fulfillment = insert_fulfillment(&txn, order.id, status, Some(warehouse_id)).await?;

                let mut shipped = Vec::new();
                let mut event_lines = Vec::new();
                let mut new_lines = Vec::new();
                for (_, line_id, quantity) in requested.iter().filter(|(w, _, _)| *w == warehouse_id) {
                    let line = &lines[line_id];
                    let stock_id = match line.variant_id {
                        Some(variant_id) => stock::Entity::find()
                            .filter(stock::Column::WarehouseId.eq(warehouse_id))
                            .filter(stock::Column::VariantId.eq(variant_id))
                            .one(&txn)
                            .await?
                            .map(|stock| stock.id),
                        None => None,
                    };
                    shift_fulfilled(&txn, line, *quantity).await?;
                    new_lines.push(insert_line(&txn, fulfillment.id, line.id, stock_id, *quantity).await?);
                    event_lines.push(EventLine::new(line, *quantity));
                    shipped.push((line.clone(), *quantity));
                }

                let payload = if approved {
                    self.consume_stock(&txn, &fulfillment, &shipped, input.allow_stock_to_be_exceeded)
                        .await?;
                    OrderEventPayload::FulfillmentFulfilledItems {
                        fulfillment_id: fulfillment.id,
                        lines: event_lines,
                    }
                } else {
                    OrderEventPayload::FulfillmentAwaitsApproval {
                        fulfillment_id: fulfillment.id,
                        lines: event_lines,
                    }
                };
                order_events::append(&txn, order.id, actor, payload).await?;
                created.push(FulfillmentDetails {
                    fulfillment,
                    lines: new_lines,
                });
            }

            let order = refresh_status(&txn, order).await?;
            let pending = Pending {
                created: created
                    .iter()
                    .map(|details| (details.fulfillment.id, input.notify_customer))
                    .collect(),
                fulfilled: order.status == OrderStatus::Fulfilled,
                ..Default::default()
            };
            Ok((
                FulfillmentResult {
                    order: load_details(&txn, order).await?,
                    fulfillments: created,
                },
                pending,
            ))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        FULFILLMENTS_CREATED.inc_by(result.fulfillments.len() as u64);
        info!(order_id = %order_id, fulfillments = result.fulfillments.len(), "order fulfilled");
        self.notify(order_id, pending).await;
        Ok(result)
    }

    /// Approves a fulfillment waiting for approval. Approving a fulfilled one
    /// changes nothing.
    #[instrument(skip(self), fields(fulfillment_id = %fulfillment_id))]
    pub async fn approve(
        &self,
        actor: Actor,
        fulfillment_id: Uuid,
        allow_stock_to_be_exceeded: bool,
        notify_customer: bool,
    ) -> Result<FulfillmentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let fulfillment = load_fulfillment(&txn, fulfillment_id).await?;
            let order = load_order(&txn, fulfillment.order_id).await?;
            let lines = fulfillment_lines(&txn, fulfillment.id).await?;
            if fulfillment.status == FulfillmentStatus::Fulfilled {
                let details = FulfillmentDetails { fulfillment, lines };
                return Ok((
                    FulfillmentResult {
                        order: load_details(&txn, order).await?,
                        fulfillments: vec![details],
                    },
                    Pending::default(),
                ));
            }
            if fulfillment.status != FulfillmentStatus::WaitingForApproval {
                return Err(invalid_status(&fulfillment, "approve"));
            }
            processable(&order)?;
            self.ensure_paid(&order)?;

            let mut shipped = Vec::with_capacity(lines.len());
            for line in &lines {
                let order_line = order_line::Entity::find_by_id(line.order_line_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Order line", line.order_line_id))?;
                shipped.push((order_line, line.quantity));
            }
            self.consume_stock(&txn, &fulfillment, &shipped, allow_stock_to_be_exceeded)
                .await?;

            let mut active: fulfillment::ActiveModel = fulfillment.into();
            active.status = Set(FulfillmentStatus::Fulfilled);
            let fulfillment = active.update(&txn).await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::FulfillmentApproved {
                    fulfillment_id: fulfillment.id,
                },
            )
            .await?;

            let order = refresh_status(&txn, order).await?;
            let pending = Pending {
                approved: vec![(fulfillment.id, notify_customer)],
                fulfilled: order.status == OrderStatus::Fulfilled,
                ..Default::default()
            };
            Ok((
                FulfillmentResult {
                    order: load_details(&txn, order).await?,
                    fulfillments: vec![FulfillmentDetails { fulfillment, lines }],
                },
                pending,
            ))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        info!(fulfillment_id = %fulfillment_id, "fulfillment approved");
        self.notify(result.order.order.id, pending).await;
        Ok(result)
    }

    /// Cancels a fulfillment.
    ///
    /// Lines of a fulfillment waiting for approval simply become unfulfilled
    /// again. A fulfilled one is restocked into `warehouse_id`, which is then
    /// required, and the units are allocated back to their lines.
    #[instrument(skip(self), fields(fulfillment_id = %fulfillment_id))]
    pub async fn cancel(
        &self,
        actor: Actor,
        fulfillment_id: Uuid,
        warehouse_id: Option<Uuid>,
    ) -> Result<FulfillmentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let fulfillment = load_fulfillment(&txn, fulfillment_id).await?;
            let order = load_order(&txn, fulfillment.order_id).await?;
            let lines = fulfillment_lines(&txn, fulfillment.id).await?;

            let restock_into = match fulfillment.status {
                FulfillmentStatus::WaitingForApproval => None,
                FulfillmentStatus::Fulfilled => {
                    let warehouse_id = warehouse_id.ok_or_else(|| {
                        ServiceError::DeliveryMethodNotApplicable {
                            field: "warehouse".into(),
                            message: "A warehouse is required to restock a fulfilled fulfillment".into(),
                        }
                    })?;
                    warehouse::Entity::find_by_id(warehouse_id)
                        .one(&txn)
                        .await?
                        .ok_or_else(|| ServiceError::invalid_field("warehouse", "Warehouse does not exist"))?;
                    Some(warehouse_id)
                }
                _ => return Err(invalid_status(&fulfillment, "cancel")),
            };

            let mut restocked = 0;
            for line in &lines {
                let order_line = order_line::Entity::find_by_id(line.order_line_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Order line", line.order_line_id))?;
                shift_fulfilled(&txn, &order_line, -line.quantity).await?;
                if let (Some(warehouse_id), Some(variant_id)) = (restock_into, order_line.variant_id) {
                    stock_ledger::increase_stock(
                        &txn,
                        variant_id,
                        warehouse_id,
                        line.quantity,
                        Some(order_line.id),
                    )
                    .await?;
                    restocked += line.quantity;
                }
            }

            let mut active: fulfillment::ActiveModel = fulfillment.into();
            active.status = Set(FulfillmentStatus::Canceled);
            let fulfillment = active.update(&txn).await?;

            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::FulfillmentCanceled {
                    fulfillment_id: fulfillment.id,
                    warehouse_id: restock_into,
                },
            )
            .await?;
            if let Some(warehouse_id) = restock_into {
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::FulfillmentRestockedItems {
                        warehouse_id,
                        quantity: restocked,
                    },
                )
                .await?;
            }

            let order = refresh_status(&txn, order).await?;
            let pending = Pending {
                canceled: vec![fulfillment.id],
                ..Default::default()
            };
            Ok((
                FulfillmentResult {
                    order: load_details(&txn, order).await?,
                    fulfillments: vec![FulfillmentDetails { fulfillment, lines }],
                },
                pending,
            ))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        info!(fulfillment_id = %fulfillment_id, "fulfillment canceled");
        self.notify(result.order.order.id, pending).await;
        Ok(result)
    }

    #[instrument(skip(self, tracking_number), fields(fulfillment_id = %fulfillment_id))]
    pub async fn update_tracking(
        &self,
        actor: Actor,
        fulfillment_id: Uuid,
        tracking_number: String,
    ) -> Result<FulfillmentDetails, ServiceError> {
        let tracking_number = tracking_number.trim().to_string();
        if tracking_number.len() > 255 {
            return Err(ServiceError::invalid_field("tracking_number", "Tracking number is too long"));
        }
        let txn = self.db.begin().await?;
        let result = async {
            let fulfillment = load_fulfillment(&txn, fulfillment_id).await?;
            if fulfillment.status == FulfillmentStatus::Canceled {
                return Err(invalid_status(&fulfillment, "track"));
            }
            let mut active: fulfillment::ActiveModel = fulfillment.into();
            active.tracking_number = Set(tracking_number.clone());
            let fulfillment = active.update(&txn).await?;
            order_events::append(
                &txn,
                fulfillment.order_id,
                actor,
                OrderEventPayload::TrackingUpdated {
                    fulfillment_id: fulfillment.id,
                    tracking_number,
                },
            )
            .await?;
            let lines = fulfillment_lines(&txn, fulfillment.id).await?;
            Ok(FulfillmentDetails { fulfillment, lines })
        }
        .await;
        db::finish(txn, result).await
    }

    /// Resolves and validates the lines a refund or return acts on.
    async fn movements<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &order::Model,
        order_lines_input: &[OrderLineQuantity],
        fulfillment_lines_input: &[FulfillmentLineQuantity],
    ) -> Result<Vec<Movement>, ServiceError> {
        let lines: HashMap<Uuid, order_line::Model> = order_lines(conn, order.id)
            .await?
            .into_iter()
            .map(|line| (line.id, line))
            .collect();

        let mut requested_unfulfilled: HashMap<Uuid, i32> = HashMap::new();
        let mut movements = Vec::new();
        for input in order_lines_input {
            if input.quantity <= 0 {
                return Err(ServiceError::invalid_field("quantity", "Quantity must be greater than zero"));
            }
            let line = lines.get(&input.order_line_id).ok_or_else(|| {
                ServiceError::invalid_field("order_line_id", "Line is not part of this order")
            })?;
            let total = requested_unfulfilled.entry(line.id).or_default();
            *total += input.quantity;
            if *total > line.quantity_unfulfilled() {
                return Err(ServiceError::invalid_field(
                    "order_line_id",
                    format!(
                        "Only {} unfulfilled items of {} can be processed",
                        line.quantity_unfulfilled(),
                        line.product_name
                    ),
                ));
            }
            movements.push(Movement {
                line: line.clone(),
                quantity: input.quantity,
                source: None,
                replace: input.replace,
            });
        }

        let mut requested_fulfilled: HashMap<Uuid, i32> = HashMap::new();
        for input in fulfillment_lines_input {
            if input.quantity <= 0 {
                return Err(ServiceError::invalid_field("quantity", "Quantity must be greater than zero"));
            }
            let source = fulfillment_line::Entity::find_by_id(input.fulfillment_line_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::not_found("Fulfillment line", input.fulfillment_line_id))?;
            let fulfillment = load_fulfillment(conn, source.fulfillment_id).await?;
            if fulfillment.order_id != order.id {
                return Err(ServiceError::invalid_field(
                    "fulfillment_line_id",
                    "Fulfillment line is not part of this order",
                ));
            }
            if fulfillment.status != FulfillmentStatus::Fulfilled {
                return Err(ServiceError::invalid_field(
                    "fulfillment_line_id",
                    format!("Cannot process lines of a fulfillment that is {}", fulfillment.status),
                ));
            }
            let total = requested_fulfilled.entry(source.id).or_default();
            *total += input.quantity;
            if *total > source.quantity {
                return Err(ServiceError::invalid_field(
                    "fulfillment_line_id",
                    format!("Only {} items can be processed", source.quantity),
                ));
            }
            let line = lines.get(&source.order_line_id).ok_or_else(|| {
                ServiceError::invalid_field("fulfillment_line_id", "Line is not part of this order")
            })?;
            movements.push(Movement {
                line: line.clone(),
                quantity: input.quantity,
                source: Some(source),
                replace: input.replace,
            });
        }

        if movements.is_empty() {
            return Err(ServiceError::invalid_field("lines", "At least one line is required"));
        }
        Ok(movements)
    }

    /// Takes the units of a movement out of where they currently are and
    /// records them on `target`.
    async fn apply_movement<C: ConnectionTrait>(
        &self,
        conn: &C,
        target: &fulfillment::Model,
        movement: &Movement,
        restock: bool,
    ) -> Result<fulfillment_line::Model, ServiceError> {
        let stock_id = match &movement.source {
            None => {
                shift_fulfilled(conn, &movement.line, movement.quantity).await?;
                stock_ledger::release(conn, movement.line.id, movement.quantity).await?;
                None
            }
            Some(source) => {
                let fulfillment_id = source.fulfillment_id;
                let stock_id = source.stock_id;
                // Re-read: several movements may draw from the same source line.
                let fresh = fulfillment_line::Entity::find_by_id(source.id)
                    .one(conn)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Fulfillment line", source.id))?;
                let remaining = fresh.quantity - movement.quantity;
                if remaining < 0 {
                    return Err(ServiceError::invalid_field(
                        "fulfillment_line_id",
                        format!("Only {} items can be processed", fresh.quantity),
                    ));
                }
                if remaining == 0 {
                    fresh.delete(conn).await?;
                    let left = fulfillment_lines(conn, fulfillment_id).await?;
                    if left.is_empty() {
                        load_fulfillment(conn, fulfillment_id).await?.delete(conn).await?;
                    }
                } else {
                    let mut active: fulfillment_line::ActiveModel = fresh.into();
                    active.quantity = Set(remaining);
                    active.update(conn).await?;
                }

                if restock {
                    if let (Some(stock_id), Some(variant_id)) = (stock_id, movement.line.variant_id) {
                        if let Some(stock) = stock::Entity::find_by_id(stock_id).one(conn).await? {
                            stock_ledger::increase_stock(
                                conn,
                                variant_id,
                                stock.warehouse_id,
                                movement.quantity,
                                None,
                            )
                            .await?;
                        }
                    }
                }
                stock_id
            }
        };
        insert_line(conn, target.id, movement.line.id, stock_id, movement.quantity).await
    }

    /// Refunds `amount` against the order's active payment. Returns what was
    /// actually refunded.
    async fn refund_payment<C: ConnectionTrait>(
        &self,
        conn: &C,
        actor: Actor,
        order: &order::Model,
        amount: Decimal,
    ) -> Result<Decimal, ServiceError> {
        let Some(payment) = self.payments.active_for_order(conn, order.id).await? else {
            return Ok(Decimal::ZERO);
        };
        if !payment.can_refund() {
            return Ok(Decimal::ZERO);
        }
        let amount = amount.min(payment.captured_amount);
        if amount <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let outcome = self.payments.refund(conn, payment.id, Some(amount)).await?;
        record_payment_outcome(conn, order.id, actor, &outcome).await?;
        if let Some(error) = outcome.error {
            warn!(order_id = %order.id, error = %error, "refund failed at the gateway");
            return Err(ServiceError::Payment(error));
        }
        Ok(outcome.transaction.amount)
    }

    fn refund_amount(
        order: &order::Model,
        movements: &[&Movement],
        amount_to_refund: Option<Decimal>,
        include_shipping_costs: bool,
    ) -> Result<(Decimal, Option<Decimal>), ServiceError> {
        if let Some(amount) = amount_to_refund {
            if amount < Decimal::ZERO {
                return Err(ServiceError::invalid_field("amount_to_refund", "Amount cannot be negative"));
            }
            return Ok((round_money(amount), None));
        }
        let lines: Decimal = movements
            .iter()
            .map(|movement| movement.line.unit_price_gross * Decimal::from(movement.quantity))
            .sum();
        let shipping = include_shipping_costs.then_some(order.shipping_price_gross);
        Ok((round_money(lines + shipping.unwrap_or_default()), shipping))
    }

    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn refund_products(
        &self,
        actor: Actor,
        order_id: Uuid,
        input: RefundProductsInput,
    ) -> Result<FulfillmentResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            processable(&order)?;
            let movements = self
                .movements(&txn, &order, &input.order_lines, &input.fulfillment_lines)
                .await?;
            let all: Vec<&Movement> = movements.iter().collect();
            let (amount, shipping) =
                Self::refund_amount(&order, &all, input.amount_to_refund, input.include_shipping_costs)?;

            let refunded = self.refund_payment(&txn, actor, &order, amount).await?;
            let fulfillment = insert_fulfillment(&txn, order.id, FulfillmentStatus::Refunded, None).await?;
            let mut lines = Vec::with_capacity(movements.len());
            for movement in &movements {
                lines.push(self.apply_movement(&txn, &fulfillment, movement, false).await?);
            }
            let mut active: fulfillment::ActiveModel = fulfillment.into();
            active.total_refund_amount = Set(Some(refunded));
            active.shipping_refund_amount = Set(shipping);
            let fulfillment = active.update(&txn).await?;

            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::FulfillmentRefunded {
                    amount: refunded,
                    shipping_costs_included: input.include_shipping_costs,
                    lines: movements
                        .iter()
                        .map(|movement| EventLine::new(&movement.line, movement.quantity))
                        .collect(),
                },
            )
            .await?;

            let order = sync_total_charged(&txn, order).await?;
            let order = refresh_status(&txn, order).await?;
            let pending = Pending {
                refunded: (refunded > Decimal::ZERO).then_some(refunded),
                ..Default::default()
            };
            Ok((
                FulfillmentResult {
                    order: load_details(&txn, order).await?,
                    fulfillments: vec![FulfillmentDetails { fulfillment, lines }],
                },
                pending,
            ))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        info!(order_id = %order_id, "order lines refunded");
        self.notify(order_id, pending).await;
        Ok(result)
    }

    /// Returns lines, optionally refunding them and reissuing replacements
    /// as a new draft order.
    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn return_products(
        &self,
        actor: Actor,
        order_id: Uuid,
        input: ReturnProductsInput,
    ) -> Result<ReturnResult, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            processable(&order)?;
            let movements = self
                .movements(&txn, &order, &input.order_lines, &input.fulfillment_lines)
                .await?;
            let (replaced, returned): (Vec<&Movement>, Vec<&Movement>) =
                movements.iter().partition(|movement| movement.replace);

            let mut refunded = Decimal::ZERO;
            let mut shipping = None;
            if input.refund && !returned.is_empty() {
                let (amount, shipping_part) = Self::refund_amount(
                    &order,
                    &returned,
                    input.amount_to_refund,
                    input.include_shipping_costs,
                )?;
                refunded = self.refund_payment(&txn, actor, &order, amount).await?;
                shipping = shipping_part;
            }

            let mut created = Vec::new();
            if !returned.is_empty() {
                let status = if refunded > Decimal::ZERO {
                    FulfillmentStatus::RefundedAndReturned
                } else {
                    FulfillmentStatus::Returned
                };
                let fulfillment = insert_fulfillment(&txn, order.id, status, None).await?;
                let mut lines = Vec::with_capacity(returned.len());
                for movement in &returned {
                    lines.push(self.apply_movement(&txn, &fulfillment, movement, true).await?);
                }
                let fulfillment = if refunded > Decimal::ZERO {
                    let mut active: fulfillment::ActiveModel = fulfillment.into();
                    active.total_refund_amount = Set(Some(refunded));
                    active.shipping_refund_amount = Set(shipping);
                    active.update(&txn).await?
                } else {
                    fulfillment
                };
                let event_lines: Vec<EventLine> = returned
                    .iter()
                    .map(|movement| EventLine::new(&movement.line, movement.quantity))
                    .collect();
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::FulfillmentReturned {
                        lines: event_lines.clone(),
                    },
                )
                .await?;
                if refunded > Decimal::ZERO {
                    order_events::append(
                        &txn,
                        order.id,
                        actor,
                        OrderEventPayload::FulfillmentRefunded {
                            amount: refunded,
                            shipping_costs_included: input.include_shipping_costs,
                            lines: event_lines,
                        },
                    )
                    .await?;
                }
                created.push(FulfillmentDetails { fulfillment, lines });
            }

            let mut replace_order = None;
            if !replaced.is_empty() {
                let fulfillment =
                    insert_fulfillment(&txn, order.id, FulfillmentStatus::Replaced, None).await?;
                let mut lines = Vec::with_capacity(replaced.len());
                for movement in &replaced {
                    lines.push(self.apply_movement(&txn, &fulfillment, movement, true).await?);
                }
                let event_lines: Vec<EventLine> = replaced
                    .iter()
                    .map(|movement| EventLine::new(&movement.line, movement.quantity))
                    .collect();
                order_events::append(
                    &txn,
                    order.id,
                    actor,
                    OrderEventPayload::FulfillmentReplaced {
                        lines: event_lines,
                    },
                )
                .await?;
                created.push(FulfillmentDetails { fulfillment, lines });

                let reissued = self.reissue(&txn, actor, &order, &replaced).await?;
                replace_order = Some(load_details(&txn, reissued).await?);
            }

            let order = sync_total_charged(&txn, order).await?;
            let order = refresh_status(&txn, order).await?;
            let pending = Pending {
                refunded: (refunded > Decimal::ZERO).then_some(refunded),
                returned: true,
                ..Default::default()
            };
            Ok((
                ReturnResult {
                    order: load_details(&txn, order).await?,
                    fulfillments: created,
                    replace_order,
                },
                pending,
            ))
        }
        .await;
        let (result, pending) = db::finish(txn, result).await?;
        info!(order_id = %order_id, "order lines returned");
        self.notify(order_id, pending).await;
        Ok(result)
    }

    /// Creates the draft order that replaces returned lines, at their original prices.
    async fn reissue<C: ConnectionTrait>(
        &self,
        conn: &C,
        actor: Actor,
        original: &order::Model,
        replaced: &[&Movement],
    ) -> Result<order::Model, ServiceError> {
        let channel = load_channel(conn, original.channel_id).await?;
        let number = next_order_number(conn).await?;
        let mut active = new_order(number, OrderStatus::Draft, OrderOrigin::Reissue, &channel);
        active.original_id = Set(Some(original.id));
        active.user_id = Set(original.user_id);
        active.user_email = Set(original.user_email.clone());
        active.currency = Set(original.currency.clone());
        active.shipping_address = Set(original.shipping_address.clone());
        active.billing_address = Set(original.billing_address.clone());
        active.shipping_method_id = Set(original.shipping_method_id);
        active.shipping_method_name = Set(original.shipping_method_name.clone());
        active.base_shipping_price = Set(original.base_shipping_price);
        active.collection_point_id = Set(original.collection_point_id);
        active.collection_point_name = Set(original.collection_point_name.clone());
        let order = active.insert(conn).await?;

        let mut merged: Vec<(order_line::Model, i32)> = Vec::new();
        for movement in replaced {
            match merged.iter_mut().find(|(line, _)| line.id == movement.line.id) {
                Some((_, quantity)) => *quantity += movement.quantity,
                None => merged.push((movement.line.clone(), movement.quantity)),
            }
        }

        let mut event_lines = Vec::with_capacity(merged.len());
        for (source, quantity) in merged {
            let mut line: order_line::ActiveModel = source.into();
            line.id = Set(Uuid::new_v4());
            line.order_id = Set(order.id);
            line.quantity = Set(quantity);
            line.quantity_fulfilled = Set(0);
            line.created_at = Set(Utc::now());
            let line = line.insert(conn).await?;
            event_lines.push(EventLine::new(&line, quantity));
        }

        order_events::append(
            conn,
            original.id,
            actor,
            OrderEventPayload::OrderReplacementCreated {
                related_order_id: order.id,
            },
        )
        .await?;
        order_events::append(
            conn,
            order.id,
            actor,
            OrderEventPayload::DraftCreatedFromReplace {
                related_order_id: original.id,
                lines: event_lines,
            },
        )
        .await?;

        let order = recalculate_order(conn, self.pricing.as_ref(), order).await?;
        info!(order_id = %order.id, original_id = %original.id, "replacement order created");
        Ok(order)
    }
}
