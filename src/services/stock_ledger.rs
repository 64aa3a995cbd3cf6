//! Per-warehouse stock bookkeeping.
//!
//! `stocks.quantity_allocated` always equals the sum of the allocation rows
//! pointing at the stock and is the write-time serialization point: every
//! reservation is a conditional update that only matches while
//! `quantity_allocated + q <= quantity` still holds.

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::channel::{self, AllocationStrategy};
use crate::entities::warehouse::{self, ClickAndCollectOption};
use crate::entities::{
    allocation, channel_warehouse, order_line, preorder_allocation, product_variant, stock,
    variant_channel_listing,
};
use crate::errors::ServiceError;

lazy_static! {
    static ref STOCK_RESERVATIONS: IntCounter = IntCounter::new(
        "stock_reservations_total",
        "Total number of successful stock reservations"
    )
    .expect("metric can be created");
    static ref STOCK_INSUFFICIENT: IntCounter = IntCounter::new(
        "stock_insufficient_total",
        "Total number of reservations refused for insufficient stock"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientStockItem {
    pub variant_id: Uuid,
    pub line_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub requested: i32,
    pub available: i32,
}

/// Lines that could not be covered. A data result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientStock {
    pub items: Vec<InsufficientStockItem>,
}

impl InsufficientStock {
    pub fn single(item: InsufficientStockItem) -> Self {
        Self { items: vec![item] }
    }

    pub fn line_ids(&self) -> Vec<Uuid> {
        self.items.iter().filter_map(|item| item.line_id).collect()
    }
}

/// One line to reserve or check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRequest {
    pub line_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct ReservationContext {
    pub channel_id: Uuid,
    pub country_code: String,
    pub collection_point_id: Option<Uuid>,
    pub strategy: AllocationStrategy,
}

impl ReservationContext {
    pub fn new(
        channel: &channel::Model,
        country_code: impl Into<String>,
        collection_point_id: Option<Uuid>,
    ) -> Self {
        Self {
            channel_id: channel.id,
            country_code: country_code.into(),
            collection_point_id,
            strategy: channel.allocation_strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    Allocated(Vec<allocation::Model>),
    Insufficient(InsufficientStock),
}

impl Reservation {
    /// Treats insufficient stock as a business error.
    pub fn into_result(self) -> Result<Vec<allocation::Model>, ServiceError> {
        match self {
            Reservation::Allocated(allocations) => Ok(allocations),
            Reservation::Insufficient(insufficient) => {
                Err(ServiceError::InsufficientStock(insufficient))
            }
        }
    }
}

/// A stock row a variant could be reserved from.
#[derive(Debug, Clone)]
pub struct CandidateStock {
    pub stock: stock::Model,
    pub warehouse: warehouse::Model,
    pub sort_order: i32,
}

/// Orders candidate warehouses before reservation walks them.
pub trait WarehouseRanking: Send + Sync {
    fn rank(&self, destination_country: &str, candidates: &mut [CandidateStock]);
}

/// Warehouses in the destination country first, then the channel's order.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestFirst;

impl WarehouseRanking for NearestFirst {
    fn rank(&self, destination_country: &str, candidates: &mut [CandidateStock]) {
        candidates.sort_by_key(|candidate| {
            (
                !candidate
                    .warehouse
                    .country_code
                    .eq_ignore_ascii_case(destination_country),
                candidate.sort_order,
            )
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HighestStockFirst;

impl WarehouseRanking for HighestStockFirst {
    fn rank(&self, _destination_country: &str, candidates: &mut [CandidateStock]) {
        candidates.sort_by_key(|candidate| (Reverse(candidate.stock.available()), candidate.sort_order));
    }
}

pub fn ranking_for(strategy: AllocationStrategy) -> &'static dyn WarehouseRanking {
    match strategy {
        AllocationStrategy::NearestFirst => &NearestFirst,
        AllocationStrategy::HighestStock => &HighestStockFirst,
    }
}

#[derive(Debug, Clone, Copy)]
struct StockPick {
    line_id: Uuid,
    variant_id: Uuid,
    stock_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
}

#[derive(Debug, Clone, Copy)]
struct PreorderPick {
    line_id: Uuid,
    variant_id: Uuid,
    listing_id: Uuid,
    quantity: i32,
}

#[derive(Debug, Default)]
struct Plan {
    stock: Vec<StockPick>,
    preorder: Vec<PreorderPick>,
    insufficient: Vec<InsufficientStockItem>,
}

/// Ranked candidate stocks per variant for the channel.
async fn candidate_stocks<C: ConnectionTrait>(
    conn: &C,
    ctx: &ReservationContext,
    variant_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<CandidateStock>>, ServiceError> {
    let mut by_variant: HashMap<Uuid, Vec<CandidateStock>> = HashMap::new();
    if variant_ids.is_empty() {
        return Ok(by_variant);
    }

    let links = channel_warehouse::Entity::find()
        .filter(channel_warehouse::Column::ChannelId.eq(ctx.channel_id))
        .all(conn)
        .await?;
    if links.is_empty() {
        return Ok(by_variant);
    }
    let sort_orders: HashMap<Uuid, i32> = links
        .iter()
        .map(|link| (link.warehouse_id, link.sort_order))
        .collect();
    let warehouse_ids: Vec<Uuid> = sort_orders.keys().copied().collect();

    let warehouses: HashMap<Uuid, warehouse::Model> = warehouse::Entity::find()
        .filter(warehouse::Column::Id.is_in(warehouse_ids.clone()))
        .all(conn)
        .await?
        .into_iter()
        .map(|warehouse| (warehouse.id, warehouse))
        .collect();

    let stocks = stock::Entity::find()
        .filter(stock::Column::VariantId.is_in(variant_ids.to_vec()))
        .filter(stock::Column::WarehouseId.is_in(warehouse_ids))
        .all(conn)
        .await?;

    for stock in stocks {
        let Some(warehouse) = warehouses.get(&stock.warehouse_id) else {
            continue;
        };
        by_variant
            .entry(stock.variant_id)
            .or_default()
            .push(CandidateStock {
                sort_order: sort_orders.get(&stock.warehouse_id).copied().unwrap_or(i32::MAX),
                warehouse: warehouse.clone(),
                stock,
            });
    }

    let ranking = ranking_for(ctx.strategy);
    let collection_point = ctx
        .collection_point_id
        .map(|id| (id, warehouses.get(&id).map(|w| w.click_and_collect)));
    for candidates in by_variant.values_mut() {
        ranking.rank(&ctx.country_code, candidates);
        match collection_point {
            Some((id, Some(ClickAndCollectOption::All))) => {
                candidates.sort_by_key(|candidate| candidate.warehouse.id != id);
            }
            Some((id, _)) => candidates.retain(|candidate| candidate.warehouse.id == id),
            None => {}
        }
    }

    Ok(by_variant)
}

/// Works out where every line would be taken from without writing anything.
async fn plan<C: ConnectionTrait>(
    conn: &C,
    ctx: &ReservationContext,
    lines: &[LineRequest],
) -> Result<Plan, ServiceError> {
    let mut plan = Plan::default();
    if lines.is_empty() {
        return Ok(plan);
    }

    let variant_ids: Vec<Uuid> = lines.iter().map(|line| line.variant_id).collect();
    let variants: HashMap<Uuid, product_variant::Model> = product_variant::Entity::find()
        .filter(product_variant::Column::Id.is_in(variant_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|variant| (variant.id, variant))
        .collect();

    let now = Utc::now();
    let preorder_ids: Vec<Uuid> = variants
        .values()
        .filter(|variant| variant.is_preorder_active(now))
        .map(|variant| variant.id)
        .collect();
    let stock_ids: Vec<Uuid> = variants
        .values()
        .filter(|variant| variant.track_inventory && !variant.is_preorder_active(now))
        .map(|variant| variant.id)
        .collect();

    let candidates = candidate_stocks(conn, ctx, &stock_ids).await?;
    let listings: HashMap<Uuid, variant_channel_listing::Model> = if preorder_ids.is_empty() {
        HashMap::new()
    } else {
        variant_channel_listing::Entity::find()
            .filter(variant_channel_listing::Column::VariantId.is_in(preorder_ids))
            .filter(variant_channel_listing::Column::ChannelId.eq(ctx.channel_id))
            .all(conn)
            .await?
            .into_iter()
            .map(|listing| (listing.variant_id, listing))
            .collect()
    };

    let mut used_stock: HashMap<Uuid, i32> = HashMap::new();
    let mut used_listing: HashMap<Uuid, i32> = HashMap::new();
    let mut used_global: HashMap<Uuid, i32> = HashMap::new();

    for line in lines.iter().filter(|line| line.quantity > 0) {
        let Some(variant) = variants.get(&line.variant_id) else {
            plan.insufficient.push(InsufficientStockItem {
                variant_id: line.variant_id,
                line_id: Some(line.line_id),
                warehouse_id: None,
                requested: line.quantity,
                available: 0,
            });
            continue;
        };

        if variant.is_preorder_active(now) {
            let Some(listing) = listings.get(&variant.id) else {
                plan.insufficient.push(InsufficientStockItem {
                    variant_id: variant.id,
                    line_id: Some(line.line_id),
                    warehouse_id: None,
                    requested: line.quantity,
                    available: 0,
                });
                continue;
            };
            let listing_used = used_listing.entry(listing.id).or_default();
            let global_used = used_global.entry(variant.id).or_default();
            let channel_left = listing
                .preorder_quantity_threshold
                .map(|threshold| threshold - listing.preorder_sold_units - *listing_used);
            let global_left = variant
                .preorder_global_threshold
                .map(|threshold| threshold - variant.preorder_global_sold_units - *global_used);
            let available = channel_left
                .into_iter()
                .chain(global_left)
                .min()
                .unwrap_or(i32::MAX);

            if available < line.quantity {
                plan.insufficient.push(InsufficientStockItem {
                    variant_id: variant.id,
                    line_id: Some(line.line_id),
                    warehouse_id: None,
                    requested: line.quantity,
                    available: available.max(0),
                });
            } else {
                *listing_used += line.quantity;
                *global_used += line.quantity;
                plan.preorder.push(PreorderPick {
                    line_id: line.line_id,
                    variant_id: variant.id,
                    listing_id: listing.id,
                    quantity: line.quantity,
                });
            }
            continue;
        }

        if !variant.track_inventory {
            continue;
        }

        let mut remaining = line.quantity;
        for candidate in candidates.get(&variant.id).into_iter().flatten() {
            if remaining == 0 {
                break;
            }
            let used = used_stock.entry(candidate.stock.id).or_default();
            let available = candidate.stock.available() - *used;
            if available <= 0 {
                continue;
            }
            let take = available.min(remaining);
            *used += take;
            remaining -= take;
            plan.stock.push(StockPick {
                line_id: line.line_id,
                variant_id: variant.id,
                stock_id: candidate.stock.id,
                warehouse_id: candidate.warehouse.id,
                quantity: take,
            });
        }

        if remaining > 0 {
            plan.insufficient.push(InsufficientStockItem {
                variant_id: variant.id,
                line_id: Some(line.line_id),
                warehouse_id: ctx.collection_point_id,
                requested: line.quantity,
                available: line.quantity - remaining,
            });
        }
    }

    Ok(plan)
}

/// Adds `quantity` to an allocation if the stock still has room for it.
///
/// Returns `None` when a concurrent reservation took the room first.
async fn try_allocate<C: ConnectionTrait>(
    conn: &C,
    stock_id: Uuid,
    order_line_id: Uuid,
    quantity: i32,
) -> Result<Option<allocation::Model>, ServiceError> {
    let result = stock::Entity::update_many()
        .col_expr(
            stock::Column::QuantityAllocated,
            Expr::col(stock::Column::QuantityAllocated).add(quantity),
        )
        .col_expr(stock::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock::Column::Id.eq(stock_id))
        .filter(
            Expr::expr(Expr::col(stock::Column::QuantityAllocated).add(quantity))
                .lte(Expr::col(stock::Column::Quantity)),
        )
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Ok(None);
    }

    let existing = allocation::Entity::find()
        .filter(allocation::Column::StockId.eq(stock_id))
        .filter(allocation::Column::OrderLineId.eq(order_line_id))
        .one(conn)
        .await?;

    let allocation = match existing {
        Some(existing) => {
            let quantity_allocated = existing.quantity_allocated + quantity;
            let mut active: allocation::ActiveModel = existing.into();
            active.quantity_allocated = Set(quantity_allocated);
            active.update(conn).await?
        }
        None => {
            allocation::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_line_id: Set(order_line_id),
                stock_id: Set(stock_id),
                quantity_allocated: Set(quantity),
                created_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?
        }
    };
    Ok(Some(allocation))
}

async fn consume_preorder<C: ConnectionTrait>(
    conn: &C,
    pick: PreorderPick,
) -> Result<bool, ServiceError> {
    let listing = variant_channel_listing::Entity::update_many()
        .col_expr(
            variant_channel_listing::Column::PreorderSoldUnits,
            Expr::col(variant_channel_listing::Column::PreorderSoldUnits).add(pick.quantity),
        )
        .filter(variant_channel_listing::Column::Id.eq(pick.listing_id))
        .filter(
            variant_channel_listing::Column::PreorderQuantityThreshold
                .is_null()
                .or(Expr::expr(
                    Expr::col(variant_channel_listing::Column::PreorderSoldUnits).add(pick.quantity),
                )
                .lte(Expr::col(
                    variant_channel_listing::Column::PreorderQuantityThreshold,
                ))),
        )
        .exec(conn)
        .await?;
    if listing.rows_affected == 0 {
        return Ok(false);
    }

    let global = product_variant::Entity::update_many()
        .col_expr(
            product_variant::Column::PreorderGlobalSoldUnits,
            Expr::col(product_variant::Column::PreorderGlobalSoldUnits).add(pick.quantity),
        )
        .filter(product_variant::Column::Id.eq(pick.variant_id))
        .filter(
            product_variant::Column::PreorderGlobalThreshold
                .is_null()
                .or(Expr::expr(
                    Expr::col(product_variant::Column::PreorderGlobalSoldUnits).add(pick.quantity),
                )
                .lte(Expr::col(product_variant::Column::PreorderGlobalThreshold))),
        )
        .exec(conn)
        .await?;
    if global.rows_affected == 0 {
        return Ok(false);
    }

    preorder_allocation::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_line_id: Set(pick.line_id),
        variant_channel_listing_id: Set(pick.listing_id),
        quantity: Set(pick.quantity),
    }
    .insert(conn)
    .await?;
    Ok(true)
}

/// Reserves every line or nothing.
///
/// Lines of variants that do not track inventory are skipped, preorder
/// variants are counted against their thresholds. When the plan cannot cover
/// every line nothing is written and the unmet lines are returned. A
/// conditional write that loses a race fails with
/// [`ServiceError::InsufficientStock`] so the caller's transaction rolls back.
#[instrument(skip(conn, lines), fields(channel_id = %ctx.channel_id, lines = lines.len()))]
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    ctx: &ReservationContext,
    lines: &[LineRequest],
) -> Result<Reservation, ServiceError> {
    let plan = plan(conn, ctx, lines).await?;
    if !plan.insufficient.is_empty() {
        STOCK_INSUFFICIENT.inc();
        warn!(
            unmet_lines = plan.insufficient.len(),
            "insufficient stock for reservation"
        );
        return Ok(Reservation::Insufficient(InsufficientStock {
            items: plan.insufficient,
        }));
    }

    let mut allocations = Vec::with_capacity(plan.stock.len());
    for pick in plan.stock {
        match try_allocate(conn, pick.stock_id, pick.line_id, pick.quantity).await? {
            Some(allocation) => allocations.push(allocation),
            None => {
                STOCK_INSUFFICIENT.inc();
                let available = stock::Entity::find_by_id(pick.stock_id)
                    .one(conn)
                    .await?
                    .map(|stock| stock.available())
                    .unwrap_or_default();
                warn!(stock_id = %pick.stock_id, "stock taken by a concurrent reservation");
                return Err(ServiceError::InsufficientStock(InsufficientStock::single(
                    InsufficientStockItem {
                        variant_id: pick.variant_id,
                        line_id: Some(pick.line_id),
                        warehouse_id: Some(pick.warehouse_id),
                        requested: pick.quantity,
                        available,
                    },
                )));
            }
        }
    }

    for pick in plan.preorder {
        if !consume_preorder(conn, pick).await? {
            STOCK_INSUFFICIENT.inc();
            return Err(ServiceError::InsufficientStock(InsufficientStock::single(
                InsufficientStockItem {
                    variant_id: pick.variant_id,
                    line_id: Some(pick.line_id),
                    warehouse_id: None,
                    requested: pick.quantity,
                    available: 0,
                },
            )));
        }
    }

    STOCK_RESERVATIONS.inc();
    debug!(allocations = allocations.len(), "stock reserved");
    Ok(Reservation::Allocated(allocations))
}

/// Read-only counterpart of [`reserve`].
#[instrument(skip(conn, lines), fields(channel_id = %ctx.channel_id))]
pub async fn check_availability<C: ConnectionTrait>(
    conn: &C,
    ctx: &ReservationContext,
    lines: &[LineRequest],
) -> Result<Option<InsufficientStock>, ServiceError> {
    let plan = plan(conn, ctx, lines).await?;
    Ok((!plan.insufficient.is_empty()).then_some(InsufficientStock {
        items: plan.insufficient,
    }))
}

/// Units of a variant that can still be sold in the channel.
pub async fn available_quantity<C: ConnectionTrait>(
    conn: &C,
    ctx: &ReservationContext,
    variant_id: Uuid,
) -> Result<i32, ServiceError> {
    let Some(variant) = product_variant::Entity::find_by_id(variant_id).one(conn).await? else {
        return Ok(0);
    };

    if variant.is_preorder_active(Utc::now()) {
        let listing = variant_channel_listing::Entity::find()
            .filter(variant_channel_listing::Column::VariantId.eq(variant_id))
            .filter(variant_channel_listing::Column::ChannelId.eq(ctx.channel_id))
            .one(conn)
            .await?;
        let Some(listing) = listing else {
            return Ok(0);
        };
        let channel_left = listing
            .preorder_quantity_threshold
            .map(|threshold| threshold - listing.preorder_sold_units);
        let global_left = variant
            .preorder_global_threshold
            .map(|threshold| threshold - variant.preorder_global_sold_units);
        return Ok(channel_left
            .into_iter()
            .chain(global_left)
            .min()
            .unwrap_or(i32::MAX)
            .max(0));
    }

    if !variant.track_inventory {
        return Ok(i32::MAX);
    }

    let candidates = candidate_stocks(conn, ctx, &[variant_id]).await?;
    Ok(candidates
        .get(&variant_id)
        .into_iter()
        .flatten()
        .map(|candidate| candidate.stock.available())
        .sum())
}

/// Total quantity currently allocated to an order line.
pub async fn allocated_quantity<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
) -> Result<i32, ServiceError> {
    let allocations = allocation::Entity::find()
        .filter(allocation::Column::OrderLineId.eq(order_line_id))
        .all(conn)
        .await?;
    let preorders = preorder_allocation::Entity::find()
        .filter(preorder_allocation::Column::OrderLineId.eq(order_line_id))
        .all(conn)
        .await?;
    Ok(allocations.iter().map(|a| a.quantity_allocated).sum::<i32>()
        + preorders.iter().map(|p| p.quantity).sum::<i32>())
}

async fn decrement_allocated<C: ConnectionTrait>(
    conn: &C,
    stock_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let result = stock::Entity::update_many()
        .col_expr(
            stock::Column::QuantityAllocated,
            Expr::col(stock::Column::QuantityAllocated).sub(quantity),
        )
        .col_expr(stock::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock::Column::Id.eq(stock_id))
        .filter(stock::Column::QuantityAllocated.gte(quantity))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        warn!(stock_id = %stock_id, quantity, "allocated counter below released quantity");
    }
    Ok(())
}

/// Releases up to `quantity` from a line, starting with `prefer_stock`.
async fn deallocate<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
    quantity: i32,
    prefer_stock: Option<Uuid>,
) -> Result<i32, ServiceError> {
    if quantity <= 0 {
        return Ok(0);
    }

    let mut allocations = allocation::Entity::find()
        .filter(allocation::Column::OrderLineId.eq(order_line_id))
        .order_by_asc(allocation::Column::CreatedAt)
        .all(conn)
        .await?;
    if let Some(preferred) = prefer_stock {
        allocations.sort_by_key(|allocation| allocation.stock_id != preferred);
    }

    let mut remaining = quantity;
    for allocation in allocations {
        if remaining == 0 {
            break;
        }
        let take = allocation.quantity_allocated.min(remaining);
        if take <= 0 {
            continue;
        }
        decrement_allocated(conn, allocation.stock_id, take).await?;
        if take == allocation.quantity_allocated {
            allocation.delete(conn).await?;
        } else {
            let left = allocation.quantity_allocated - take;
            let mut active: allocation::ActiveModel = allocation.into();
            active.quantity_allocated = Set(left);
            active.update(conn).await?;
        }
        remaining -= take;
    }

    if remaining > 0 {
        remaining -= release_preorder(conn, order_line_id, remaining).await?;
    }

    Ok(quantity - remaining)
}

async fn release_preorder<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
    quantity: i32,
) -> Result<i32, ServiceError> {
    let rows = preorder_allocation::Entity::find()
        .filter(preorder_allocation::Column::OrderLineId.eq(order_line_id))
        .all(conn)
        .await?;

    let mut released = 0;
    for row in rows {
        let take = row.quantity.min(quantity - released);
        if take <= 0 {
            break;
        }

        if let Some(listing) = variant_channel_listing::Entity::find_by_id(row.variant_channel_listing_id)
            .one(conn)
            .await?
        {
            variant_channel_listing::Entity::update_many()
                .col_expr(
                    variant_channel_listing::Column::PreorderSoldUnits,
                    Expr::col(variant_channel_listing::Column::PreorderSoldUnits).sub(take),
                )
                .filter(variant_channel_listing::Column::Id.eq(listing.id))
                .filter(variant_channel_listing::Column::PreorderSoldUnits.gte(take))
                .exec(conn)
                .await?;
            product_variant::Entity::update_many()
                .col_expr(
                    product_variant::Column::PreorderGlobalSoldUnits,
                    Expr::col(product_variant::Column::PreorderGlobalSoldUnits).sub(take),
                )
                .filter(product_variant::Column::Id.eq(listing.variant_id))
                .filter(product_variant::Column::PreorderGlobalSoldUnits.gte(take))
                .exec(conn)
                .await?;
        }

        if take == row.quantity {
            row.delete(conn).await?;
        } else {
            let left = row.quantity - take;
            let mut active: preorder_allocation::ActiveModel = row.into();
            active.quantity = Set(left);
            active.update(conn).await?;
        }
        released += take;
    }
    Ok(released)
}

/// Releases at most `quantity` units held by a line.
///
/// Only what is actually allocated is released, so releasing twice is a no-op.
#[instrument(skip(conn), fields(order_line_id = %order_line_id))]
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
    quantity: i32,
) -> Result<i32, ServiceError> {
    let released = deallocate(conn, order_line_id, quantity, None).await?;
    debug!(released, "released allocation");
    Ok(released)
}

/// Releases everything the order's lines hold.
#[instrument(skip(conn), fields(order_id = %order_id))]
pub async fn release_order<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<i32, ServiceError> {
    let lines = order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;

    let mut released = 0;
    for line in lines {
        released += deallocate(conn, line.id, i32::MAX, None).await?;
    }
    info!(released, "released order allocations");
    Ok(released)
}

/// Moves an allocation to the same variant's stock in another warehouse.
#[instrument(skip(conn), fields(allocation_id = %allocation_id, warehouse_id = %warehouse_id))]
pub async fn transfer<C: ConnectionTrait>(
    conn: &C,
    allocation_id: Uuid,
    warehouse_id: Uuid,
) -> Result<Reservation, ServiceError> {
    let allocation = allocation::Entity::find_by_id(allocation_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Allocation", allocation_id))?;
    let source = stock::Entity::find_by_id(allocation.stock_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Stock", allocation.stock_id))?;

    if source.warehouse_id == warehouse_id {
        return Ok(Reservation::Allocated(vec![allocation]));
    }

    let insufficient = |available: i32| {
        Reservation::Insufficient(InsufficientStock::single(InsufficientStockItem {
            variant_id: source.variant_id,
            line_id: Some(allocation.order_line_id),
            warehouse_id: Some(warehouse_id),
            requested: allocation.quantity_allocated,
            available,
        }))
    };

    let Some(target) = stock::Entity::find()
        .filter(stock::Column::WarehouseId.eq(warehouse_id))
        .filter(stock::Column::VariantId.eq(source.variant_id))
        .one(conn)
        .await?
    else {
        return Ok(insufficient(0));
    };

    let Some(moved) = try_allocate(
        conn,
        target.id,
        allocation.order_line_id,
        allocation.quantity_allocated,
    )
    .await?
    else {
        return Ok(insufficient(target.available()));
    };

    decrement_allocated(conn, source.id, allocation.quantity_allocated).await?;
    allocation.clone().delete(conn).await?;
    info!(from = %source.warehouse_id, "allocation transferred");
    Ok(Reservation::Allocated(vec![moved]))
}

async fn find_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    warehouse_id: Uuid,
) -> Result<Option<stock::Model>, ServiceError> {
    Ok(stock::Entity::find()
        .filter(stock::Column::WarehouseId.eq(warehouse_id))
        .filter(stock::Column::VariantId.eq(variant_id))
        .one(conn)
        .await?)
}

async fn reload<C: ConnectionTrait>(conn: &C, stock_id: Uuid) -> Result<stock::Model, ServiceError> {
    stock::Entity::find_by_id(stock_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Stock", stock_id))
}

/// Puts units back on the shelf, optionally allocating them to a line.
#[instrument(skip(conn), fields(variant_id = %variant_id, warehouse_id = %warehouse_id))]
pub async fn increase_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
    allocate_for: Option<Uuid>,
) -> Result<stock::Model, ServiceError> {
    let stock_id = match find_stock(conn, variant_id, warehouse_id).await? {
        Some(stock) => {
            stock::Entity::update_many()
                .col_expr(stock::Column::Quantity, Expr::col(stock::Column::Quantity).add(quantity))
                .col_expr(stock::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(stock::Column::Id.eq(stock.id))
                .exec(conn)
                .await?;
            stock.id
        }
        None => {
            stock::ActiveModel {
                id: Set(Uuid::new_v4()),
                warehouse_id: Set(warehouse_id),
                variant_id: Set(variant_id),
                quantity: Set(quantity),
                quantity_allocated: Set(0),
                updated_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?
            .id
        }
    };

    if let Some(order_line_id) = allocate_for {
        if try_allocate(conn, stock_id, order_line_id, quantity).await?.is_none() {
            warn!(stock_id = %stock_id, "restocked units could not be allocated");
        }
    }

    info!(quantity, "stock increased");
    reload(conn, stock_id).await
}

/// Takes shipped units off the shelf.
///
/// The line's allocation is released first, at this warehouse before any
/// other. Without `allow_stock_to_be_exceeded` the stock must still cover the
/// quantity once released; with it, the stock is clamped at what is allocated.
/// Returns `None` for variants that do not track inventory and have no stock
/// row at the warehouse.
#[instrument(skip(conn), fields(order_line_id = %order_line_id, warehouse_id = %warehouse_id))]
pub async fn decrease_stock<C: ConnectionTrait>(
    conn: &C,
    order_line_id: Uuid,
    variant_id: Uuid,
    warehouse_id: Uuid,
    quantity: i32,
    allow_stock_to_be_exceeded: bool,
) -> Result<Option<stock::Model>, ServiceError> {
    let variant = product_variant::Entity::find_by_id(variant_id).one(conn).await?;
    let existing = find_stock(conn, variant_id, warehouse_id).await?;
    if !variant.map_or(false, |variant| variant.track_inventory) {
        return Ok(existing);
    }

    deallocate(conn, order_line_id, quantity, existing.as_ref().map(|s| s.id)).await?;

    let insufficient = |available: i32| {
        ServiceError::InsufficientStock(InsufficientStock::single(InsufficientStockItem {
            variant_id,
            line_id: Some(order_line_id),
            warehouse_id: Some(warehouse_id),
            requested: quantity,
            available,
        }))
    };

    let Some(stock) = existing else {
        if !allow_stock_to_be_exceeded {
            return Err(insufficient(0));
        }
        let created = stock::ActiveModel {
            id: Set(Uuid::new_v4()),
            warehouse_id: Set(warehouse_id),
            variant_id: Set(variant_id),
            quantity: Set(0),
            quantity_allocated: Set(0),
            updated_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
        warn!(stock_id = %created.id, quantity, "shipped from a warehouse without stock");
        return Ok(Some(created));
    };

    let result = stock::Entity::update_many()
        .col_expr(stock::Column::Quantity, Expr::col(stock::Column::Quantity).sub(quantity))
        .col_expr(stock::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock::Column::Id.eq(stock.id))
        .filter(
            Expr::expr(Expr::col(stock::Column::Quantity).sub(quantity))
                .gte(Expr::col(stock::Column::QuantityAllocated)),
        )
        .exec(conn)
        .await?;
    if result.rows_affected == 1 {
        return Ok(Some(reload(conn, stock.id).await?));
    }

    let fresh = reload(conn, stock.id).await?;
    if !allow_stock_to_be_exceeded {
        return Err(insufficient(fresh.available()));
    }

    for _ in 0..3 {
        let fresh = reload(conn, stock.id).await?;
        let clamped = fresh.quantity_allocated.max(fresh.quantity - quantity);
        let result = stock::Entity::update_many()
            .col_expr(stock::Column::Quantity, Expr::value(clamped))
            .col_expr(stock::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock::Column::Id.eq(stock.id))
            .filter(stock::Column::Quantity.eq(fresh.quantity))
            .exec(conn)
            .await?;
        if result.rows_affected == 1 {
            warn!(stock_id = %stock.id, quantity, "stock exceeded");
            return Ok(Some(reload(conn, stock.id).await?));
        }
    }
    Err(ServiceError::ConcurrentModification(stock.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(country: &str, sort_order: i32, quantity: i32, allocated: i32) -> CandidateStock {
        let warehouse_id = Uuid::new_v4();
        CandidateStock {
            stock: stock::Model {
                id: Uuid::new_v4(),
                warehouse_id,
                variant_id: Uuid::nil(),
                quantity,
                quantity_allocated: allocated,
                updated_at: Utc::now(),
            },
            warehouse: warehouse::Model {
                id: warehouse_id,
                name: format!("{country}-{sort_order}"),
                country_code: country.into(),
                city: "City".into(),
                click_and_collect: ClickAndCollectOption::Disabled,
                created_at: Utc::now(),
            },
            sort_order,
        }
    }

    fn names(candidates: &[CandidateStock]) -> Vec<String> {
        candidates.iter().map(|c| c.warehouse.name.clone()).collect()
    }

    #[test]
    fn nearest_first_prefers_destination_country() {
        let mut candidates = vec![
            candidate("DE", 0, 10, 0),
            candidate("PL", 2, 1, 0),
            candidate("PL", 1, 1, 0),
        ];
        NearestFirst.rank("pl", &mut candidates);
        assert_eq!(names(&candidates), vec!["PL-1", "PL-2", "DE-0"]);
    }

    #[test]
    fn highest_stock_first_uses_available_quantity() {
        let mut candidates = vec![
            candidate("US", 0, 10, 9),
            candidate("US", 1, 5, 0),
            candidate("US", 2, 5, 0),
        ];
        HighestStockFirst.rank("US", &mut candidates);
        assert_eq!(names(&candidates), vec!["US-1", "US-2", "US-0"]);
    }

    #[test]
    fn strategy_maps_to_ranking() {
        let mut candidates = vec![candidate("US", 1, 1, 0), candidate("US", 0, 9, 0)];
        ranking_for(AllocationStrategy::HighestStock).rank("US", &mut candidates);
        assert_eq!(candidates[0].stock.quantity, 9);
    }

    #[test]
    fn insufficient_reservation_becomes_business_error() {
        let item = InsufficientStockItem {
            variant_id: Uuid::new_v4(),
            line_id: Some(Uuid::new_v4()),
            warehouse_id: None,
            requested: 3,
            available: 1,
        };
        let reservation = Reservation::Insufficient(InsufficientStock::single(item.clone()));
        match reservation.into_result() {
            Err(ServiceError::InsufficientStock(insufficient)) => {
                assert_eq!(insufficient.line_ids(), vec![item.line_id.unwrap()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
