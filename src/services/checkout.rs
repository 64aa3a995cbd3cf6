//! Checkout aggregate: the mutable cart and its one-way transition into an order.

use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::prelude::Json;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{validate_email, Validate};

use crate::db::{self, DbPool};
use crate::entities::order::{self, OrderOrigin, OrderStatus};
use crate::entities::order_discount::{self, OrderDiscountType};
use crate::entities::warehouse::{self, ClickAndCollectOption};
use crate::entities::{
    channel, channel_warehouse, checkout, checkout_line, payment, product_variant,
    shipping_method, stock, variant_channel_listing, voucher,
};
use crate::errors::{PaymentError, PaymentErrorCode, ServiceError};
use crate::events::Notifier;
use crate::services::address::{country_of, Address};
use crate::services::order_events::{self, Actor, OrderEventPayload};
use crate::services::orders::{
    line_snapshot, load_channel, load_details, new_order, next_order_number, purchasable_variant,
    recalculate_order, record_payment_outcome, sync_total_charged, OrderDetails,
};
use crate::services::payments::{NewPayment, PaymentEngine, TransactionOutcome};
use crate::services::pricing::{
    self, Discount, LineInput, PricingContext, PricingProvider, Recalculation, TaxedMoney,
};
use crate::services::stock_ledger::{self, LineRequest, ReservationContext};
use crate::services::EngineSettings;

lazy_static! {
    static ref CHECKOUT_COMPLETIONS: IntCounter = IntCounter::new(
        "checkout_completions_total",
        "Total number of checkouts turned into orders"
    )
    .expect("metric can be created");
    static ref CHECKOUT_COMPLETION_FAILURES: IntCounter = IntCounter::new(
        "checkout_completion_failures_total",
        "Total number of failed checkout completions"
    )
    .expect("metric can be created");
}

/// How a checkout gets to the customer, resolved once from its stored ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "method", rename_all = "snake_case")]
pub enum DeliveryMethod {
    Shipping(shipping_method::Model),
    CollectionPoint(warehouse::Model),
}

/// Exactly one of the two ids must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryMethodInput {
    pub warehouse_id: Option<Uuid>,
    pub shipping_method_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutLineInput {
    pub variant_id: Uuid,
    #[validate(range(min = 0, message = "Quantity cannot be negative"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutCreate {
    pub channel_id: Uuid,
    pub user_id: Option<Uuid>,
    #[validate(email)]
    pub email: Option<String>,
    #[serde(default)]
    pub lines: Vec<CheckoutLineInput>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    #[serde(default)]
    pub customer_note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutPaymentCreate {
    pub gateway: Option<String>,
    #[validate(length(min = 1, max = 512))]
    pub token: String,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutLineDetails {
    #[serde(flatten)]
    pub line: checkout_line::Model,
    pub product_name: String,
    pub variant_name: String,
    pub requires_shipping: bool,
    pub unit_price: TaxedMoney,
    pub total_price: TaxedMoney,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutDetails {
    #[serde(flatten)]
    pub checkout: checkout::Model,
    pub lines: Vec<CheckoutLineDetails>,
    pub delivery_method: Option<DeliveryMethod>,
    pub subtotal: TaxedMoney,
    pub shipping_price: TaxedMoney,
    pub total: TaxedMoney,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckoutCompletion {
    Completed {
        order: Box<OrderDetails>,
    },
    /// The gateway wants an out-of-band confirmation; call `complete` again
    /// once it happened.
    ConfirmationNeeded {
        payment_id: Uuid,
        confirmation_data: Option<Json>,
    },
}

/// A checkout line with the catalog data pricing needs.
struct PricedLine {
    line: checkout_line::Model,
    variant: product_variant::Model,
    unit_price: Decimal,
}

enum Completion {
    Placed {
        details: OrderDetails,
        confirmed: bool,
        fully_paid: bool,
    },
    NeedsConfirmation {
        payment_id: Uuid,
        confirmation_data: Option<Json>,
    },
}

async fn load_checkout<C: ConnectionTrait>(
    conn: &C,
    token: Uuid,
) -> Result<checkout::Model, ServiceError> {
    checkout::Entity::find_by_id(token)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Checkout", token))
}

async fn checkout_lines<C: ConnectionTrait>(
    conn: &C,
    token: Uuid,
) -> Result<Vec<checkout_line::Model>, ServiceError> {
    Ok(checkout_line::Entity::find()
        .filter(checkout_line::Column::CheckoutToken.eq(token))
        .order_by_asc(checkout_line::Column::CreatedAt)
        .all(conn)
        .await?)
}

fn destination_country(checkout: &checkout::Model) -> String {
    country_of(checkout.shipping_address.as_ref()).unwrap_or_else(|| checkout.country.clone())
}

fn reservation_context(
    checkout: &checkout::Model,
    channel: &channel::Model,
) -> ReservationContext {
    ReservationContext::new(channel, destination_country(checkout), checkout.collection_point_id)
}

async fn priced_lines<C: ConnectionTrait>(
    conn: &C,
    checkout: &checkout::Model,
    lines: Vec<checkout_line::Model>,
) -> Result<Vec<PricedLine>, ServiceError> {
    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        let Some(variant) = product_variant::Entity::find_by_id(line.variant_id).one(conn).await?
        else {
            continue;
        };
        let unit_price = variant_channel_listing::Entity::find()
            .filter(variant_channel_listing::Column::VariantId.eq(line.variant_id))
            .filter(variant_channel_listing::Column::ChannelId.eq(checkout.channel_id))
            .one(conn)
            .await?
            .map(|listing| listing.price_amount)
            .unwrap_or_default();
        priced.push(PricedLine {
            line,
            variant,
            unit_price,
        });
    }
    Ok(priced)
}

async fn resolve_delivery_method<C: ConnectionTrait>(
    conn: &C,
    checkout: &checkout::Model,
) -> Result<Option<DeliveryMethod>, ServiceError> {
    if let Some(warehouse_id) = checkout.collection_point_id {
        return Ok(warehouse::Entity::find_by_id(warehouse_id)
            .one(conn)
            .await?
            .map(DeliveryMethod::CollectionPoint));
    }
    if let Some(method_id) = checkout.shipping_method_id {
        return Ok(shipping_method::Entity::find_by_id(method_id)
            .one(conn)
            .await?
            .map(DeliveryMethod::Shipping));
    }
    Ok(None)
}

fn not_applicable(field: &str, message: impl Into<String>) -> ServiceError {
    ServiceError::DeliveryMethodNotApplicable {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Checks a delivery method against the checkout's lines, channel and address.
async fn validate_delivery_method<C: ConnectionTrait>(
    conn: &C,
    checkout: &checkout::Model,
    lines: &[PricedLine],
    method: &DeliveryMethod,
) -> Result<(), ServiceError> {
    match method {
        DeliveryMethod::Shipping(method) => {
            if !lines.iter().any(|line| line.variant.requires_shipping) {
                return Err(not_applicable(
                    "shipping_method_id",
                    "This checkout doesn't need shipping",
                ));
            }
            if method.channel_id != checkout.channel_id {
                return Err(not_applicable(
                    "shipping_method_id",
                    "Shipping method is not available in this channel",
                ));
            }
            let Some(country) = country_of(checkout.shipping_address.as_ref()) else {
                return Err(not_applicable(
                    "shipping_address",
                    "Cannot choose a shipping method for a checkout without a shipping address",
                ));
            };
            if !method.ships_to(&country) {
                return Err(not_applicable(
                    "shipping_method_id",
                    format!("Shipping method does not ship to {country}"),
                ));
            }
        }
        DeliveryMethod::CollectionPoint(warehouse) => {
            let linked = channel_warehouse::Entity::find()
                .filter(channel_warehouse::Column::ChannelId.eq(checkout.channel_id))
                .filter(channel_warehouse::Column::WarehouseId.eq(warehouse.id))
                .one(conn)
                .await?;
            if linked.is_none() || warehouse.click_and_collect == ClickAndCollectOption::Disabled {
                return Err(not_applicable(
                    "warehouse_id",
                    "Warehouse is not a collection point of this channel",
                ));
            }
            if warehouse.click_and_collect == ClickAndCollectOption::Local {
                for line in lines.iter().filter(|line| line.variant.track_inventory) {
                    let available = stock::Entity::find()
                        .filter(stock::Column::WarehouseId.eq(warehouse.id))
                        .filter(stock::Column::VariantId.eq(line.variant.id))
                        .one(conn)
                        .await?
                        .map(|stock| stock.available())
                        .unwrap_or_default();
                    if available < line.line.quantity {
                        return Err(not_applicable(
                            "warehouse_id",
                            format!("{} cannot be collected from this warehouse", line.variant.name),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Voucher usable on a checkout with the given undiscounted subtotal.
async fn applicable_voucher<C: ConnectionTrait>(
    conn: &C,
    checkout: &checkout::Model,
    code: &str,
    subtotal_gross: Decimal,
) -> Result<voucher::Model, ServiceError> {
    let invalid = || ServiceError::invalid_field("promo_code", "Promo code is invalid");
    let voucher = voucher::Entity::find()
        .filter(voucher::Column::Code.eq(code))
        .one(conn)
        .await?
        .ok_or_else(invalid)?;
    if !voucher.is_active || voucher.channel_id != checkout.channel_id {
        return Err(invalid());
    }
    if voucher.is_exhausted() {
        return Err(ServiceError::invalid_field(
            "promo_code",
            "Voucher usage limit has been reached",
        ));
    }
    if let Some(min_spent) = voucher.min_spent {
        if subtotal_gross < min_spent {
            return Err(ServiceError::invalid_field(
                "promo_code",
                format!("Voucher requires a minimum spend of {min_spent}"),
            ));
        }
    }
    Ok(voucher)
}

fn line_inputs(lines: &[PricedLine]) -> Vec<LineInput> {
    lines
        .iter()
        .map(|line| LineInput {
            line_id: line.line.id,
            quantity: line.line.quantity,
            base_unit_price: line.unit_price,
            discount: None,
        })
        .collect()
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
    pricing: Arc<dyn PricingProvider>,
    payments: PaymentEngine,
    settings: EngineSettings,
}

impl CheckoutService {
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

    fn check_quantity(&self, quantity: i32) -> Result<(), ServiceError> {
        if quantity > self.settings.max_checkout_line_quantity {
            return Err(ServiceError::invalid_field(
                "quantity",
                format!(
                    "Cannot add more than {} items of a single variant",
                    self.settings.max_checkout_line_quantity
                ),
            ));
        }
        Ok(())
    }

    /// Prices the checkout. A voucher that stopped applying is dropped.
    async fn calculate<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: &checkout::Model,
        lines: &[PricedLine],
        delivery: Option<&DeliveryMethod>,
    ) -> Result<(Recalculation, Option<voucher::Model>), ServiceError> {
        let ctx = PricingContext {
            channel_id: checkout.channel_id,
            currency: checkout.currency.clone(),
            country_code: destination_country(checkout),
        };
        let inputs = line_inputs(lines);
        let shipping_net = match delivery {
            Some(DeliveryMethod::Shipping(method))
                if lines.iter().any(|line| line.variant.requires_shipping) =>
            {
                Some(method.price)
            }
            _ => None,
        };

        let voucher = match &checkout.voucher_code {
            Some(code) => {
                let undiscounted = pricing::recalculate(self.pricing.as_ref(), &ctx, &inputs, &[], None);
                applicable_voucher(conn, checkout, code, undiscounted.subtotal.gross)
                    .await
                    .ok()
            }
            None => None,
        };
        let discounts: Vec<Discount> = voucher
            .iter()
            .map(|voucher| Discount {
                value_type: voucher.discount_value_type,
                value: voucher.value,
            })
            .collect();
        let prices = pricing::recalculate(self.pricing.as_ref(), &ctx, &inputs, &discounts, shipping_net);
        Ok((prices, voucher))
    }

    async fn details<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: checkout::Model,
    ) -> Result<CheckoutDetails, ServiceError> {
        let lines = checkout_lines(conn, checkout.token).await?;
        let lines = priced_lines(conn, &checkout, lines).await?;
        let delivery_method = resolve_delivery_method(conn, &checkout).await?;
        let (prices, _) = self.calculate(conn, &checkout, &lines, delivery_method.as_ref()).await?;

        let lines = lines
            .into_iter()
            .map(|priced| {
                let price = prices.line(priced.line.id);
                CheckoutLineDetails {
                    product_name: priced.variant.product_name.clone(),
                    variant_name: priced.variant.name.clone(),
                    requires_shipping: priced.variant.requires_shipping,
                    unit_price: price.map(|price| price.unit).unwrap_or_default(),
                    total_price: price.map(|price| price.total).unwrap_or_default(),
                    line: priced.line,
                }
            })
            .collect();
        Ok(CheckoutDetails {
            checkout,
            lines,
            delivery_method,
            subtotal: prices.subtotal,
            shipping_price: prices.shipping,
            total: prices.total,
        })
    }

    /// Stores the recalculated discount and returns the checkout's current state.
    async fn refresh<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: checkout::Model,
    ) -> Result<CheckoutDetails, ServiceError> {
        let lines = checkout_lines(conn, checkout.token).await?;
        let lines = priced_lines(conn, &checkout, lines).await?;
        let delivery = resolve_delivery_method(conn, &checkout).await?;
        let (prices, voucher) = self.calculate(conn, &checkout, &lines, delivery.as_ref()).await?;
        let discount_amount: Decimal = prices.discount_amounts.iter().copied().sum();

        let mut active: checkout::ActiveModel = checkout.clone().into();
        if voucher.is_none() && checkout.voucher_code.is_some() {
            warn!(token = %checkout.token, "voucher no longer applies, removing it");
            active.voucher_code = Set(None);
        }
        active.discount_amount = Set(discount_amount);
        active.last_change = Set(Utc::now());
        let checkout = active.update(conn).await?;
        self.details(conn, checkout).await
    }

    /// Read-only availability check of the checkout's lines after a change.
    async fn ensure_available<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: &checkout::Model,
        lines: &[LineRequest],
    ) -> Result<(), ServiceError> {
        let channel = load_channel(conn, checkout.channel_id).await?;
        let ctx = reservation_context(checkout, &channel);
        match stock_ledger::check_availability(conn, &ctx, lines).await? {
            Some(insufficient) => Err(ServiceError::InsufficientStock(insufficient)),
            None => Ok(()),
        }
    }

    /// Adds or sets line quantities, merging lines of the same variant.
    async fn upsert_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: &checkout::Model,
        inputs: &[CheckoutLineInput],
        replace: bool,
    ) -> Result<(), ServiceError> {
        let mut lines = checkout_lines(conn, checkout.token).await?;
        let mut touched = Vec::new();
        for input in inputs {
            purchasable_variant(conn, checkout.channel_id, input.variant_id).await?;
            let position = lines.iter().position(|line| line.variant_id == input.variant_id);
            let quantity = match (position, replace) {
                (Some(index), false) => lines[index].quantity + input.quantity,
                _ => input.quantity,
            };
            self.check_quantity(quantity)?;

            match position {
                Some(index) if quantity == 0 => {
                    let line = lines.remove(index);
                    line.delete(conn).await?;
                }
                Some(index) => {
                    let mut active: checkout_line::ActiveModel = lines[index].clone().into();
                    active.quantity = Set(quantity);
                    lines[index] = active.update(conn).await?;
                    touched.push(index);
                }
                None if quantity == 0 => {}
                None => {
                    let line = checkout_line::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        checkout_token: Set(checkout.token),
                        variant_id: Set(input.variant_id),
                        quantity: Set(quantity),
                        created_at: Set(Utc::now()),
                    }
                    .insert(conn)
                    .await?;
                    lines.push(line);
                    touched.push(lines.len() - 1);
                }
            }
        }

        let requests: Vec<LineRequest> = touched
            .into_iter()
            .filter_map(|index| lines.get(index))
            .map(|line| LineRequest {
                line_id: line.id,
                variant_id: line.variant_id,
                quantity: line.quantity,
            })
            .collect();
        self.ensure_available(conn, checkout, &requests).await
    }

    #[instrument(skip(self), fields(token = %token))]
    pub async fn get(&self, token: Uuid) -> Result<CheckoutDetails, ServiceError> {
        let checkout = load_checkout(&*self.db, token).await?;
        self.details(&*self.db, checkout).await
    }

    #[instrument(skip(self, input), fields(channel_id = %input.channel_id))]
    pub async fn create(&self, input: CheckoutCreate) -> Result<CheckoutDetails, ServiceError> {
        input.validate()?;
        for line in &input.lines {
            line.validate()?;
            if line.quantity == 0 {
                return Err(ServiceError::invalid_field("quantity", "Quantity must be greater than zero"));
            }
        }
        let shipping_address = input.shipping_address.as_ref().map(Address::to_json).transpose()?;
        let billing_address = input.billing_address.as_ref().map(Address::to_json).transpose()?;

        let txn = self.db.begin().await?;
        let result = async {
            let channel = channel::Entity::find_by_id(input.channel_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::invalid_field("channel_id", "Channel does not exist"))?;
            let country = country_of(shipping_address.as_ref())
                .unwrap_or_else(|| channel.default_country.to_ascii_uppercase());
            let now = Utc::now();
            let checkout = checkout::ActiveModel {
                token: Set(Uuid::new_v4()),
                channel_id: Set(channel.id),
                user_id: Set(input.user_id),
                email: Set(input.email.clone()),
                currency: Set(channel.currency.clone()),
                country: Set(country),
                shipping_address: Set(shipping_address),
                billing_address: Set(billing_address),
                shipping_method_id: Set(None),
                collection_point_id: Set(None),
                voucher_code: Set(None),
                discount_amount: Set(Decimal::ZERO),
                customer_note: Set(input.customer_note.clone()),
                created_at: Set(now),
                last_change: Set(now),
            }
            .insert(&txn)
            .await?;

            self.upsert_lines(&txn, &checkout, &input.lines, false).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        let details = db::finish(txn, result).await?;
        info!(token = %details.checkout.token, "checkout created");
        Ok(details)
    }

    #[instrument(skip(self, lines), fields(token = %token))]
    pub async fn add_lines(
        &self,
        token: Uuid,
        lines: Vec<CheckoutLineInput>,
    ) -> Result<CheckoutDetails, ServiceError> {
        for line in &lines {
            line.validate()?;
            if line.quantity == 0 {
                return Err(ServiceError::invalid_field("quantity", "Quantity must be greater than zero"));
            }
        }
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            self.upsert_lines(&txn, &checkout, &lines, false).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Sets absolute quantities; zero removes the line.
    #[instrument(skip(self, lines), fields(token = %token))]
    pub async fn update_lines(
        &self,
        token: Uuid,
        lines: Vec<CheckoutLineInput>,
    ) -> Result<CheckoutDetails, ServiceError> {
        for line in &lines {
            line.validate()?;
        }
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            self.upsert_lines(&txn, &checkout, &lines, true).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(token = %token, line_id = %line_id))]
    pub async fn delete_line(&self, token: Uuid, line_id: Uuid) -> Result<CheckoutDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let line = checkout_line::Entity::find_by_id(line_id)
                .one(&txn)
                .await?
                .filter(|line| line.checkout_token == checkout.token)
                .ok_or_else(|| ServiceError::not_found("Checkout line", line_id))?;
            line.delete(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, email), fields(token = %token))]
    pub async fn set_email(&self, token: Uuid, email: String) -> Result<CheckoutDetails, ServiceError> {
        if !validate_email(&email) {
            return Err(ServiceError::invalid_field("email", "Enter a valid email address"));
        }
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let mut active: checkout::ActiveModel = checkout.into();
            active.email = Set(Some(email));
            let checkout = active.update(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Changes the shipping address. A shipping method that no longer ships to
    /// the new country is cleared.
    #[instrument(skip(self, address), fields(token = %token))]
    pub async fn set_shipping_address(
        &self,
        token: Uuid,
        address: Address,
    ) -> Result<CheckoutDetails, ServiceError> {
        let stored = address.to_json()?;
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let mut active: checkout::ActiveModel = checkout.into();
            active.country = Set(address.country_code.to_ascii_uppercase());
            active.shipping_address = Set(Some(stored));
            let checkout = active.update(&txn).await?;

            let lines = priced_lines(&txn, &checkout, checkout_lines(&txn, token).await?).await?;
            let checkout = match resolve_delivery_method(&txn, &checkout).await? {
                Some(method @ DeliveryMethod::Shipping(_)) => {
                    match validate_delivery_method(&txn, &checkout, &lines, &method).await {
                        Ok(()) => checkout,
                        Err(ServiceError::DeliveryMethodNotApplicable { message, .. }) => {
                            info!(token = %token, reason = %message, "clearing shipping method");
                            let mut active: checkout::ActiveModel = checkout.into();
                            active.shipping_method_id = Set(None);
                            active.update(&txn).await?
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => checkout,
            };
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, address), fields(token = %token))]
    pub async fn set_billing_address(
        &self,
        token: Uuid,
        address: Address,
    ) -> Result<CheckoutDetails, ServiceError> {
        let stored = address.to_json()?;
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let mut active: checkout::ActiveModel = checkout.into();
            active.billing_address = Set(Some(stored));
            let checkout = active.update(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, input), fields(token = %token))]
    pub async fn set_delivery_method(
        &self,
        token: Uuid,
        input: DeliveryMethodInput,
    ) -> Result<CheckoutDetails, ServiceError> {
        let wanted = match (input.warehouse_id, input.shipping_method_id) {
            (Some(warehouse_id), None) => Ok(warehouse_id),
            (None, Some(method_id)) => Err(method_id),
            _ => {
                return Err(ServiceError::invalid_field(
                    "delivery_method_id",
                    "Provide exactly one of warehouse_id and shipping_method_id",
                ))
            }
        };

        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let method = match wanted {
                Ok(warehouse_id) => warehouse::Entity::find_by_id(warehouse_id)
                    .one(&txn)
                    .await?
                    .map(DeliveryMethod::CollectionPoint)
                    .ok_or_else(|| not_applicable("warehouse_id", "Warehouse does not exist"))?,
                Err(method_id) => shipping_method::Entity::find_by_id(method_id)
                    .one(&txn)
                    .await?
                    .map(DeliveryMethod::Shipping)
                    .ok_or_else(|| {
                        not_applicable("shipping_method_id", "Shipping method does not exist")
                    })?,
            };

            let lines = priced_lines(&txn, &checkout, checkout_lines(&txn, token).await?).await?;
            validate_delivery_method(&txn, &checkout, &lines, &method).await?;

            let mut active: checkout::ActiveModel = checkout.into();
            match &method {
                DeliveryMethod::Shipping(method) => {
                    active.shipping_method_id = Set(Some(method.id));
                    active.collection_point_id = Set(None);
                }
                DeliveryMethod::CollectionPoint(warehouse) => {
                    active.collection_point_id = Set(Some(warehouse.id));
                    active.shipping_method_id = Set(None);
                }
            }
            let checkout = active.update(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self, code), fields(token = %token))]
    pub async fn apply_promo_code(
        &self,
        token: Uuid,
        code: String,
    ) -> Result<CheckoutDetails, ServiceError> {
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(ServiceError::invalid_field("promo_code", "Promo code is required"));
        }
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let lines = priced_lines(&txn, &checkout, checkout_lines(&txn, token).await?).await?;
            let ctx = PricingContext {
                channel_id: checkout.channel_id,
                currency: checkout.currency.clone(),
                country_code: destination_country(&checkout),
            };
            let undiscounted =
                pricing::recalculate(self.pricing.as_ref(), &ctx, &line_inputs(&lines), &[], None);
            let voucher = applicable_voucher(&txn, &checkout, &code, undiscounted.subtotal.gross).await?;

            let mut active: checkout::ActiveModel = checkout.into();
            active.voucher_code = Set(Some(voucher.code));
            let checkout = active.update(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(token = %token))]
    pub async fn remove_promo_code(&self, token: Uuid) -> Result<CheckoutDetails, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let mut active: checkout::ActiveModel = checkout.into();
            active.voucher_code = Set(None);
            active.discount_amount = Set(Decimal::ZERO);
            let checkout = active.update(&txn).await?;
            self.refresh(&txn, checkout).await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Attaches a payment to the checkout. The amount defaults to the checkout total.
    #[instrument(skip(self, input), fields(token = %token))]
    pub async fn create_payment(
        &self,
        token: Uuid,
        input: CheckoutPaymentCreate,
    ) -> Result<payment::Model, ServiceError> {
        input.validate()?;
        if input.amount.map_or(false, |amount| amount < Decimal::ZERO) {
            return Err(ServiceError::invalid_field("amount", "Amount cannot be negative"));
        }
        let txn = self.db.begin().await?;
        let result = async {
            let checkout = load_checkout(&txn, token).await?;
            let details = self.details(&txn, checkout).await?;
            if details.lines.is_empty() {
                return Err(ServiceError::invalid_field("lines", "Cannot pay for an empty checkout"));
            }
            let gateway = input
                .gateway
                .clone()
                .unwrap_or_else(|| self.payments.gateway_name().to_string());
            self.payments
                .create(
                    &txn,
                    NewPayment {
                        gateway,
                        token: input.token.clone(),
                        total: input.amount.unwrap_or(details.total.gross),
                        currency: details.checkout.currency.clone(),
                        checkout_token: Some(details.checkout.token),
                        order_id: None,
                        billing_email: details.checkout.email.clone(),
                        psp_reference: None,
                    },
                )
                .await
        }
        .await;
        db::finish(txn, result).await
    }

    /// Turns the checkout into an order.
    ///
    /// Completing an already completed checkout returns its order. When stock
    /// runs out after the payment was charged, the order is rolled back and the
    /// charge is voided or refunded at the gateway.
    #[instrument(skip(self), fields(token = %token))]
    pub async fn complete(&self, actor: Actor, token: Uuid) -> Result<CheckoutCompletion, ServiceError> {
        if let Some(completed) = self.completed_order(token).await? {
            return Ok(completed);
        }

        let mut charge: Option<TransactionOutcome> = None;
        let txn = self.db.begin().await?;
        let result = self.place_order(&txn, actor, token, &mut charge).await;
        let completion = match db::finish(txn, result).await {
            Ok(completion) => completion,
            Err(ServiceError::NotFound(msg)) if charge.is_none() => {
                // A concurrent call placed the order and deleted the checkout.
                if let Some(completed) = self.completed_order(token).await? {
                    return Ok(completed);
                }
                return Err(ServiceError::NotFound(msg));
            }
            Err(err) => {
                CHECKOUT_COMPLETION_FAILURES.inc();
                warn!(token = %token, error = %err, "checkout completion failed");
                if let Some(outcome) = charge {
                    self.compensate(outcome).await;
                }
                return Err(err);
            }
        };

        match completion {
            Completion::NeedsConfirmation {
                payment_id,
                confirmation_data,
            } => Ok(CheckoutCompletion::ConfirmationNeeded {
                payment_id,
                confirmation_data,
            }),
            Completion::Placed {
                details,
                confirmed,
                fully_paid,
            } => {
                CHECKOUT_COMPLETIONS.inc();
                let order_id = details.order.id;
                info!(order_id = %order_id, number = details.order.number, "checkout completed");
                self.notifier.order_created(order_id).await;
                if confirmed {
                    self.notifier.order_confirmed(order_id).await;
                }
                if fully_paid {
                    self.notifier.order_fully_paid(order_id).await;
                }
                Ok(CheckoutCompletion::Completed {
                    order: Box::new(details),
                })
            }
        }
    }

    /// The order a checkout was already turned into, if any.
    async fn completed_order(&self, token: Uuid) -> Result<Option<CheckoutCompletion>, ServiceError> {
        let Some(order) = order::Entity::find()
            .filter(order::Column::CheckoutToken.eq(token))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };
        info!(order_id = %order.id, "checkout already completed");
        let details = load_details(&*self.db, order).await?;
        Ok(Some(CheckoutCompletion::Completed {
            order: Box::new(details),
        }))
    }

    async fn compensate(&self, outcome: TransactionOutcome) {
        let result = async {
            let txn = self.db.begin().await?;
            let result = self.payments.compensate(&txn, &outcome).await;
            db::finish(txn, result).await
        }
        .await;
        if let Err(err) = result {
            error!(payment_id = %outcome.payment.id, error = %err, "could not compensate payment");
        }
    }

    /// Charges the checkout's payment. `None` means no payment is needed.
    async fn charge<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout: &checkout::Model,
        channel: &channel::Model,
        total: Decimal,
    ) -> Result<Option<TransactionOutcome>, ServiceError> {
        let payment = self.payments.active_for_checkout(conn, checkout.token).await?;
        if total.is_zero() {
            return Ok(None);
        }
        let payment = match payment {
            Some(payment) => payment,
            None if channel.allow_unpaid_orders => return Ok(None),
            None => {
                return Err(PaymentError::new(
                    PaymentErrorCode::NotCovered,
                    "Provided payment methods can not cover the checkout's total amount",
                )
                .into())
            }
        };
        if payment.total < total {
            return Err(PaymentError::new(
                PaymentErrorCode::NotCovered,
                "Provided payment methods can not cover the checkout's total amount",
            )
            .into());
        }

        let capture = channel.capture_payments_on_checkout;
        let outcome = if payment.to_confirm {
            self.payments.confirm(conn, payment.id, capture).await?
        } else if capture {
            self.payments.capture(conn, payment.id, None).await?
        } else {
            self.payments.authorize(conn, payment.id).await?
        };
        if let Some(error) = &outcome.error {
            return Err(ServiceError::Payment(error.clone()));
        }
        Ok(Some(outcome))
    }

    async fn place_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        actor: Actor,
        token: Uuid,
        charge: &mut Option<TransactionOutcome>,
    ) -> Result<Completion, ServiceError> {
        let checkout = load_checkout(conn, token).await?;
        let channel = load_channel(conn, checkout.channel_id).await?;
        let lines = checkout_lines(conn, token).await?;
        if lines.is_empty() {
            return Err(ServiceError::invalid_field("lines", "Cannot complete an empty checkout"));
        }

        let mut snapshots = Vec::with_capacity(lines.len());
        for line in &lines {
            let (variant, listing) = purchasable_variant(conn, channel.id, line.variant_id).await?;
            snapshots.push((variant, listing.price_amount));
        }
        let priced = priced_lines(conn, &checkout, lines).await?;

        if checkout.email.is_none() && checkout.user_id.is_none() {
            return Err(ServiceError::invalid_field("email", "Email is required to place an order"));
        }
        if checkout.billing_address.is_none() {
            return Err(ServiceError::invalid_field("billing_address", "Billing address is required"));
        }
        let shipping_required = priced.iter().any(|line| line.variant.requires_shipping);
        let delivery = resolve_delivery_method(conn, &checkout).await?;
        if shipping_required {
            let Some(method) = &delivery else {
                return Err(not_applicable("shipping_method_id", "Delivery method is required"));
            };
            if matches!(method, DeliveryMethod::Shipping(_)) && checkout.shipping_address.is_none() {
                return Err(ServiceError::invalid_field("shipping_address", "Shipping address is required"));
            }
            validate_delivery_method(conn, &checkout, &priced, method).await?;
        }

        let ctx = reservation_context(&checkout, &channel);
        let requests: Vec<LineRequest> = priced
            .iter()
            .map(|line| LineRequest {
                line_id: line.line.id,
                variant_id: line.line.variant_id,
                quantity: line.line.quantity,
            })
            .collect();
        if let Some(insufficient) = stock_ledger::check_availability(conn, &ctx, &requests).await? {
            return Err(ServiceError::InsufficientStock(insufficient));
        }

        let (prices, voucher) = self.calculate(conn, &checkout, &priced, delivery.as_ref()).await?;
        if checkout.voucher_code.is_some() && voucher.is_none() {
            return Err(ServiceError::invalid_field("promo_code", "Promo code is no longer valid"));
        }

        let outcome = self.charge(conn, &checkout, &channel, prices.total.gross).await?;
        if let Some(outcome) = &outcome {
            if outcome.action_required() {
                info!(payment_id = %outcome.payment.id, "payment requires confirmation");
                return Ok(Completion::NeedsConfirmation {
                    payment_id: outcome.payment.id,
                    confirmation_data: outcome.transaction.action_required_data.clone(),
                });
            }
            *charge = Some(outcome.clone());
        }

        let confirmed = channel.automatically_confirm_all_new_orders;
        let number = next_order_number(conn).await?;
        let status = if confirmed {
            OrderStatus::Unfulfilled
        } else {
            OrderStatus::Unconfirmed
        };
        let mut active = new_order(number, status, OrderOrigin::Checkout, &channel);
        active.checkout_token = Set(Some(checkout.token));
        active.user_id = Set(checkout.user_id);
        active.user_email = Set(checkout.email.clone());
        active.currency = Set(checkout.currency.clone());
        active.shipping_address = Set(checkout.shipping_address.clone());
        active.billing_address = Set(checkout.billing_address.clone());
        active.customer_note = Set(checkout.customer_note.clone());
        if shipping_required {
            match &delivery {
                Some(DeliveryMethod::Shipping(method)) => {
                    active.shipping_method_id = Set(Some(method.id));
                    active.shipping_method_name = Set(Some(method.name.clone()));
                    active.base_shipping_price = Set(method.price);
                }
                Some(DeliveryMethod::CollectionPoint(warehouse)) => {
                    active.collection_point_id = Set(Some(warehouse.id));
                    active.collection_point_name = Set(Some(warehouse.name.clone()));
                }
                None => {}
            }
        }
        let order = active.insert(conn).await?;

        let mut reservations = Vec::with_capacity(priced.len());
        for (line, (variant, price)) in priced.iter().zip(snapshots.iter()) {
            let order_line = line_snapshot(&order, variant, *price, line.line.quantity)
                .insert(conn)
                .await?;
            reservations.push(LineRequest {
                line_id: order_line.id,
                variant_id: variant.id,
                quantity: order_line.quantity,
            });
        }

        if let Some(voucher) = voucher {
            let consumed = voucher::Entity::update_many()
                .col_expr(voucher::Column::Used, Expr::col(voucher::Column::Used).add(1))
                .filter(voucher::Column::Id.eq(voucher.id))
                .filter(
                    Condition::any()
                        .add(voucher::Column::UsageLimit.is_null())
                        .add(Expr::col(voucher::Column::Used).lt(Expr::col(voucher::Column::UsageLimit))),
                )
                .exec(conn)
                .await?;
            if consumed.rows_affected == 0 {
                return Err(ServiceError::invalid_field(
                    "promo_code",
                    "Voucher usage limit has been reached",
                ));
            }
            order_discount::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                discount_type: Set(OrderDiscountType::Voucher),
                value_type: Set(voucher.discount_value_type),
                value: Set(voucher.value),
                amount: Set(Decimal::ZERO),
                name: Set(Some(voucher.name.clone())),
                reason: Set(None),
                voucher_code: Set(Some(voucher.code.clone())),
                created_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?;
        }

        let order_ctx = ReservationContext::new(
            &channel,
            destination_country(&checkout),
            order.collection_point_id,
        );
        stock_ledger::reserve(conn, &order_ctx, &reservations)
            .await?
            .into_result()?;

        payment::Entity::update_many()
            .col_expr(payment::Column::OrderId, Expr::value(order.id))
            .filter(payment::Column::CheckoutToken.eq(checkout.token))
            .exec(conn)
            .await?;

        checkout_line::Entity::delete_many()
            .filter(checkout_line::Column::CheckoutToken.eq(checkout.token))
            .exec(conn)
            .await?;
        checkout.delete(conn).await?;

        let order = recalculate_order(conn, self.pricing.as_ref(), order).await?;
        let order = sync_total_charged(conn, order).await?;

        order_events::append(conn, order.id, actor, OrderEventPayload::Placed).await?;
        if confirmed {
            order_events::append(conn, order.id, actor, OrderEventPayload::Confirmed).await?;
        }
        let mut fully_paid = false;
        if let Some(outcome) = &outcome {
            record_payment_outcome(conn, order.id, actor, outcome).await?;
            if order.total_charged > Decimal::ZERO && order.is_fully_paid() {
                order_events::append(conn, order.id, actor, OrderEventPayload::OrderFullyPaid).await?;
                fully_paid = true;
            }
        }

        Ok(Completion::Placed {
            details: load_details(conn, order).await?,
            confirmed,
            fully_paid,
        })
    }
}
