#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use order_engine::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        channel::{self, AllocationStrategy},
        channel_warehouse,
        order_discount::DiscountValueType,
        product_variant, shipping_method, stock, variant_channel_listing, voucher,
        warehouse::{self, ClickAndCollectOption},
    },
    events::RecordingNotifier,
    handlers::AppServices,
    services::{
        address::Address,
        checkout::{
            CheckoutCompletion, CheckoutCreate, CheckoutDetails, CheckoutLineInput,
            CheckoutPaymentCreate, DeliveryMethodInput,
        },
        gateway::DummyGateway,
        order_events::Actor,
        orders::OrderDetails,
        payments::PaymentEngine,
        pricing::FlatTaxPricing,
        EngineSettings,
    },
    AppState,
};

/// Channel flags a test wants to differ from the defaults.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFlags {
    pub automatically_confirm_all_new_orders: bool,
    pub capture_payments_on_checkout: bool,
    pub automatically_capture_authorized_payments: bool,
    pub allow_unpaid_orders: bool,
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            automatically_confirm_all_new_orders: true,
            capture_payments_on_checkout: true,
            automatically_capture_authorized_payments: false,
            allow_unpaid_orders: false,
        }
    }
}

/// What every test application starts with.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub channel: channel::Model,
    /// US warehouse, first in the channel's order, offers click and collect.
    pub warehouse: warehouse::Model,
    /// Canadian warehouse, second in the channel's order.
    pub backup_warehouse: warehouse::Model,
    /// 10.00, 10 units in the US warehouse.
    pub shirt: product_variant::Model,
    /// 5.00, 3 units in the US warehouse.
    pub mug: product_variant::Model,
    /// 25.00 gift card, untracked, no shipping.
    pub gift_card: product_variant::Model,
    /// Ships to US and CA for 5.00.
    pub shipping: shipping_method::Model,
    /// 10% off, no minimum.
    pub voucher: voucher::Model,
}

/// Helper harness for spinning up an application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub notifier: Arc<RecordingNotifier>,
    pub catalog: Catalog,
    _dir: Option<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(ChannelFlags::default(), EngineSettings::default()).await
    }

    pub async fn with_channel(flags: ChannelFlags) -> Self {
        Self::with_settings(flags, EngineSettings::default()).await
    }

    pub async fn with_settings(flags: ChannelFlags, settings: EngineSettings) -> Self {
        // One connection: every pooled connection would get its own in-memory database.
        let db_config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        Self::build(db_config, flags, settings, None).await
    }

    /// Application on a SQLite file with a pool of several connections, for
    /// tests that race operations against each other.
    pub async fn on_disk() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("engine.db").display()
        );
        let db_config = DbConfig {
            url,
            max_connections: 4,
            min_connections: 1,
            ..Default::default()
        };
        Self::build(db_config, ChannelFlags::default(), EngineSettings::default(), Some(dir)).await
    }

    async fn build(
        db_config: DbConfig,
        flags: ChannelFlags,
        settings: EngineSettings,
        dir: Option<TempDir>,
    ) -> Self {
        let cfg = AppConfig::new(
            db_config.url.clone(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let catalog = seed_catalog(&db_arc, flags).await;

        let notifier = Arc::new(RecordingNotifier::new());
        let services = AppServices::new(
            db_arc.clone(),
            notifier.clone(),
            Arc::new(FlatTaxPricing::new(Decimal::ZERO)),
            PaymentEngine::new(Arc::new(DummyGateway)),
            settings,
        );
        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
        };
        let router = order_engine::app(state.clone());

        Self {
            router,
            state,
            notifier,
            catalog,
            _dir: dir,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Send a JSON request against the router and decode the JSON answer.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    /// Adds a tracked, shippable variant listed in the test channel.
    pub async fn seed_variant(&self, name: &str, price: Decimal, quantity: i32) -> product_variant::Model {
        let variant = insert_variant(&self.state.db, &self.catalog.channel, name, price, true, true, false).await;
        insert_stock(&self.state.db, self.catalog.warehouse.id, variant.id, quantity).await;
        variant
    }

    /// Adds a preorder variant with optional channel and global caps.
    pub async fn seed_preorder_variant(
        &self,
        name: &str,
        price: Decimal,
        channel_threshold: Option<i32>,
        global_threshold: Option<i32>,
    ) -> product_variant::Model {
        let db = &*self.state.db;
        let variant = insert_variant(db, &self.catalog.channel, name, price, true, true, false).await;
        let mut active: product_variant::ActiveModel = variant.into();
        active.is_preorder = Set(true);
        active.preorder_global_threshold = Set(global_threshold);
        let variant = active.update(db).await.expect("mark variant as preorder");

        let listing = variant_channel_listing::Entity::find()
            .filter(variant_channel_listing::Column::VariantId.eq(variant.id))
            .one(db)
            .await
            .expect("listing query")
            .expect("listing exists");
        let mut listing: variant_channel_listing::ActiveModel = listing.into();
        listing.preorder_quantity_threshold = Set(channel_threshold);
        listing.update(db).await.expect("set preorder threshold");
        variant
    }

    pub async fn listing(&self, variant_id: Uuid) -> variant_channel_listing::Model {
        variant_channel_listing::Entity::find()
            .filter(variant_channel_listing::Column::VariantId.eq(variant_id))
            .filter(variant_channel_listing::Column::ChannelId.eq(self.catalog.channel.id))
            .one(&*self.state.db)
            .await
            .expect("listing query")
            .expect("listing exists")
    }

    pub async fn variant(&self, variant_id: Uuid) -> product_variant::Model {
        product_variant::Entity::find_by_id(variant_id)
            .one(&*self.state.db)
            .await
            .expect("variant query")
            .expect("variant exists")
    }

    pub async fn stock(&self, variant_id: Uuid, warehouse_id: Uuid) -> stock::Model {
        stock::Entity::find()
            .filter(stock::Column::VariantId.eq(variant_id))
            .filter(stock::Column::WarehouseId.eq(warehouse_id))
            .one(&*self.state.db)
            .await
            .expect("stock query")
            .expect("stock row exists")
    }

    pub async fn add_stock(&self, variant_id: Uuid, warehouse_id: Uuid, quantity: i32) -> stock::Model {
        insert_stock(&self.state.db, warehouse_id, variant_id, quantity).await
    }

    /// A checkout with email, addresses and standard shipping.
    pub async fn ready_checkout(&self, lines: &[(Uuid, i32)]) -> CheckoutDetails {
        let checkout = self.services().checkout.clone();
        let created = checkout
            .create(CheckoutCreate {
                channel_id: self.catalog.channel.id,
                user_id: None,
                email: Some("buyer@example.com".to_string()),
                lines: lines
                    .iter()
                    .map(|(variant_id, quantity)| CheckoutLineInput {
                        variant_id: *variant_id,
                        quantity: *quantity,
                    })
                    .collect(),
                shipping_address: Some(address("US")),
                billing_address: Some(address("US")),
                customer_note: String::new(),
            })
            .await
            .expect("create checkout");
        checkout
            .set_delivery_method(
                created.checkout.token,
                DeliveryMethodInput {
                    warehouse_id: None,
                    shipping_method_id: Some(self.catalog.shipping.id),
                },
            )
            .await
            .expect("set delivery method")
    }

    pub async fn pay(&self, token: Uuid, card: &str) {
        self.services()
            .checkout
            .create_payment(
                token,
                CheckoutPaymentCreate {
                    gateway: None,
                    token: card.to_string(),
                    amount: None,
                },
            )
            .await
            .expect("create payment");
    }

    /// Checkout, payment and completion in one go.
    pub async fn place_order(&self, lines: &[(Uuid, i32)]) -> OrderDetails {
        let checkout = self.ready_checkout(lines).await;
        self.pay(checkout.checkout.token, "tok_visa").await;
        match self
            .services()
            .checkout
            .complete(Actor::System, checkout.checkout.token)
            .await
            .expect("complete checkout")
        {
            CheckoutCompletion::Completed { order } => *order,
            other => panic!("checkout did not complete: {other:?}"),
        }
    }

    /// Stored event types of an order, oldest first.
    pub async fn event_types(&self, order_id: Uuid) -> Vec<String> {
        self.services()
            .orders
            .events(order_id)
            .await
            .expect("order events")
            .into_iter()
            .map(|event| event.payload.event_type())
            .collect()
    }
}

pub fn address(country: &str) -> Address {
    Address {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        company: None,
        address_line_1: "12 Analytical Row".to_string(),
        address_line_2: None,
        city: "Springfield".to_string(),
        postal_code: "12345".to_string(),
        country_code: country.to_string(),
        phone: None,
    }
}

async fn seed_catalog(db: &sea_orm::DatabaseConnection, flags: ChannelFlags) -> Catalog {
    let channel = channel::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set("Test channel".to_string()),
        slug: Set("test".to_string()),
        currency: Set("USD".to_string()),
        default_country: Set("US".to_string()),
        automatically_confirm_all_new_orders: Set(flags.automatically_confirm_all_new_orders),
        capture_payments_on_checkout: Set(flags.capture_payments_on_checkout),
        automatically_capture_authorized_payments: Set(flags.automatically_capture_authorized_payments),
        allow_unpaid_orders: Set(flags.allow_unpaid_orders),
        allocation_strategy: Set(AllocationStrategy::NearestFirst),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed channel");

    let warehouse = insert_warehouse(db, &channel, "Springfield DC", "US", ClickAndCollectOption::Local, 0).await;
    let backup_warehouse =
        insert_warehouse(db, &channel, "Toronto Hub", "CA", ClickAndCollectOption::Disabled, 1).await;

    let shirt = insert_variant(db, &channel, "Shirt", dec!(10.00), true, true, false).await;
    insert_stock(db, warehouse.id, shirt.id, 10).await;
    let mug = insert_variant(db, &channel, "Mug", dec!(5.00), true, true, false).await;
    insert_stock(db, warehouse.id, mug.id, 3).await;
    let gift_card = insert_variant(db, &channel, "Gift card", dec!(25.00), false, false, true).await;

    let shipping = shipping_method::ActiveModel {
        id: Set(Uuid::new_v4()),
        channel_id: Set(channel.id),
        name: Set("Standard".to_string()),
        price: Set(dec!(5.00)),
        countries: Set("US,CA".to_string()),
    }
    .insert(db)
    .await
    .expect("seed shipping method");

    let voucher = voucher::ActiveModel {
        id: Set(Uuid::new_v4()),
        channel_id: Set(channel.id),
        code: Set("SAVE10".to_string()),
        name: Set("Ten percent".to_string()),
        discount_value_type: Set(DiscountValueType::Percentage),
        value: Set(dec!(10)),
        min_spent: Set(None),
        usage_limit: Set(Some(1)),
        used: Set(0),
        is_active: Set(true),
    }
    .insert(db)
    .await
    .expect("seed voucher");

    Catalog {
        channel,
        warehouse,
        backup_warehouse,
        shirt,
        mug,
        gift_card,
        shipping,
        voucher,
    }
}

async fn insert_warehouse(
    db: &sea_orm::DatabaseConnection,
    channel: &channel::Model,
    name: &str,
    country: &str,
    click_and_collect: ClickAndCollectOption,
    sort_order: i32,
) -> warehouse::Model {
    let warehouse = warehouse::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        country_code: Set(country.to_string()),
        city: Set("Somewhere".to_string()),
        click_and_collect: Set(click_and_collect),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed warehouse");
    channel_warehouse::ActiveModel {
        id: Set(Uuid::new_v4()),
        channel_id: Set(channel.id),
        warehouse_id: Set(warehouse.id),
        sort_order: Set(sort_order),
    }
    .insert(db)
    .await
    .expect("seed channel warehouse");
    warehouse
}

async fn insert_variant(
    db: &sea_orm::DatabaseConnection,
    channel: &channel::Model,
    name: &str,
    price: Decimal,
    track_inventory: bool,
    requires_shipping: bool,
    is_gift_card: bool,
) -> product_variant::Model {
    let variant = product_variant::ActiveModel {
        id: Set(Uuid::new_v4()),
        sku: Set(format!("SKU-{}", &Uuid::new_v4().simple().to_string()[..8])),
        name: Set("Default".to_string()),
        product_name: Set(name.to_string()),
        track_inventory: Set(track_inventory),
        requires_shipping: Set(requires_shipping),
        is_gift_card: Set(is_gift_card),
        is_preorder: Set(false),
        preorder_global_threshold: Set(None),
        preorder_global_sold_units: Set(0),
        preorder_end_date: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed variant");
    variant_channel_listing::ActiveModel {
        id: Set(Uuid::new_v4()),
        variant_id: Set(variant.id),
        channel_id: Set(channel.id),
        price_amount: Set(price),
        currency: Set(channel.currency.clone()),
        is_available_for_purchase: Set(true),
        preorder_quantity_threshold: Set(None),
        preorder_sold_units: Set(0),
    }
    .insert(db)
    .await
    .expect("seed listing");
    variant
}

async fn insert_stock(
    db: &sea_orm::DatabaseConnection,
    warehouse_id: Uuid,
    variant_id: Uuid,
    quantity: i32,
) -> stock::Model {
    stock::ActiveModel {
        id: Set(Uuid::new_v4()),
        warehouse_id: Set(warehouse_id),
        variant_id: Set(variant_id),
        quantity: Set(quantity),
        quantity_allocated: Set(0),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed stock")
}
