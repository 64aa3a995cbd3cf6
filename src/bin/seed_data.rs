//! Seed data script - populates the catalog the engine sells from
//!
//! Run with: cargo run --bin seed-data -- --database-url sqlite://order_engine.db?mode=rwc
//!
//! This creates:
//! - one USD channel shipping to the US and Canada
//! - two warehouses (one offering click and collect)
//! - 8 variants with channel listings and stock, one of them a preorder
//! - two shipping methods and a promo code

use chrono::{Duration, Utc};
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use tracing::info;
use uuid::Uuid;

use order_engine::db;
use order_engine::entities::{
    channel::{self, AllocationStrategy},
    channel_warehouse,
    order_discount::DiscountValueType,
    product_variant, shipping_method, stock, variant_channel_listing, voucher,
    warehouse::{self, ClickAndCollectOption},
};

#[derive(Debug, Parser)]
#[command(name = "seed-data", about = "Seed the order engine catalog with demo data")]
struct Args {
    /// Database to seed
    #[arg(long, default_value = "sqlite://order_engine.db?mode=rwc")]
    database_url: String,

    /// Units put on the shelf for every variant and warehouse
    #[arg(long, default_value_t = 25)]
    stock: i32,

    /// Skip running migrations first
    #[arg(long)]
    no_migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    info!("=== Order Engine Seed Data ===");
    let db = db::establish_connection(&args.database_url).await?;
    if !args.no_migrate {
        db::run_migrations(&db).await?;
    }

    let channel = create_channel(&db).await?;
    info!(channel_id = %channel.id, "created channel {}", channel.slug);

    let warehouses = create_warehouses(&db, &channel).await?;
    info!("  Created {} warehouses", warehouses.len());

    let variants = create_variants(&db, &channel, &warehouses, args.stock).await?;
    info!("  Created {} variants with listings and stock", variants.len());

    create_shipping_and_vouchers(&db, &channel).await?;
    info!("  Created shipping methods and promo code WELCOME10");

    info!("=== Seed Data Complete ===");
    info!("Try: curl -X POST http://localhost:8080/api/v1/checkouts -H 'content-type: application/json' \\");
    info!(
        "  -d '{{\"channel_id\":\"{}\",\"email\":\"buyer@example.com\",\"lines\":[{{\"variant_id\":\"{}\",\"quantity\":1}}]}}'",
        channel.id, variants[0].id
    );
    Ok(())
}

async fn create_channel(db: &DatabaseConnection) -> anyhow::Result<channel::Model> {
    let channel = channel::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set("Default channel".to_string()),
        slug: Set(format!("default-{}", &Uuid::new_v4().simple().to_string()[..6])),
        currency: Set("USD".to_string()),
        default_country: Set("US".to_string()),
        automatically_confirm_all_new_orders: Set(true),
        capture_payments_on_checkout: Set(true),
        automatically_capture_authorized_payments: Set(false),
        allow_unpaid_orders: Set(false),
        allocation_strategy: Set(AllocationStrategy::NearestFirst),
        created_at: Set(Utc::now()),
    };
    Ok(channel.insert(db).await?)
}

async fn create_warehouses(
    db: &DatabaseConnection,
    channel: &channel::Model,
) -> anyhow::Result<Vec<warehouse::Model>> {
    let data = [
        ("East Coast DC", "US", "Newark", ClickAndCollectOption::Local),
        ("Toronto Hub", "CA", "Toronto", ClickAndCollectOption::Disabled),
    ];

    let mut created = Vec::new();
    for (sort_order, (name, country, city, click_and_collect)) in data.into_iter().enumerate() {
        let warehouse = warehouse::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            country_code: Set(country.to_string()),
            city: Set(city.to_string()),
            click_and_collect: Set(click_and_collect),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await?;
        channel_warehouse::ActiveModel {
            id: Set(Uuid::new_v4()),
            channel_id: Set(channel.id),
            warehouse_id: Set(warehouse.id),
            sort_order: Set(sort_order as i32),
        }
        .insert(db)
        .await?;
        created.push(warehouse);
    }
    Ok(created)
}

async fn create_variants(
    db: &DatabaseConnection,
    channel: &channel::Model,
    warehouses: &[warehouse::Model],
    quantity: i32,
) -> anyhow::Result<Vec<product_variant::Model>> {
    // (product, variant, sku, price, track inventory, requires shipping, gift card, preorder)
    let data: [(&str, &str, &str, Decimal, bool, bool, bool, bool); 8] = [
        ("Classic Cotton T-Shirt", "M / Black", "TSH-BLK-M", dec!(24.99), true, true, false, false),
        ("Classic Cotton T-Shirt", "L / Black", "TSH-BLK-L", dec!(24.99), true, true, false, false),
        ("Slim Fit Denim Jeans", "32", "JNS-SLM-32", dec!(89.99), true, true, false, false),
        ("Merino Wool Sweater", "L", "SWT-MRN-L", dec!(119.99), true, true, false, false),
        ("Canvas Backpack 25L", "Olive", "BAG-CNV-25", dec!(79.99), true, true, false, false),
        ("Store Credit", "50 USD", "GC-50", dec!(50.00), false, false, true, false),
        ("Sticker Pack", "Default", "STK-001", dec!(4.99), false, true, false, false),
        ("Limited Edition Jacket", "M", "JKT-LTD-M", dec!(249.00), true, true, false, true),
    ];

    let mut created = Vec::new();
    for (product, name, sku, price, track_inventory, requires_shipping, is_gift_card, is_preorder) in data {
        let variant = product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(name.to_string()),
            product_name: Set(product.to_string()),
            track_inventory: Set(track_inventory),
            requires_shipping: Set(requires_shipping),
            is_gift_card: Set(is_gift_card),
            is_preorder: Set(is_preorder),
            preorder_global_threshold: Set(is_preorder.then_some(100)),
            preorder_global_sold_units: Set(0),
            preorder_end_date: Set(is_preorder.then(|| Utc::now() + Duration::days(30))),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await?;

        variant_channel_listing::ActiveModel {
            id: Set(Uuid::new_v4()),
            variant_id: Set(variant.id),
            channel_id: Set(channel.id),
            price_amount: Set(price),
            currency: Set(channel.currency.clone()),
            is_available_for_purchase: Set(true),
            preorder_quantity_threshold: Set(is_preorder.then_some(20)),
            preorder_sold_units: Set(0),
        }
        .insert(db)
        .await?;

        if track_inventory && !is_preorder {
            for warehouse in warehouses {
                stock::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    warehouse_id: Set(warehouse.id),
                    variant_id: Set(variant.id),
                    quantity: Set(quantity),
                    quantity_allocated: Set(0),
                    updated_at: Set(Utc::now()),
                }
                .insert(db)
                .await?;
            }
        }
        created.push(variant);
    }
    Ok(created)
}

async fn create_shipping_and_vouchers(
    db: &DatabaseConnection,
    channel: &channel::Model,
) -> anyhow::Result<()> {
    for (name, price, countries) in [("Standard", dec!(5.00), "US,CA"), ("Express", dec!(15.00), "US")] {
        shipping_method::ActiveModel {
            id: Set(Uuid::new_v4()),
            channel_id: Set(channel.id),
            name: Set(name.to_string()),
            price: Set(price),
            countries: Set(countries.to_string()),
        }
        .insert(db)
        .await?;
    }

    voucher::ActiveModel {
        id: Set(Uuid::new_v4()),
        channel_id: Set(channel.id),
        code: Set("WELCOME10".to_string()),
        name: Set("Welcome discount".to_string()),
        discount_value_type: Set(DiscountValueType::Percentage),
        value: Set(dec!(10)),
        min_spent: Set(Some(dec!(20))),
        usage_limit: Set(Some(100)),
        used: Set(0),
        is_active: Set(true),
    }
    .insert(db)
    .await?;
    Ok(())
}
