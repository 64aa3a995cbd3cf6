use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_catalog_tables::Migration),
            Box::new(m20240101_000002_create_stock_tables::Migration),
            Box::new(m20240101_000003_create_checkout_tables::Migration),
            Box::new(m20240101_000004_create_order_tables::Migration),
            Box::new(m20240101_000005_create_fulfillment_tables::Migration),
            Box::new(m20240101_000006_create_payment_tables::Migration),
        ]
    }
}

/// Column builders shared by the migrations below.
mod columns {
    use sea_orm_migration::prelude::*;

    pub fn uuid_pk<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).uuid().not_null().primary_key().to_owned()
    }

    pub fn uuid_col<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).uuid().not_null().to_owned()
    }

    pub fn uuid_null<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).uuid().null().to_owned()
    }

    // The SQLite backend refuses decimal precision above 16.
    const MONEY_PRECISION: u32 = 16;
    const MONEY_SCALE: u32 = 4;

    pub fn money<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col)
            .decimal_len(MONEY_PRECISION, MONEY_SCALE)
            .not_null()
            .to_owned()
    }

    pub fn money_null<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col)
            .decimal_len(MONEY_PRECISION, MONEY_SCALE)
            .null()
            .to_owned()
    }

    pub fn text<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).string().not_null().to_owned()
    }

    pub fn text_null<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).string().null().to_owned()
    }

    pub fn int<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).integer().not_null().to_owned()
    }

    pub fn flag<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).boolean().not_null().to_owned()
    }

    pub fn json_null<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col).json().null().to_owned()
    }

    pub fn timestamp_tz<T: IntoIden>(col: T) -> ColumnDef {
        ColumnDef::new(col)
            .timestamp_with_time_zone()
            .not_null()
            .to_owned()
    }
}

mod m20240101_000001_create_catalog_tables {
    use super::columns::*;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Channels::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Channels::Id))
                        .col(&mut text(Channels::Name))
                        .col(ColumnDef::new(Channels::Slug).string().not_null().unique_key())
                        .col(&mut text(Channels::Currency))
                        .col(&mut text(Channels::DefaultCountry))
                        .col(&mut flag(Channels::AutomaticallyConfirmAllNewOrders))
                        .col(&mut flag(Channels::CapturePaymentsOnCheckout))
                        .col(&mut flag(Channels::AutomaticallyCaptureAuthorizedPayments))
                        .col(&mut flag(Channels::AllowUnpaidOrders))
                        .col(&mut text(Channels::AllocationStrategy))
                        .col(&mut timestamp_tz(Channels::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Warehouses::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Warehouses::Id))
                        .col(&mut text(Warehouses::Name))
                        .col(&mut text(Warehouses::CountryCode))
                        .col(&mut text(Warehouses::City))
                        .col(&mut text(Warehouses::ClickAndCollect))
                        .col(&mut timestamp_tz(Warehouses::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ChannelWarehouses::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(ChannelWarehouses::Id))
                        .col(&mut uuid_col(ChannelWarehouses::ChannelId))
                        .col(&mut uuid_col(ChannelWarehouses::WarehouseId))
                        .col(&mut int(ChannelWarehouses::SortOrder))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_channel_warehouses_channel_id")
                                .from(ChannelWarehouses::Table, ChannelWarehouses::ChannelId)
                                .to(Channels::Table, Channels::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_channel_warehouses_warehouse_id")
                                .from(ChannelWarehouses::Table, ChannelWarehouses::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_channel_warehouses_unique")
                        .table(ChannelWarehouses::Table)
                        .col(ChannelWarehouses::ChannelId)
                        .col(ChannelWarehouses::WarehouseId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductVariants::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(ProductVariants::Id))
                        .col(ColumnDef::new(ProductVariants::Sku).string().not_null().unique_key())
                        .col(&mut text(ProductVariants::Name))
                        .col(&mut text(ProductVariants::ProductName))
                        .col(&mut flag(ProductVariants::TrackInventory))
                        .col(&mut flag(ProductVariants::RequiresShipping))
                        .col(&mut flag(ProductVariants::IsGiftCard))
                        .col(&mut flag(ProductVariants::IsPreorder))
                        .col(ColumnDef::new(ProductVariants::PreorderGlobalThreshold).integer().null())
                        .col(&mut int(ProductVariants::PreorderGlobalSoldUnits))
                        .col(
                            ColumnDef::new(ProductVariants::PreorderEndDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(&mut timestamp_tz(ProductVariants::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(VariantChannelListings::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(VariantChannelListings::Id))
                        .col(&mut uuid_col(VariantChannelListings::VariantId))
                        .col(&mut uuid_col(VariantChannelListings::ChannelId))
                        .col(&mut money(VariantChannelListings::PriceAmount))
                        .col(&mut text(VariantChannelListings::Currency))
                        .col(&mut flag(VariantChannelListings::IsAvailableForPurchase))
                        .col(
                            ColumnDef::new(VariantChannelListings::PreorderQuantityThreshold)
                                .integer()
                                .null(),
                        )
                        .col(&mut int(VariantChannelListings::PreorderSoldUnits))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_variant_channel_listings_variant_id")
                                .from(VariantChannelListings::Table, VariantChannelListings::VariantId)
                                .to(ProductVariants::Table, ProductVariants::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_variant_channel_listings_channel_id")
                                .from(VariantChannelListings::Table, VariantChannelListings::ChannelId)
                                .to(Channels::Table, Channels::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_variant_channel_listings_unique")
                        .table(VariantChannelListings::Table)
                        .col(VariantChannelListings::VariantId)
                        .col(VariantChannelListings::ChannelId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShippingMethods::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(ShippingMethods::Id))
                        .col(&mut uuid_col(ShippingMethods::ChannelId))
                        .col(&mut text(ShippingMethods::Name))
                        .col(&mut money(ShippingMethods::Price))
                        .col(&mut text(ShippingMethods::Countries))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Vouchers::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Vouchers::Id))
                        .col(&mut uuid_col(Vouchers::ChannelId))
                        .col(ColumnDef::new(Vouchers::Code).string().not_null().unique_key())
                        .col(&mut text(Vouchers::Name))
                        .col(&mut text(Vouchers::DiscountValueType))
                        .col(&mut money(Vouchers::Value))
                        .col(&mut money_null(Vouchers::MinSpent))
                        .col(ColumnDef::new(Vouchers::UsageLimit).integer().null())
                        .col(&mut int(Vouchers::Used))
                        .col(&mut flag(Vouchers::IsActive))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(GiftCards::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(GiftCards::Id))
                        .col(ColumnDef::new(GiftCards::Code).string().not_null().unique_key())
                        .col(&mut uuid_null(GiftCards::BoughtInOrderId))
                        .col(&mut money(GiftCards::InitialBalance))
                        .col(&mut flag(GiftCards::IsActive))
                        .col(&mut timestamp_tz(GiftCards::CreatedAt))
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                GiftCards::Table.into_iden(),
                Vouchers::Table.into_iden(),
                ShippingMethods::Table.into_iden(),
                VariantChannelListings::Table.into_iden(),
                ProductVariants::Table.into_iden(),
                ChannelWarehouses::Table.into_iden(),
                Warehouses::Table.into_iden(),
                Channels::Table.into_iden(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Channels {
        Table,
        Id,
        Name,
        Slug,
        Currency,
        DefaultCountry,
        AutomaticallyConfirmAllNewOrders,
        CapturePaymentsOnCheckout,
        AutomaticallyCaptureAuthorizedPayments,
        AllowUnpaidOrders,
        AllocationStrategy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Warehouses {
        Table,
        Id,
        Name,
        CountryCode,
        City,
        ClickAndCollect,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ChannelWarehouses {
        Table,
        Id,
        ChannelId,
        WarehouseId,
        SortOrder,
    }

    #[derive(DeriveIden)]
    pub(super) enum ProductVariants {
        Table,
        Id,
        Sku,
        Name,
        ProductName,
        TrackInventory,
        RequiresShipping,
        IsGiftCard,
        IsPreorder,
        PreorderGlobalThreshold,
        PreorderGlobalSoldUnits,
        PreorderEndDate,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum VariantChannelListings {
        Table,
        Id,
        VariantId,
        ChannelId,
        PriceAmount,
        Currency,
        IsAvailableForPurchase,
        PreorderQuantityThreshold,
        PreorderSoldUnits,
    }

    #[derive(DeriveIden)]
    enum ShippingMethods {
        Table,
        Id,
        ChannelId,
        Name,
        Price,
        Countries,
    }

    #[derive(DeriveIden)]
    enum Vouchers {
        Table,
        Id,
        ChannelId,
        Code,
        Name,
        DiscountValueType,
        Value,
        MinSpent,
        UsageLimit,
        Used,
        IsActive,
    }

    #[derive(DeriveIden)]
    enum GiftCards {
        Table,
        Id,
        Code,
        BoughtInOrderId,
        InitialBalance,
        IsActive,
        CreatedAt,
    }
}

mod m20240101_000002_create_stock_tables {
    use super::columns::*;
    use super::m20240101_000001_create_catalog_tables::{ProductVariants, Warehouses};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Stocks::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Stocks::Id))
                        .col(&mut uuid_col(Stocks::WarehouseId))
                        .col(&mut uuid_col(Stocks::VariantId))
                        .col(&mut int(Stocks::Quantity))
                        .col(&mut int(Stocks::QuantityAllocated))
                        .col(&mut timestamp_tz(Stocks::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stocks_warehouse_id")
                                .from(Stocks::Table, Stocks::WarehouseId)
                                .to(Warehouses::Table, Warehouses::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stocks_variant_id")
                                .from(Stocks::Table, Stocks::VariantId)
                                .to(ProductVariants::Table, ProductVariants::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stocks_warehouse_variant")
                        .table(Stocks::Table)
                        .col(Stocks::WarehouseId)
                        .col(Stocks::VariantId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Stocks::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Stocks {
        Table,
        Id,
        WarehouseId,
        VariantId,
        Quantity,
        QuantityAllocated,
        UpdatedAt,
    }
}

mod m20240101_000003_create_checkout_tables {
    use super::columns::*;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_checkout_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Checkouts::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Checkouts::Token))
                        .col(&mut uuid_col(Checkouts::ChannelId))
                        .col(&mut uuid_null(Checkouts::UserId))
                        .col(&mut text_null(Checkouts::Email))
                        .col(&mut text(Checkouts::Currency))
                        .col(&mut text(Checkouts::Country))
                        .col(&mut json_null(Checkouts::ShippingAddress))
                        .col(&mut json_null(Checkouts::BillingAddress))
                        .col(&mut uuid_null(Checkouts::ShippingMethodId))
                        .col(&mut uuid_null(Checkouts::CollectionPointId))
                        .col(&mut text_null(Checkouts::VoucherCode))
                        .col(&mut money(Checkouts::DiscountAmount))
                        .col(&mut text(Checkouts::CustomerNote))
                        .col(&mut timestamp_tz(Checkouts::CreatedAt))
                        .col(&mut timestamp_tz(Checkouts::LastChange))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CheckoutLines::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(CheckoutLines::Id))
                        .col(&mut uuid_col(CheckoutLines::CheckoutToken))
                        .col(&mut uuid_col(CheckoutLines::VariantId))
                        .col(&mut int(CheckoutLines::Quantity))
                        .col(&mut timestamp_tz(CheckoutLines::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_checkout_lines_checkout_token")
                                .from(CheckoutLines::Table, CheckoutLines::CheckoutToken)
                                .to(Checkouts::Table, Checkouts::Token)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Checkouts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Checkouts {
        Table,
        Token,
        ChannelId,
        UserId,
        Email,
        Currency,
        Country,
        ShippingAddress,
        BillingAddress,
        ShippingMethodId,
        CollectionPointId,
        VoucherCode,
        DiscountAmount,
        CustomerNote,
        CreatedAt,
        LastChange,
    }

    #[derive(DeriveIden)]
    enum CheckoutLines {
        Table,
        Id,
        CheckoutToken,
        VariantId,
        Quantity,
        CreatedAt,
    }
}

mod m20240101_000004_create_order_tables {
    use super::columns::*;
    use super::m20240101_000002_create_stock_tables::Stocks;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Orders::Id))
                        .col(ColumnDef::new(Orders::Number).big_integer().not_null().unique_key())
                        .col(&mut text(Orders::Status))
                        .col(&mut text(Orders::Origin))
                        .col(&mut uuid_null(Orders::OriginalId))
                        .col(&mut uuid_col(Orders::ChannelId))
                        .col(ColumnDef::new(Orders::CheckoutToken).uuid().null().unique_key())
                        .col(&mut uuid_null(Orders::UserId))
                        .col(&mut text_null(Orders::UserEmail))
                        .col(&mut text(Orders::Currency))
                        .col(&mut json_null(Orders::ShippingAddress))
                        .col(&mut json_null(Orders::BillingAddress))
                        .col(&mut uuid_null(Orders::ShippingMethodId))
                        .col(&mut text_null(Orders::ShippingMethodName))
                        .col(&mut uuid_null(Orders::CollectionPointId))
                        .col(&mut text_null(Orders::CollectionPointName))
                        .col(&mut money(Orders::BaseShippingPrice))
                        .col(&mut money(Orders::ShippingPriceNet))
                        .col(&mut money(Orders::ShippingPriceGross))
                        .col(&mut money(Orders::UndiscountedTotalNet))
                        .col(&mut money(Orders::UndiscountedTotalGross))
                        .col(&mut money(Orders::SubtotalNet))
                        .col(&mut money(Orders::SubtotalGross))
                        .col(&mut money(Orders::TotalNet))
                        .col(&mut money(Orders::TotalGross))
                        .col(&mut money(Orders::TotalCharged))
                        .col(&mut text(Orders::CustomerNote))
                        .col(&mut int(Orders::Version))
                        .col(&mut timestamp_tz(Orders::CreatedAt))
                        .col(&mut timestamp_tz(Orders::UpdatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderLines::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(OrderLines::Id))
                        .col(&mut uuid_col(OrderLines::OrderId))
                        .col(&mut uuid_null(OrderLines::VariantId))
                        .col(&mut text(OrderLines::ProductName))
                        .col(&mut text(OrderLines::VariantName))
                        .col(&mut text(OrderLines::ProductSku))
                        .col(&mut int(OrderLines::Quantity))
                        .col(&mut int(OrderLines::QuantityFulfilled))
                        .col(&mut flag(OrderLines::IsShippingRequired))
                        .col(&mut flag(OrderLines::IsGiftCard))
                        .col(&mut text(OrderLines::Currency))
                        .col(&mut money(OrderLines::BaseUnitPrice))
                        .col(&mut money(OrderLines::UndiscountedUnitPriceNet))
                        .col(&mut money(OrderLines::UndiscountedUnitPriceGross))
                        .col(&mut money(OrderLines::UnitPriceNet))
                        .col(&mut money(OrderLines::UnitPriceGross))
                        .col(&mut money(OrderLines::TotalPriceNet))
                        .col(&mut money(OrderLines::TotalPriceGross))
                        .col(&mut text_null(OrderLines::UnitDiscountType))
                        .col(&mut money(OrderLines::UnitDiscountValue))
                        .col(&mut money(OrderLines::UnitDiscountAmount))
                        .col(&mut text_null(OrderLines::UnitDiscountReason))
                        .col(&mut timestamp_tz(OrderLines::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_lines_order_id")
                                .from(OrderLines::Table, OrderLines::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderDiscounts::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(OrderDiscounts::Id))
                        .col(&mut uuid_col(OrderDiscounts::OrderId))
                        .col(&mut text(OrderDiscounts::DiscountType))
                        .col(&mut text(OrderDiscounts::ValueType))
                        .col(&mut money(OrderDiscounts::Value))
                        .col(&mut money(OrderDiscounts::Amount))
                        .col(&mut text_null(OrderDiscounts::Name))
                        .col(&mut text_null(OrderDiscounts::Reason))
                        .col(&mut text_null(OrderDiscounts::VoucherCode))
                        .col(&mut timestamp_tz(OrderDiscounts::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_discounts_order_id")
                                .from(OrderDiscounts::Table, OrderDiscounts::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Allocations::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Allocations::Id))
                        .col(&mut uuid_col(Allocations::OrderLineId))
                        .col(&mut uuid_col(Allocations::StockId))
                        .col(&mut int(Allocations::QuantityAllocated))
                        .col(&mut timestamp_tz(Allocations::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_order_line_id")
                                .from(Allocations::Table, Allocations::OrderLineId)
                                .to(OrderLines::Table, OrderLines::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_stock_id")
                                .from(Allocations::Table, Allocations::StockId)
                                .to(Stocks::Table, Stocks::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_allocations_stock_order_line")
                        .table(Allocations::Table)
                        .col(Allocations::StockId)
                        .col(Allocations::OrderLineId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PreorderAllocations::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(PreorderAllocations::Id))
                        .col(&mut uuid_col(PreorderAllocations::OrderLineId))
                        .col(&mut uuid_col(PreorderAllocations::VariantChannelListingId))
                        .col(&mut int(PreorderAllocations::Quantity))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_preorder_allocations_order_line_id")
                                .from(PreorderAllocations::Table, PreorderAllocations::OrderLineId)
                                .to(OrderLines::Table, OrderLines::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // No foreign key: the log outlives deleted drafts.
            manager
                .create_table(
                    Table::create()
                        .table(OrderEvents::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(OrderEvents::Id))
                        .col(&mut uuid_col(OrderEvents::OrderId))
                        .col(ColumnDef::new(OrderEvents::EventType).string_len(64).not_null())
                        .col(&mut uuid_null(OrderEvents::UserId))
                        .col(&mut uuid_null(OrderEvents::AppId))
                        .col(ColumnDef::new(OrderEvents::Parameters).json().not_null())
                        .col(&mut timestamp_tz(OrderEvents::Date))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_events_order_id")
                        .table(OrderEvents::Table)
                        .col(OrderEvents::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Invoices::Id))
                        .col(&mut uuid_col(Invoices::OrderId))
                        .col(&mut text_null(Invoices::Number))
                        .col(&mut text_null(Invoices::ExternalUrl))
                        .col(&mut text(Invoices::Status))
                        .col(&mut timestamp_tz(Invoices::CreatedAt))
                        .col(&mut timestamp_tz(Invoices::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_order_id")
                                .from(Invoices::Table, Invoices::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            for table in [
                Invoices::Table.into_iden(),
                OrderEvents::Table.into_iden(),
                PreorderAllocations::Table.into_iden(),
                Allocations::Table.into_iden(),
                OrderDiscounts::Table.into_iden(),
                OrderLines::Table.into_iden(),
                Orders::Table.into_iden(),
            ] {
                manager
                    .drop_table(Table::drop().table(table).if_exists().to_owned())
                    .await?;
            }
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        Number,
        Status,
        Origin,
        OriginalId,
        ChannelId,
        CheckoutToken,
        UserId,
        UserEmail,
        Currency,
        ShippingAddress,
        BillingAddress,
        ShippingMethodId,
        ShippingMethodName,
        CollectionPointId,
        CollectionPointName,
        BaseShippingPrice,
        ShippingPriceNet,
        ShippingPriceGross,
        UndiscountedTotalNet,
        UndiscountedTotalGross,
        SubtotalNet,
        SubtotalGross,
        TotalNet,
        TotalGross,
        TotalCharged,
        CustomerNote,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum OrderLines {
        Table,
        Id,
        OrderId,
        VariantId,
        ProductName,
        VariantName,
        ProductSku,
        Quantity,
        QuantityFulfilled,
        IsShippingRequired,
        IsGiftCard,
        Currency,
        BaseUnitPrice,
        UndiscountedUnitPriceNet,
        UndiscountedUnitPriceGross,
        UnitPriceNet,
        UnitPriceGross,
        TotalPriceNet,
        TotalPriceGross,
        UnitDiscountType,
        UnitDiscountValue,
        UnitDiscountAmount,
        UnitDiscountReason,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderDiscounts {
        Table,
        Id,
        OrderId,
        DiscountType,
        ValueType,
        Value,
        Amount,
        Name,
        Reason,
        VoucherCode,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Allocations {
        Table,
        Id,
        OrderLineId,
        StockId,
        QuantityAllocated,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum PreorderAllocations {
        Table,
        Id,
        OrderLineId,
        VariantChannelListingId,
        Quantity,
    }

    #[derive(DeriveIden)]
    enum OrderEvents {
        Table,
        Id,
        OrderId,
        EventType,
        UserId,
        AppId,
        Parameters,
        Date,
    }

    #[derive(DeriveIden)]
    enum Invoices {
        Table,
        Id,
        OrderId,
        Number,
        ExternalUrl,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000005_create_fulfillment_tables {
    use super::columns::*;
    use super::m20240101_000004_create_order_tables::{OrderLines, Orders};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_fulfillment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Fulfillments::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Fulfillments::Id))
                        .col(&mut uuid_col(Fulfillments::OrderId))
                        .col(&mut int(Fulfillments::FulfillmentOrder))
                        .col(&mut text(Fulfillments::Status))
                        .col(&mut uuid_null(Fulfillments::WarehouseId))
                        .col(&mut text(Fulfillments::TrackingNumber))
                        .col(&mut money_null(Fulfillments::ShippingRefundAmount))
                        .col(&mut money_null(Fulfillments::TotalRefundAmount))
                        .col(&mut timestamp_tz(Fulfillments::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_fulfillments_order_id")
                                .from(Fulfillments::Table, Fulfillments::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_fulfillments_order_sequence")
                        .table(Fulfillments::Table)
                        .col(Fulfillments::OrderId)
                        .col(Fulfillments::FulfillmentOrder)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(FulfillmentLines::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(FulfillmentLines::Id))
                        .col(&mut uuid_col(FulfillmentLines::FulfillmentId))
                        .col(&mut uuid_col(FulfillmentLines::OrderLineId))
                        .col(&mut uuid_null(FulfillmentLines::StockId))
                        .col(&mut int(FulfillmentLines::Quantity))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_fulfillment_lines_fulfillment_id")
                                .from(FulfillmentLines::Table, FulfillmentLines::FulfillmentId)
                                .to(Fulfillments::Table, Fulfillments::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_fulfillment_lines_order_line_id")
                                .from(FulfillmentLines::Table, FulfillmentLines::OrderLineId)
                                .to(OrderLines::Table, OrderLines::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(FulfillmentLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Fulfillments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Fulfillments {
        Table,
        Id,
        OrderId,
        FulfillmentOrder,
        Status,
        WarehouseId,
        TrackingNumber,
        ShippingRefundAmount,
        TotalRefundAmount,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum FulfillmentLines {
        Table,
        Id,
        FulfillmentId,
        OrderLineId,
        StockId,
        Quantity,
    }
}

mod m20240101_000006_create_payment_tables {
    use super::columns::*;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_payment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(Payments::Id))
                        .col(&mut text(Payments::Gateway))
                        .col(&mut flag(Payments::IsActive))
                        .col(&mut flag(Payments::ToConfirm))
                        .col(&mut text(Payments::ChargeStatus))
                        .col(&mut text(Payments::Token))
                        .col(&mut money(Payments::Total))
                        .col(&mut money(Payments::CapturedAmount))
                        .col(&mut text(Payments::Currency))
                        .col(&mut uuid_null(Payments::CheckoutToken))
                        .col(&mut uuid_null(Payments::OrderId))
                        .col(&mut text_null(Payments::PspReference))
                        .col(&mut text_null(Payments::BillingEmail))
                        .col(&mut int(Payments::Version))
                        .col(&mut timestamp_tz(Payments::CreatedAt))
                        .col(&mut timestamp_tz(Payments::ModifiedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_id")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PaymentTransactions::Table)
                        .if_not_exists()
                        .col(&mut uuid_pk(PaymentTransactions::Id))
                        .col(&mut uuid_col(PaymentTransactions::PaymentId))
                        .col(&mut text(PaymentTransactions::Kind))
                        .col(&mut flag(PaymentTransactions::IsSuccess))
                        .col(&mut flag(PaymentTransactions::ActionRequired))
                        .col(&mut json_null(PaymentTransactions::ActionRequiredData))
                        .col(&mut money(PaymentTransactions::Amount))
                        .col(&mut text(PaymentTransactions::Currency))
                        .col(&mut text(PaymentTransactions::Token))
                        .col(&mut text_null(PaymentTransactions::Error))
                        .col(&mut flag(PaymentTransactions::AlreadyProcessed))
                        .col(ColumnDef::new(PaymentTransactions::GatewayResponse).json().not_null())
                        .col(&mut timestamp_tz(PaymentTransactions::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_transactions_payment_id")
                                .from(PaymentTransactions::Table, PaymentTransactions::PaymentId)
                                .to(Payments::Table, Payments::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentTransactions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        Gateway,
        IsActive,
        ToConfirm,
        ChargeStatus,
        Token,
        Total,
        CapturedAmount,
        Currency,
        CheckoutToken,
        OrderId,
        PspReference,
        BillingEmail,
        Version,
        CreatedAt,
        ModifiedAt,
    }

    #[derive(DeriveIden)]
    enum PaymentTransactions {
        Table,
        Id,
        PaymentId,
        Kind,
        IsSuccess,
        ActionRequired,
        ActionRequiredData,
        Amount,
        Currency,
        Token,
        Error,
        AlreadyProcessed,
        GatewayResponse,
        CreatedAt,
    }
}

#[cfg(test)]
mod tests {
    use super::columns::{money, money_null};
    use sea_orm_migration::prelude::*;

    #[test]
    fn money_columns_build_for_sqlite_and_postgres() {
        let table = Table::create()
            .table(Alias::new("ledger"))
            .col(money(Alias::new("amount")))
            .col(money_null(Alias::new("limit_amount")))
            .to_owned();

        let sqlite = table.to_string(SqliteQueryBuilder);
        assert!(sqlite.contains("amount"));
        let postgres = table.to_string(PostgresQueryBuilder);
        assert!(postgres.contains("decimal(16, 4)"));
    }
}
