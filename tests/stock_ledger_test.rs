//! Stock ledger behaviour against a real schema: reservations across
//! warehouses, oversell refusal, release and restock.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use order_engine::entities::order_line;
use order_engine::services::order_events::Actor;
use order_engine::services::orders::{DraftOrderCreate, OrderLineInput};
use order_engine::services::stock_ledger::{self, LineRequest, Reservation, ReservationContext};
use uuid::Uuid;

/// A draft holding the given lines; drafts never allocate on their own.
async fn draft_lines(app: &TestApp, lines: &[(Uuid, i32)]) -> Vec<order_line::Model> {
    app.services()
        .orders
        .draft_order_create(
            Actor::System,
            DraftOrderCreate {
                channel_id: app.catalog.channel.id,
                user_id: None,
                user_email: Some("staff@example.com".to_string()),
                shipping_address: None,
                billing_address: None,
                shipping_method_id: None,
                lines: lines
                    .iter()
                    .map(|(variant_id, quantity)| OrderLineInput {
                        variant_id: *variant_id,
                        quantity: *quantity,
                    })
                    .collect(),
                discount: None,
                customer_note: String::new(),
            },
        )
        .await
        .expect("create draft")
        .lines
}

fn requests(lines: &[order_line::Model]) -> Vec<LineRequest> {
    lines
        .iter()
        .map(|line| LineRequest {
            line_id: line.id,
            variant_id: line.variant_id.expect("line has a variant"),
            quantity: line.quantity,
        })
        .collect()
}

fn us_context(app: &TestApp) -> ReservationContext {
    ReservationContext::new(&app.catalog.channel, "US", None)
}

#[tokio::test]
async fn reserve_allocates_and_bumps_quantity_allocated() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 4)]).await;
    let db = &*app.state.db;

    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap();

    let allocations = assert_matches!(reservation, Reservation::Allocated(allocations) => allocations);
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].quantity_allocated, 4);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 10);
    assert_eq!(stock.quantity_allocated, 4);
    assert_eq!(stock_ledger::allocated_quantity(db, lines[0].id).await.unwrap(), 4);
}

#[tokio::test]
async fn reserve_refuses_oversell_without_writing() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 2), (app.catalog.mug.id, 4)]).await;
    let db = &*app.state.db;

    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap();

    let insufficient = assert_matches!(reservation, Reservation::Insufficient(i) => i);
    assert_eq!(insufficient.items.len(), 1);
    let item = &insufficient.items[0];
    assert_eq!(item.variant_id, app.catalog.mug.id);
    assert_eq!(item.requested, 4);
    assert_eq!(item.available, 3);

    // All or nothing: the shirt line that would have fit was not allocated either.
    let shirt = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(shirt.quantity_allocated, 0);
}

#[tokio::test]
async fn reserve_spills_over_into_the_next_warehouse() {
    let app = TestApp::new().await;
    app.add_stock(app.catalog.mug.id, app.catalog.backup_warehouse.id, 5)
        .await;
    let lines = draft_lines(&app, &[(app.catalog.mug.id, 6)]).await;
    let db = &*app.state.db;

    let allocations = stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(allocations.len(), 2);

    let local = app.stock(app.catalog.mug.id, app.catalog.warehouse.id).await;
    let backup = app.stock(app.catalog.mug.id, app.catalog.backup_warehouse.id).await;
    assert_eq!(local.quantity_allocated, 3, "the US warehouse is drained first");
    assert_eq!(backup.quantity_allocated, 3);
}

#[tokio::test]
async fn untracked_variants_are_never_short() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.gift_card.id, 500)]).await;
    let db = &*app.state.db;

    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap();
    assert_matches!(reservation, Reservation::Allocated(allocations) if allocations.is_empty());
    assert!(
        stock_ledger::check_availability(db, &us_context(&app), &requests(&lines))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn release_is_bounded_by_what_is_allocated() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 3)]).await;
    let db = &*app.state.db;
    stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(stock_ledger::release(db, lines[0].id, 2).await.unwrap(), 2);
    assert_eq!(stock_ledger::release(db, lines[0].id, 5).await.unwrap(), 1);
    assert_eq!(stock_ledger::release(db, lines[0].id, 5).await.unwrap(), 0);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity_allocated, 0);
}

#[tokio::test]
async fn available_quantity_ignores_allocated_units() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 7)]).await;
    let db = &*app.state.db;
    let ctx = us_context(&app);
    stock_ledger::reserve(db, &ctx, &requests(&lines))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(
        stock_ledger::available_quantity(db, &ctx, app.catalog.shirt.id)
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        stock_ledger::available_quantity(db, &ctx, app.catalog.gift_card.id)
            .await
            .unwrap(),
        i32::MAX
    );
}

#[tokio::test]
async fn transfer_moves_an_allocation_between_warehouses() {
    let app = TestApp::new().await;
    app.add_stock(app.catalog.shirt.id, app.catalog.backup_warehouse.id, 4)
        .await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 2)]).await;
    let db = &*app.state.db;
    let allocations = stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let moved = stock_ledger::transfer(db, allocations[0].id, app.catalog.backup_warehouse.id)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(moved[0].quantity_allocated, 2);

    let local = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    let backup = app.stock(app.catalog.shirt.id, app.catalog.backup_warehouse.id).await;
    assert_eq!(local.quantity_allocated, 0);
    assert_eq!(backup.quantity_allocated, 2);
}

#[tokio::test]
async fn decrease_stock_consumes_the_allocation() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.shirt.id, 2)]).await;
    let db = &*app.state.db;
    stock_ledger::reserve(db, &us_context(&app), &requests(&lines))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let stock = stock_ledger::decrease_stock(
        db,
        lines[0].id,
        app.catalog.shirt.id,
        app.catalog.warehouse.id,
        2,
        false,
    )
    .await
    .unwrap()
    .expect("tracked variant has stock");
    assert_eq!(stock.quantity, 8);
    assert_eq!(stock.quantity_allocated, 0);
}

#[tokio::test]
async fn decrease_stock_without_room_is_refused_unless_allowed() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.mug.id, 5)]).await;
    let db = &*app.state.db;

    let refused = stock_ledger::decrease_stock(
        db,
        lines[0].id,
        app.catalog.mug.id,
        app.catalog.warehouse.id,
        5,
        false,
    )
    .await;
    assert!(refused.is_err());

    let forced = stock_ledger::decrease_stock(
        db,
        lines[0].id,
        app.catalog.mug.id,
        app.catalog.warehouse.id,
        5,
        true,
    )
    .await
    .unwrap()
    .expect("stock row");
    assert_eq!(forced.quantity, 0);
}

#[tokio::test]
async fn increase_stock_can_allocate_the_restocked_units() {
    let app = TestApp::new().await;
    let lines = draft_lines(&app, &[(app.catalog.mug.id, 2)]).await;
    let db = &*app.state.db;

    let stock = stock_ledger::increase_stock(
        db,
        app.catalog.mug.id,
        app.catalog.backup_warehouse.id,
        2,
        Some(lines[0].id),
    )
    .await
    .unwrap();
    assert_eq!(stock.quantity, 2);
    assert_eq!(stock.quantity_allocated, 2);
    assert_eq!(stock_ledger::allocated_quantity(db, lines[0].id).await.unwrap(), 2);
}

#[tokio::test]
async fn unknown_variants_are_reported_short() {
    let app = TestApp::new().await;
    let db = &*app.state.db;
    let missing = LineRequest {
        line_id: Uuid::new_v4(),
        variant_id: Uuid::new_v4(),
        quantity: 1,
    };

    let reservation = stock_ledger::reserve(db, &us_context(&app), &[missing])
        .await
        .unwrap();

    let insufficient = assert_matches!(reservation, Reservation::Insufficient(short) => short);
    assert_eq!(insufficient.items.len(), 1);
    assert_eq!(insufficient.items[0].variant_id, missing.variant_id);
    assert_eq!(insufficient.items[0].line_id, Some(missing.line_id));
    assert_eq!(insufficient.items[0].available, 0);

    let available = stock_ledger::check_availability(db, &us_context(&app), &[missing])
        .await
        .unwrap();
    assert!(available.is_some());
}

#[tokio::test]
async fn preorders_are_capped_by_channel_and_global_thresholds() {
    let app = TestApp::new().await;
    let db = &*app.state.db;
    let console = app
        .seed_preorder_variant("Console", rust_decimal_macros::dec!(300), Some(5), Some(4))
        .await;

    let first = draft_lines(&app, &[(console.id, 3)]).await;
    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&first))
        .await
        .unwrap();
    assert_matches!(reservation, Reservation::Allocated(_));
    assert_eq!(stock_ledger::allocated_quantity(db, first[0].id).await.unwrap(), 3);
    assert_eq!(app.listing(console.id).await.preorder_sold_units, 3);
    assert_eq!(app.variant(console.id).await.preorder_global_sold_units, 3);

    // Channel still has 2 left, the global cap only 1.
    let second = draft_lines(&app, &[(console.id, 2)]).await;
    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&second))
        .await
        .unwrap();
    let insufficient = assert_matches!(reservation, Reservation::Insufficient(short) => short);
    assert_eq!(insufficient.items[0].available, 1);
    assert_eq!(insufficient.items[0].warehouse_id, None);
    assert_eq!(insufficient.line_ids(), vec![second[0].id]);
    assert_eq!(app.listing(console.id).await.preorder_sold_units, 3);

    let released = stock_ledger::release(db, first[0].id, 2).await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(stock_ledger::allocated_quantity(db, first[0].id).await.unwrap(), 1);
    assert_eq!(app.listing(console.id).await.preorder_sold_units, 1);
    assert_eq!(app.variant(console.id).await.preorder_global_sold_units, 1);

    let reservation = stock_ledger::reserve(db, &us_context(&app), &requests(&second))
        .await
        .unwrap();
    assert_matches!(reservation, Reservation::Allocated(_));
    assert_eq!(app.variant(console.id).await.preorder_global_sold_units, 3);
}
