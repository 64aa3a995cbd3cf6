//! Fulfilling, approving, canceling, refunding and returning order lines.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use order_engine::entities::fulfillment::FulfillmentStatus;
use order_engine::entities::gift_card;
use order_engine::entities::order::{OrderOrigin, OrderStatus};
use order_engine::entities::payment::ChargeStatus;
use order_engine::errors::ServiceError;
use order_engine::services::checkout::CheckoutCompletion;
use order_engine::services::fulfillments::{
    FulfillInput, FulfillLine, FulfillStock, FulfillmentLineQuantity, FulfillmentResult,
    OrderLineQuantity, RefundProductsInput, ReturnProductsInput,
};
use order_engine::services::order_events::Actor;
use order_engine::services::orders::{DraftOrderCreate, OrderDetails, OrderLineInput};
use order_engine::services::stock_ledger;
use order_engine::services::EngineSettings;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

fn ship(order_line_id: Uuid, warehouse_id: Uuid, quantity: i32) -> FulfillLine {
    FulfillLine {
        order_line_id,
        stocks: vec![FulfillStock {
            warehouse_id,
            quantity,
        }],
    }
}

fn fulfill_input(lines: Vec<FulfillLine>, approved: Option<bool>) -> FulfillInput {
    FulfillInput {
        lines,
        notify_customer: true,
        allow_stock_to_be_exceeded: false,
        approved,
    }
}

async fn fulfill(app: &TestApp, order: &OrderDetails, quantity: i32) -> FulfillmentResult {
    app.services()
        .fulfillments
        .create_fulfillments(
            Actor::System,
            order.order.id,
            fulfill_input(
                vec![ship(order.lines[0].id, app.catalog.warehouse.id, quantity)],
                None,
            ),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn fulfilling_ships_stock_and_derives_the_status() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 3)]).await;
    app.notifier.clear();

    let partial = fulfill(&app, &order, 2).await;
    assert_eq!(partial.order.order.status, OrderStatus::PartiallyFulfilled);
    assert_eq!(partial.fulfillments.len(), 1);
    assert_eq!(partial.fulfillments[0].fulfillment.status, FulfillmentStatus::Fulfilled);
    assert_eq!(partial.fulfillments[0].fulfillment.fulfillment_order, 1);
    assert_eq!(partial.order.lines[0].quantity_fulfilled, 2);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 8);
    assert_eq!(stock.quantity_allocated, 1);

    let rest = fulfill(&app, &order, 1).await;
    assert_eq!(rest.order.order.status, OrderStatus::Fulfilled);
    assert_eq!(rest.fulfillments[0].fulfillment.fulfillment_order, 2);

    assert_eq!(
        app.notifier.names(),
        vec!["fulfillment_created", "fulfillment_created", "order_fulfilled"]
    );
    let events = app.event_types(order.order.id).await;
    assert_eq!(
        events.iter().filter(|e| *e == "fulfillment_fulfilled_items").count(),
        2
    );
}

#[tokio::test]
async fn over_fulfilling_a_line_is_refused() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 1)]).await;

    assert_matches!(
        app.services()
            .fulfillments
            .create_fulfillments(
                Actor::System,
                order.order.id,
                fulfill_input(vec![ship(order.lines[0].id, app.catalog.warehouse.id, 2)], None),
            )
            .await,
        Err(ServiceError::InvalidField { field, .. }) if field == "order_line_id"
    );
    assert_matches!(
        app.services()
            .fulfillments
            .create_fulfillments(
                Actor::System,
                order.order.id,
                fulfill_input(vec![ship(order.lines[0].id, app.catalog.warehouse.id, 0)], None),
            )
            .await,
        Err(ServiceError::InvalidField { field, .. }) if field == "lines"
    );
}

#[tokio::test]
async fn fulfillments_can_wait_for_approval() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    let fulfillments = &app.services().fulfillments;

    let waiting = fulfillments
        .create_fulfillments(
            Actor::System,
            order.order.id,
            fulfill_input(
                vec![ship(order.lines[0].id, app.catalog.warehouse.id, 2)],
                Some(false),
            ),
        )
        .await
        .unwrap();
    let fulfillment_id = waiting.fulfillments[0].fulfillment.id;
    assert_eq!(
        waiting.fulfillments[0].fulfillment.status,
        FulfillmentStatus::WaitingForApproval
    );
    // Nothing leaves the shelf until approval.
    assert_eq!(waiting.order.order.status, OrderStatus::Unfulfilled);
    assert_eq!(
        app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await.quantity,
        10
    );

    let approved = fulfillments
        .approve(Actor::System, fulfillment_id, false, true)
        .await
        .unwrap();
    assert_eq!(approved.fulfillments[0].fulfillment.status, FulfillmentStatus::Fulfilled);
    assert_eq!(approved.order.order.status, OrderStatus::Fulfilled);
    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 8);
    assert_eq!(stock.quantity_allocated, 0);

    // Approving again is a no-op.
    let again = fulfillments
        .approve(Actor::System, fulfillment_id, false, true)
        .await
        .unwrap();
    assert_eq!(again.fulfillments[0].fulfillment.status, FulfillmentStatus::Fulfilled);
    assert_eq!(
        app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await.quantity,
        8
    );

    let events = app.event_types(order.order.id).await;
    assert!(events.contains(&"fulfillment_awaits_approval".to_string()));
    assert_eq!(
        events.iter().filter(|e| *e == "fulfillment_approved").count(),
        1
    );
}

#[tokio::test]
async fn auto_approval_follows_the_engine_settings() {
    let app = TestApp::with_settings(
        Default::default(),
        EngineSettings {
            fulfillment_auto_approve: false,
            ..Default::default()
        },
    )
    .await;
    let order = app.place_order(&[(app.catalog.mug.id, 1)]).await;
    let result = fulfill(&app, &order, 1).await;
    assert_eq!(
        result.fulfillments[0].fulfillment.status,
        FulfillmentStatus::WaitingForApproval
    );
}

#[tokio::test]
async fn unpaid_orders_are_not_fulfilled_unless_allowed() {
    let app = TestApp::with_settings(
        common::ChannelFlags {
            allow_unpaid_orders: true,
            ..Default::default()
        },
        EngineSettings {
            fulfillment_allow_unpaid: false,
            ..Default::default()
        },
    )
    .await;
    let checkout = app.ready_checkout(&[(app.catalog.mug.id, 1)]).await;
    let order = match app
        .services()
        .checkout
        .complete(Actor::System, checkout.checkout.token)
        .await
        .unwrap()
    {
        order_engine::services::checkout::CheckoutCompletion::Completed { order } => order,
        other => panic!("unexpected completion {other:?}"),
    };

    assert_matches!(
        app.services()
            .fulfillments
            .create_fulfillments(
                Actor::System,
                order.order.id,
                fulfill_input(vec![ship(order.lines[0].id, app.catalog.warehouse.id, 1)], None),
            )
            .await,
        Err(ServiceError::InvalidOperation(_))
    );
}

#[tokio::test]
async fn canceling_a_waiting_fulfillment_only_unfulfills_lines() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    let fulfillments = &app.services().fulfillments;
    let waiting = fulfillments
        .create_fulfillments(
            Actor::System,
            order.order.id,
            fulfill_input(
                vec![ship(order.lines[0].id, app.catalog.warehouse.id, 2)],
                Some(false),
            ),
        )
        .await
        .unwrap();
    app.notifier.clear();

    let canceled = fulfillments
        .cancel(Actor::System, waiting.fulfillments[0].fulfillment.id, None)
        .await
        .unwrap();
    assert_eq!(canceled.fulfillments[0].fulfillment.status, FulfillmentStatus::Canceled);
    assert_eq!(canceled.order.lines[0].quantity_fulfilled, 0);
    assert_eq!(canceled.order.order.status, OrderStatus::Unfulfilled);
    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 10);
    assert_eq!(stock.quantity_allocated, 2);
    assert_eq!(app.notifier.names(), vec!["fulfillment_canceled"]);

    // Once canceled it stays canceled.
    assert_matches!(
        fulfillments
            .cancel(Actor::System, waiting.fulfillments[0].fulfillment.id, None)
            .await,
        Err(ServiceError::InvalidOperation(_))
    );
}

#[tokio::test]
async fn canceling_a_shipped_fulfillment_restocks_into_a_warehouse() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    let shipped = fulfill(&app, &order, 2).await;
    let fulfillment_id = shipped.fulfillments[0].fulfillment.id;
    let fulfillments = &app.services().fulfillments;

    assert_matches!(
        fulfillments.cancel(Actor::System, fulfillment_id, None).await,
        Err(ServiceError::DeliveryMethodNotApplicable { .. })
    );

    let canceled = fulfillments
        .cancel(Actor::System, fulfillment_id, Some(app.catalog.warehouse.id))
        .await
        .unwrap();
    assert_eq!(canceled.order.order.status, OrderStatus::Unfulfilled);

    // Restocked units are allocated back to the line they were shipped for.
    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 10);
    assert_eq!(stock.quantity_allocated, 2);
    assert_eq!(
        stock_ledger::allocated_quantity(&*app.state.db, order.lines[0].id)
            .await
            .unwrap(),
        2
    );

    let events = app.event_types(order.order.id).await;
    assert_eq!(
        &events[events.len() - 2..],
        ["fulfillment_canceled", "fulfillment_restocked_items"]
    );
}

#[tokio::test]
async fn tracking_numbers_are_recorded() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.mug.id, 1)]).await;
    let shipped = fulfill(&app, &order, 1).await;

    let tracked = app
        .services()
        .fulfillments
        .update_tracking(
            Actor::System,
            shipped.fulfillments[0].fulfillment.id,
            " 1Z999AA10123456784 ".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(tracked.fulfillment.tracking_number, "1Z999AA10123456784");
    assert_eq!(
        app.event_types(order.order.id).await.last().map(String::as_str),
        Some("tracking_updated")
    );
}

#[tokio::test]
async fn refunding_unfulfilled_lines_releases_them_and_pays_back() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    app.notifier.clear();

    let refunded = app
        .services()
        .fulfillments
        .refund_products(
            Actor::System,
            order.order.id,
            RefundProductsInput {
                order_lines: vec![OrderLineQuantity {
                    order_line_id: order.lines[0].id,
                    quantity: 1,
                    replace: false,
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fulfillment = &refunded.fulfillments[0].fulfillment;
    assert_eq!(fulfillment.status, FulfillmentStatus::Refunded);
    assert_eq!(fulfillment.total_refund_amount, Some(dec!(10.00)));
    assert_eq!(fulfillment.warehouse_id, None);
    assert_eq!(refunded.order.order.total_charged, dec!(15.00));
    assert_eq!(
        refunded.order.payments[0].charge_status,
        ChargeStatus::PartiallyRefunded
    );
    assert_eq!(
        app.stock(app.catalog.shirt.id, app.catalog.warehouse.id)
            .await
            .quantity_allocated,
        1
    );
    assert_eq!(app.notifier.names(), vec!["order_refunded"]);

    // The refunded unit no longer counts: shipping the last one completes the order.
    let shipped = fulfill(&app, &refunded.order, 1).await;
    assert_eq!(shipped.order.order.status, OrderStatus::Fulfilled);
}

#[tokio::test]
async fn refunds_can_include_shipping_or_name_an_amount() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    let shipped = fulfill(&app, &order, 2).await;
    let fulfillment_line_id = shipped.fulfillments[0].lines[0].id;
    let fulfillments = &app.services().fulfillments;

    let with_shipping = fulfillments
        .refund_products(
            Actor::System,
            order.order.id,
            RefundProductsInput {
                fulfillment_lines: vec![FulfillmentLineQuantity {
                    fulfillment_line_id,
                    quantity: 1,
                    replace: false,
                }],
                include_shipping_costs: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let fulfillment = &with_shipping.fulfillments[0].fulfillment;
    assert_eq!(fulfillment.total_refund_amount, Some(dec!(15.00)));
    assert_eq!(fulfillment.shipping_refund_amount, Some(dec!(5.00)));
    assert_eq!(with_shipping.order.order.total_charged, dec!(10.00));

    let named = fulfillments
        .refund_products(
            Actor::System,
            order.order.id,
            RefundProductsInput {
                fulfillment_lines: vec![FulfillmentLineQuantity {
                    fulfillment_line_id,
                    quantity: 1,
                    replace: false,
                }],
                amount_to_refund: Some(dec!(100.00)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Capped by what is left on the payment.
    assert_eq!(named.fulfillments[0].fulfillment.total_refund_amount, Some(dec!(10.00)));
    assert_eq!(named.order.order.total_charged, dec!(0));
    assert_eq!(named.order.payments[0].charge_status, ChargeStatus::FullyRefunded);
}

#[tokio::test]
async fn returning_shipped_lines_restocks_and_refunds() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    let shipped = fulfill(&app, &order, 2).await;
    app.notifier.clear();

    let returned = app
        .services()
        .fulfillments
        .return_products(
            Actor::System,
            order.order.id,
            ReturnProductsInput {
                fulfillment_lines: vec![FulfillmentLineQuantity {
                    fulfillment_line_id: shipped.fulfillments[0].lines[0].id,
                    quantity: 2,
                    replace: false,
                }],
                refund: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(returned.order.order.status, OrderStatus::Returned);
    assert!(returned.replace_order.is_none());
    let fulfillment = &returned.fulfillments[0];
    assert_eq!(fulfillment.fulfillment.status, FulfillmentStatus::RefundedAndReturned);
    assert_eq!(fulfillment.fulfillment.total_refund_amount, Some(dec!(20.00)));
    assert_eq!(fulfillment.lines[0].quantity, 2);

    // The emptied source fulfillment is gone.
    assert!(returned
        .order
        .fulfillments
        .iter()
        .all(|details| details.fulfillment.id != shipped.fulfillments[0].fulfillment.id));

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 10);
    assert_eq!(stock.quantity_allocated, 0);
    assert_eq!(app.notifier.names(), vec!["order_refunded", "order_returned"]);

    let events = app.event_types(order.order.id).await;
    assert_eq!(
        &events[events.len() - 3..],
        ["payment_refunded", "fulfillment_returned", "fulfillment_refunded"]
    );
}

#[tokio::test]
async fn replacing_lines_reissues_a_draft_order() {
    let app = TestApp::new().await;
    let order = app
        .place_order(&[(app.catalog.shirt.id, 2), (app.catalog.mug.id, 1)])
        .await;
    let shirt_line = order
        .lines
        .iter()
        .find(|line| line.variant_id == Some(app.catalog.shirt.id))
        .unwrap()
        .clone();
    let mug_line = order
        .lines
        .iter()
        .find(|line| line.variant_id == Some(app.catalog.mug.id))
        .unwrap()
        .clone();
    let shipped = app
        .services()
        .fulfillments
        .create_fulfillments(
            Actor::System,
            order.order.id,
            fulfill_input(
                vec![
                    ship(shirt_line.id, app.catalog.warehouse.id, 2),
                    ship(mug_line.id, app.catalog.warehouse.id, 1),
                ],
                None,
            ),
        )
        .await
        .unwrap();
    let shirt_shipped = shipped.fulfillments[0]
        .lines
        .iter()
        .find(|line| line.order_line_id == shirt_line.id)
        .unwrap()
        .id;

    let returned = app
        .services()
        .fulfillments
        .return_products(
            Actor::System,
            order.order.id,
            ReturnProductsInput {
                fulfillment_lines: vec![FulfillmentLineQuantity {
                    fulfillment_line_id: shirt_shipped,
                    quantity: 1,
                    replace: true,
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(returned.order.order.status, OrderStatus::PartiallyReturned);
    assert_eq!(returned.fulfillments[0].fulfillment.status, FulfillmentStatus::Replaced);

    let replacement = returned.replace_order.expect("replacement order");
    assert_eq!(replacement.order.status, OrderStatus::Draft);
    assert_eq!(replacement.order.origin, OrderOrigin::Reissue);
    assert_eq!(replacement.order.original_id, Some(order.order.id));
    assert_eq!(replacement.lines.len(), 1);
    assert_eq!(replacement.lines[0].quantity, 1);
    assert_eq!(replacement.lines[0].unit_price_gross, dec!(10.00));

    let events = app.event_types(order.order.id).await;
    assert!(events.contains(&"fulfillment_replaced".to_string()));
    assert!(events.contains(&"order_replacement_created".to_string()));
    // Nothing was refunded for the replaced unit.
    assert!(!events.contains(&"payment_refunded".to_string()));
}

#[tokio::test]
async fn shipping_gift_cards_issues_them() {
    let app = TestApp::new().await;
    let orders = &app.services().orders;
    let draft = orders
        .draft_order_create(
            Actor::System,
            DraftOrderCreate {
                channel_id: app.catalog.channel.id,
                user_id: None,
                user_email: Some("gifts@example.com".to_string()),
                shipping_address: None,
                billing_address: None,
                shipping_method_id: None,
                lines: vec![OrderLineInput {
                    variant_id: app.catalog.gift_card.id,
                    quantity: 2,
                }],
                discount: None,
                customer_note: String::new(),
            },
        )
        .await
        .unwrap();
    let order = orders
        .draft_order_complete(Actor::System, draft.order.id)
        .await
        .unwrap();

    fulfill(&app, &order, 2).await;

    let cards = gift_card::Entity::find()
        .filter(gift_card::Column::BoughtInOrderId.eq(order.order.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(cards.len(), 2);
    assert!(cards.iter().all(|card| card.initial_balance == dec!(25.00) && card.is_active));
    assert_ne!(cards[0].code, cards[1].code);
}

#[tokio::test]
async fn orders_with_active_fulfillments_cannot_be_canceled() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;
    fulfill(&app, &order, 1).await;

    assert_matches!(
        app.services().orders.cancel(Actor::System, order.order.id).await,
        Err(ServiceError::CannotCancel(_))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_fulfillments_never_ship_more_than_the_line() {
    let app = TestApp::on_disk().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 3)]).await;
    let line_id = order.lines[0].id;

    let fulfillments = &app.services().fulfillments;
    let attempt = || {
        fulfillments.create_fulfillments(
            Actor::System,
            order.order.id,
            fulfill_input(vec![ship(line_id, app.catalog.warehouse.id, 3)], None),
        )
    };
    let (first, second) = tokio::join!(attempt(), attempt());
    let shipped = [first, second].iter().filter(|result| result.is_ok()).count() as i32;
    assert!(shipped <= 1, "both fulfillments of the whole line went through");

    let details = app.services().orders.get(order.order.id).await.unwrap();
    assert_eq!(details.lines[0].quantity_fulfilled, 3 * shipped);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 10 - 3 * shipped);
    assert_eq!(stock.quantity_allocated, 3 - 3 * shipped);
    assert_eq!(
        stock_ledger::allocated_quantity(&*app.state.db, line_id).await.unwrap(),
        3 - 3 * shipped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_checkouts_never_oversell() {
    let app = TestApp::on_disk().await;
    // Three mugs in stock, two buyers wanting two each.
    let a = app.ready_checkout(&[(app.catalog.mug.id, 2)]).await;
    let b = app.ready_checkout(&[(app.catalog.mug.id, 2)]).await;
    app.pay(a.checkout.token, "tok_visa").await;
    app.pay(b.checkout.token, "tok_visa").await;

    let checkout = &app.services().checkout;
    let (first, second) = tokio::join!(
        checkout.complete(Actor::System, a.checkout.token),
        checkout.complete(Actor::System, b.checkout.token)
    );
    let placed: Vec<_> = [first, second]
        .into_iter()
        .filter_map(|result| match result {
            Ok(CheckoutCompletion::Completed { order }) => Some(order),
            _ => None,
        })
        .collect();
    assert!(placed.len() <= 1, "both checkouts took the same mugs");

    let stock = app.stock(app.catalog.mug.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity, 3);
    assert!(stock.quantity_allocated <= stock.quantity);
    assert_eq!(stock.quantity_allocated, 2 * placed.len() as i32);
    for order in &placed {
        assert_eq!(
            stock_ledger::allocated_quantity(&*app.state.db, order.lines[0].id)
                .await
                .unwrap(),
            2
        );
    }
}
