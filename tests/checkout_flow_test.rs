//! Checkout to order: completion, idempotency, stock and payment failures.

mod common;

use assert_matches::assert_matches;
use common::{address, ChannelFlags, TestApp};
use order_engine::entities::order::OrderStatus;
use order_engine::entities::payment::ChargeStatus;
use order_engine::entities::{checkout, order, voucher};
use order_engine::errors::{PaymentErrorCode, ServiceError};
use order_engine::services::checkout::{
    CheckoutCompletion, CheckoutCreate, CheckoutLineInput, DeliveryMethodInput,
};
use order_engine::services::order_events::Actor;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

#[tokio::test]
async fn completing_a_checkout_places_a_paid_confirmed_order() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 2)]).await;

    assert_eq!(order.order.status, OrderStatus::Unfulfilled);
    assert_eq!(order.lines.len(), 1);
    assert_eq!(order.lines[0].quantity, 2);
    assert_eq!(order.order.subtotal_gross, dec!(20.00));
    assert_eq!(order.order.shipping_price_gross, dec!(5.00));
    assert_eq!(order.order.total_gross, dec!(25.00));
    assert_eq!(order.order.total_charged, dec!(25.00));
    assert_eq!(order.payments.len(), 1);
    assert_eq!(order.payments[0].charge_status, ChargeStatus::FullyCharged);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity_allocated, 2);

    assert_eq!(
        app.event_types(order.order.id).await,
        vec!["placed", "confirmed", "payment_captured", "order_fully_paid"]
    );
    assert_eq!(
        app.notifier.names(),
        vec!["order_created", "order_confirmed", "order_fully_paid"]
    );
}

#[tokio::test]
async fn completed_checkout_is_deleted_and_completion_is_idempotent() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.mug.id, 1)]).await;
    let token = checkout.checkout.token;
    app.pay(token, "tok_visa").await;

    let first = app
        .services()
        .checkout
        .complete(Actor::System, token)
        .await
        .unwrap();
    let first = assert_matches!(first, CheckoutCompletion::Completed { order } => order);

    let stored = checkout::Entity::find_by_id(token)
        .one(&*app.state.db)
        .await
        .unwrap();
    assert!(stored.is_none());
    assert_matches!(
        app.services().checkout.get(token).await,
        Err(ServiceError::NotFound(_))
    );

    let again = app
        .services()
        .checkout
        .complete(Actor::System, token)
        .await
        .unwrap();
    let again = assert_matches!(again, CheckoutCompletion::Completed { order } => order);
    assert_eq!(again.order.id, first.order.id);

    // The repeat neither re-reserved stock nor charged again.
    let stock = app.stock(app.catalog.mug.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity_allocated, 1);
    assert_eq!(again.payments.len(), 1);
}

#[tokio::test]
async fn adding_more_than_available_is_refused_up_front() {
    let app = TestApp::new().await;
    let result = app
        .services()
        .checkout
        .create(CheckoutCreate {
            channel_id: app.catalog.channel.id,
            user_id: None,
            email: Some("buyer@example.com".to_string()),
            lines: vec![CheckoutLineInput {
                variant_id: app.catalog.mug.id,
                quantity: 4,
            }],
            shipping_address: None,
            billing_address: None,
            customer_note: String::new(),
        })
        .await;

    let insufficient = assert_matches!(result, Err(ServiceError::InsufficientStock(i)) => i);
    assert_eq!(insufficient.items[0].variant_id, app.catalog.mug.id);
}

#[tokio::test]
async fn stock_sold_in_the_meantime_fails_completion_before_charging() {
    let app = TestApp::new().await;
    let late = app.ready_checkout(&[(app.catalog.mug.id, 2)]).await;
    app.pay(late.checkout.token, "tok_visa").await;

    app.place_order(&[(app.catalog.mug.id, 2)]).await;

    let result = app
        .services()
        .checkout
        .complete(Actor::System, late.checkout.token)
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));

    let stock = app.stock(app.catalog.mug.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity_allocated, 2, "only the first order holds units");

    // The checkout survives and its payment was never charged.
    let checkout = app.services().checkout.get(late.checkout.token).await.unwrap();
    assert_eq!(checkout.lines.len(), 1);
}

#[tokio::test]
async fn declined_payment_leaves_no_order_behind() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    app.pay(checkout.checkout.token, "declined_card").await;

    let result = app
        .services()
        .checkout
        .complete(Actor::System, checkout.checkout.token)
        .await;
    let error = assert_matches!(result, Err(ServiceError::Payment(error)) => error);
    assert_eq!(error.code, PaymentErrorCode::GatewayFailure);

    let stock = app.stock(app.catalog.shirt.id, app.catalog.warehouse.id).await;
    assert_eq!(stock.quantity_allocated, 0);
    assert!(app.services().checkout.get(checkout.checkout.token).await.is_ok());
    assert!(app.notifier.events().is_empty());
}

#[tokio::test]
async fn missing_payment_is_refused_unless_the_channel_allows_unpaid_orders() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    let result = app
        .services()
        .checkout
        .complete(Actor::System, checkout.checkout.token)
        .await;
    let error = assert_matches!(result, Err(ServiceError::Payment(error)) => error);
    assert_eq!(error.code, PaymentErrorCode::NotCovered);

    let lenient = TestApp::with_channel(ChannelFlags {
        allow_unpaid_orders: true,
        ..Default::default()
    })
    .await;
    let checkout = lenient.ready_checkout(&[(lenient.catalog.shirt.id, 1)]).await;
    let completion = lenient
        .services()
        .checkout
        .complete(Actor::System, checkout.checkout.token)
        .await
        .unwrap();
    let order = assert_matches!(completion, CheckoutCompletion::Completed { order } => order);
    assert_eq!(order.order.total_charged, dec!(0));
    assert!(!order.order.is_fully_paid());
    assert_eq!(lenient.notifier.names(), vec!["order_created", "order_confirmed"]);
}

#[tokio::test]
async fn orders_wait_for_confirmation_when_the_channel_says_so() {
    let app = TestApp::with_channel(ChannelFlags {
        automatically_confirm_all_new_orders: false,
        capture_payments_on_checkout: false,
        ..Default::default()
    })
    .await;
    let order = app.place_order(&[(app.catalog.shirt.id, 1)]).await;

    assert_eq!(order.order.status, OrderStatus::Unconfirmed);
    assert_eq!(order.payments[0].charge_status, ChargeStatus::NotCharged);
    assert_eq!(order.order.total_charged, dec!(0));
    assert_eq!(
        app.event_types(order.order.id).await,
        vec!["placed", "payment_authorized"]
    );
}

#[tokio::test]
async fn three_ds_payments_need_a_second_completion() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    let token = checkout.checkout.token;
    app.pay(token, "3ds_card").await;

    let first = app
        .services()
        .checkout
        .complete(Actor::System, token)
        .await
        .unwrap();
    let data = assert_matches!(
        first,
        CheckoutCompletion::ConfirmationNeeded { confirmation_data, .. } => confirmation_data
    );
    assert!(data.is_some());
    assert!(app.notifier.events().is_empty());

    let second = app
        .services()
        .checkout
        .complete(Actor::System, token)
        .await
        .unwrap();
    let order = assert_matches!(second, CheckoutCompletion::Completed { order } => order);
    assert_eq!(order.order.total_charged, dec!(15.00));
}

#[tokio::test]
async fn shippable_lines_need_a_delivery_method() {
    let app = TestApp::new().await;
    let created = app
        .services()
        .checkout
        .create(CheckoutCreate {
            channel_id: app.catalog.channel.id,
            user_id: None,
            email: Some("buyer@example.com".to_string()),
            lines: vec![CheckoutLineInput {
                variant_id: app.catalog.shirt.id,
                quantity: 1,
            }],
            shipping_address: Some(address("US")),
            billing_address: Some(address("US")),
            customer_note: String::new(),
        })
        .await
        .unwrap();
    app.pay(created.checkout.token, "tok_visa").await;

    let result = app
        .services()
        .checkout
        .complete(Actor::System, created.checkout.token)
        .await;
    assert_matches!(
        result,
        Err(ServiceError::DeliveryMethodNotApplicable { field, .. }) if field == "shipping_method_id"
    );
}

#[tokio::test]
async fn shipping_methods_must_serve_the_destination() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    let token = checkout.checkout.token;

    // Moving to a country the method does not serve drops it.
    let moved = app
        .services()
        .checkout
        .set_shipping_address(token, address("DE"))
        .await
        .unwrap();
    assert!(moved.delivery_method.is_none());

    let result = app
        .services()
        .checkout
        .set_delivery_method(
            token,
            DeliveryMethodInput {
                warehouse_id: None,
                shipping_method_id: Some(app.catalog.shipping.id),
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::DeliveryMethodNotApplicable { .. }));
}

#[tokio::test]
async fn digital_only_checkouts_skip_shipping() {
    let app = TestApp::new().await;
    let created = app
        .services()
        .checkout
        .create(CheckoutCreate {
            channel_id: app.catalog.channel.id,
            user_id: None,
            email: Some("buyer@example.com".to_string()),
            lines: vec![CheckoutLineInput {
                variant_id: app.catalog.gift_card.id,
                quantity: 2,
            }],
            shipping_address: None,
            billing_address: Some(address("US")),
            customer_note: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(created.total.gross, dec!(50.00));
    app.pay(created.checkout.token, "tok_visa").await;

    let completion = app
        .services()
        .checkout
        .complete(Actor::System, created.checkout.token)
        .await
        .unwrap();
    let order = assert_matches!(completion, CheckoutCompletion::Completed { order } => order);
    assert_eq!(order.order.shipping_price_gross, dec!(0));
    assert!(order.order.shipping_method_id.is_none());
}

#[tokio::test]
async fn vouchers_discount_the_order_and_are_consumed() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 2)]).await;
    let token = checkout.checkout.token;

    let discounted = app
        .services()
        .checkout
        .apply_promo_code(token, "SAVE10".to_string())
        .await
        .unwrap();
    assert_eq!(discounted.checkout.discount_amount, dec!(2.00));
    assert_eq!(discounted.total.gross, dec!(23.00));

    app.pay(token, "tok_visa").await;
    let completion = app
        .services()
        .checkout
        .complete(Actor::System, token)
        .await
        .unwrap();
    let order = assert_matches!(completion, CheckoutCompletion::Completed { order } => order);
    assert_eq!(order.order.total_gross, dec!(23.00));
    assert_eq!(order.discounts.len(), 1);
    assert_eq!(order.discounts[0].voucher_code.as_deref(), Some("SAVE10"));

    let voucher = voucher::Entity::find_by_id(app.catalog.voucher.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(voucher.used, 1);

    // The single use is gone.
    let other = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    let result = app
        .services()
        .checkout
        .apply_promo_code(other.checkout.token, "SAVE10".to_string())
        .await;
    assert_matches!(result, Err(ServiceError::InvalidField { field, .. }) if field == "promo_code");
}

#[tokio::test]
async fn line_quantities_merge_and_zero_removes() {
    let app = TestApp::new().await;
    let checkout = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
    let token = checkout.checkout.token;
    let service = &app.services().checkout;

    let merged = service
        .add_lines(
            token,
            vec![CheckoutLineInput {
                variant_id: app.catalog.shirt.id,
                quantity: 2,
            }],
        )
        .await
        .unwrap();
    assert_eq!(merged.lines.len(), 1);
    assert_eq!(merged.lines[0].line.quantity, 3);

    let emptied = service
        .update_lines(
            token,
            vec![CheckoutLineInput {
                variant_id: app.catalog.shirt.id,
                quantity: 0,
            }],
        )
        .await
        .unwrap();
    assert!(emptied.lines.is_empty());
    assert_eq!(emptied.total.gross, dec!(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_completions_share_one_order() {
    let app = TestApp::on_disk().await;

    for _ in 0..3 {
        let ready = app.ready_checkout(&[(app.catalog.shirt.id, 1)]).await;
        let token = ready.checkout.token;
        app.pay(token, "tok_visa").await;

        let checkout = &app.services().checkout;
        let (first, second) = tokio::join!(
            checkout.complete(Actor::System, token),
            checkout.complete(Actor::System, token)
        );

        let orders = order::Entity::find()
            .filter(order::Column::CheckoutToken.eq(token))
            .all(&*app.state.db)
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);

        for result in [first, second] {
            match result {
                Ok(CheckoutCompletion::Completed { order }) => {
                    assert_eq!(order.order.id, orders[0].id);
                }
                Ok(other) => panic!("unexpected completion: {other:?}"),
                // The losing writer may be refused by SQLite's lock, never told the checkout is gone.
                Err(err) => assert!(
                    !matches!(err, ServiceError::NotFound(_)),
                    "second completion reported {err:?}"
                ),
            }
        }
    }
}
