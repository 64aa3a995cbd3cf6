//! HTTP surface: routing, mutation envelopes, error statuses and actors.

mod common;

use std::str::FromStr;

use axum::http::{Method, StatusCode};
use common::{address, TestApp};
use order_engine::handlers::ACTOR_USER_HEADER;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

fn money(value: &Value) -> Decimal {
    match value {
        Value::String(raw) => Decimal::from_str(raw).expect("decimal string"),
        Value::Number(number) => Decimal::from_str(&number.to_string()).expect("decimal number"),
        other => panic!("not an amount: {other}"),
    }
}

fn ok_data(status: StatusCode, body: &Value) -> &Value {
    assert_eq!(status, StatusCode::OK, "unexpected status, body: {body}");
    assert_eq!(body["errors"], json!([]), "unexpected errors: {body}");
    &body["data"]
}

async fn create_checkout(app: &TestApp, lines: Value) -> (StatusCode, Value) {
    app.request(
        Method::POST,
        "/api/v1/checkouts",
        Some(json!({
            "channel_id": app.catalog.channel.id,
            "email": "buyer@example.com",
            "lines": lines,
            "shipping_address": address("US"),
            "billing_address": address("US"),
        })),
    )
    .await
}

#[tokio::test]
async fn health_reports_the_database() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"]["status"], "up");
}

#[tokio::test]
async fn checkout_to_order_over_http() {
    let app = TestApp::new().await;
    let (status, body) = create_checkout(
        &app,
        json!([{ "variant_id": app.catalog.shirt.id, "quantity": 2 }]),
    )
    .await;
    let token = ok_data(status, &body)["token"]
        .as_str()
        .expect("checkout token")
        .to_string();

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/checkouts/{token}/delivery-method"),
            Some(json!({ "shipping_method_id": app.catalog.shipping.id })),
        )
        .await;
    let checkout = ok_data(status, &body);
    assert_eq!(money(&checkout["total"]["gross"]), dec!(25.00));

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/checkouts/{token}/payments"),
            Some(json!({ "token": "tok_visa" })),
        )
        .await;
    ok_data(status, &body);

    let (status, body) = app
        .request(Method::POST, &format!("/api/v1/checkouts/{token}/complete"), None)
        .await;
    let completion = ok_data(status, &body);
    assert_eq!(completion["result"], "completed");
    let order_id = completion["order"]["id"].as_str().expect("order id").to_string();
    assert_eq!(completion["order"]["status"], "unfulfilled");

    let (status, order) = app
        .request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&order["total_gross"]), dec!(25.00));
    assert_eq!(money(&order["total_charged"]), dec!(25.00));
    assert_eq!(order["lines"].as_array().map(Vec::len), Some(1));

    let (status, events) = app
        .request(Method::GET, &format!("/api/v1/orders/{order_id}/events"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events[0]["payload"]["type"], "placed");

    // The checkout is gone once it became an order.
    let (status, _) = app
        .request(Method::GET, &format!("/api/v1/checkouts/{token}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn business_errors_come_back_in_the_envelope() {
    let app = TestApp::new().await;
    let (status, body) = create_checkout(
        &app,
        json!([{ "variant_id": app.catalog.mug.id, "quantity": 4 }]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_null());
    assert_eq!(body["errors"][0]["code"], "INSUFFICIENT_STOCK");
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(Method::GET, &format!("/api/v1/orders/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn actors_are_taken_from_headers() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.mug.id, 1)]).await;
    let uri = format!("/api/v1/orders/{}/notes", order.order.id);

    let (status, _) = app
        .request_with_headers(
            Method::POST,
            &uri,
            Some(json!({ "message": "Call before delivery" })),
            &[(ACTOR_USER_HEADER, "staff-member")],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let staff = Uuid::new_v4();
    let staff_header = staff.to_string();
    let (status, body) = app
        .request_with_headers(
            Method::POST,
            &uri,
            Some(json!({ "message": "Call before delivery" })),
            &[(ACTOR_USER_HEADER, staff_header.as_str())],
        )
        .await;
    let note = ok_data(status, &body);
    assert_eq!(note["actor"]["type"], "user");
    assert_eq!(note["actor"]["id"], staff_header);
    assert_eq!(note["payload"]["type"], "note_added");
}

#[tokio::test]
async fn order_payment_routes_report_declines_next_to_the_data() {
    let app = TestApp::new().await;
    let order = app.place_order(&[(app.catalog.shirt.id, 1)]).await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/refund", order.order.id),
            Some(json!({ "amount": "5.00" })),
        )
        .await;
    let result = ok_data(status, &body);
    assert_eq!(result["transaction"]["kind"], "refund");
    assert_eq!(money(&result["order"]["total_charged"]), dec!(10.00));

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/mark-as-paid", order.order.id),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"][0]["code"], "PAYMENT_ERROR");
}

#[tokio::test]
async fn draft_orders_over_http() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/draft-orders",
            Some(json!({
                "channel_id": app.catalog.channel.id,
                "user_email": "customer@example.com",
                "shipping_address": address("US"),
                "billing_address": address("US"),
                "shipping_method_id": app.catalog.shipping.id,
                "lines": [{ "variant_id": app.catalog.shirt.id, "quantity": 1 }],
            })),
        )
        .await;
    let draft = ok_data(status, &body);
    assert_eq!(draft["status"], "draft");
    let draft_id = draft["id"].as_str().expect("draft id").to_string();

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/v1/draft-orders/{draft_id}/complete"),
            None,
        )
        .await;
    assert_eq!(ok_data(status, &body)["status"], "unfulfilled");

    let (status, body) = app
        .request(Method::DELETE, &format!("/api/v1/draft-orders/{draft_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"][0]["code"], "INVALID_ORDER_STATUS_FOR_ACTION");
}
