//! Order engine library
//!
//! Stock ledger, checkout completion, order lifecycle, fulfillments, payments
//! and the order event log, exposed over an axum JSON API.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub services: handlers::AppServices,
}

fn checkout_routes() -> Router<AppState> {
    use handlers::checkout as h;

    Router::new()
        .route("/checkouts", post(h::create_checkout))
        .route("/checkouts/:token", get(h::get_checkout))
        .route("/checkouts/:token/lines", post(h::add_lines).put(h::update_lines))
        .route("/checkouts/:token/lines/:line_id", delete(h::delete_line))
        .route("/checkouts/:token/email", put(h::set_email))
        .route("/checkouts/:token/shipping-address", put(h::set_shipping_address))
        .route("/checkouts/:token/billing-address", put(h::set_billing_address))
        .route("/checkouts/:token/delivery-method", put(h::set_delivery_method))
        .route(
            "/checkouts/:token/promo-code",
            post(h::apply_promo_code).delete(h::remove_promo_code),
        )
        .route("/checkouts/:token/payments", post(h::create_payment))
        .route("/checkouts/:token/complete", post(h::complete_checkout))
}

fn order_routes() -> Router<AppState> {
    use handlers::{fulfillments, invoices, orders, payments};

    let drafts = Router::new()
        .route("/draft-orders", post(orders::create_draft_order))
        .route(
            "/draft-orders/:id",
            put(orders::update_draft_order).delete(orders::delete_draft_order),
        )
        .route("/draft-orders/:id/complete", post(orders::complete_draft_order));

    let lifecycle = Router::new()
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/events", get(orders::get_order_events))
        .route("/orders/:id/confirm", post(orders::confirm_order))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route("/orders/:id/notes", post(orders::add_note))
        .route("/orders/:id/lines", post(orders::add_order_lines))
        .route(
            "/order-lines/:id",
            put(orders::update_order_line).delete(orders::delete_order_line),
        )
        .route(
            "/order-lines/:id/discount",
            put(orders::update_order_line_discount).delete(orders::remove_order_line_discount),
        )
        .route("/orders/:id/discounts", post(orders::add_order_discount))
        .route(
            "/order-discounts/:id",
            put(orders::update_order_discount).delete(orders::delete_order_discount),
        );

    let payments = Router::new()
        .route("/orders/:id/capture", post(payments::capture))
        .route("/orders/:id/void", post(payments::void))
        .route("/orders/:id/refund", post(payments::refund))
        .route("/orders/:id/mark-as-paid", post(payments::mark_as_paid));

    let fulfillments = Router::new()
        .route("/orders/:id/fulfill", post(fulfillments::fulfill_order))
        .route("/orders/:id/fulfillments/refund", post(fulfillments::refund_products))
        .route("/orders/:id/fulfillments/return", post(fulfillments::return_products))
        .route("/fulfillments/:id/approve", post(fulfillments::approve_fulfillment))
        .route("/fulfillments/:id/cancel", post(fulfillments::cancel_fulfillment))
        .route("/fulfillments/:id/tracking", put(fulfillments::update_tracking));

    let invoices = Router::new()
        .route(
            "/orders/:id/invoices",
            get(invoices::list_invoices).post(invoices::request_invoice),
        )
        .route("/invoices/:id", put(invoices::update_invoice))
        .route("/invoices/:id/generated", post(invoices::mark_generated))
        .route("/invoices/:id/failed", post(invoices::mark_failed))
        .route("/invoices/:id/send", post(invoices::send_invoice));

    Router::new()
        .merge(drafts)
        .merge(lifecycle)
        .merge(payments)
        .merge(fulfillments)
        .merge(invoices)
}

/// Versioned API routes.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new().merge(checkout_routes()).merge(order_routes())
}

/// The whole application: health probe plus `/api/v1`, with request tracing.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
