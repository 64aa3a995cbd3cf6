pub mod checkout;
pub mod fulfillments;
pub mod health;
pub mod invoices;
pub mod orders;
pub mod payments;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::db::DbPool;
use crate::errors::{MutationError, ServiceError};
use crate::events::Notifier;
use crate::services::order_events::Actor;
use crate::services::payments::PaymentEngine;
use crate::services::pricing::PricingProvider;
use crate::services::{
    checkout::CheckoutService, fulfillments::FulfillmentService, invoices::InvoiceService,
    orders::OrderService, EngineSettings,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

pub const ACTOR_USER_HEADER: &str = "x-actor-user-id";
pub const ACTOR_APP_HEADER: &str = "x-actor-app-id";

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub fulfillments: Arc<FulfillmentService>,
    pub invoices: Arc<InvoiceService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        notifier: Arc<dyn Notifier>,
        pricing: Arc<dyn PricingProvider>,
        payments: PaymentEngine,
        settings: EngineSettings,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            notifier.clone(),
            pricing.clone(),
            payments.clone(),
            settings.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            notifier.clone(),
            pricing.clone(),
            payments.clone(),
            settings.clone(),
        ));
        let fulfillments = Arc::new(FulfillmentService::new(
            db_pool.clone(),
            notifier.clone(),
            pricing,
            payments,
            settings,
        ));
        let invoices = Arc::new(InvoiceService::new(db_pool, notifier));

        Self {
            checkout,
            orders,
            fulfillments,
            invoices,
        }
    }
}

/// Body of every mutation endpoint.
///
/// Business failures are reported in `errors` with a `200 OK`; only
/// infrastructure failures turn into an error status.
#[derive(Debug, Serialize)]
pub struct MutationResponse<T> {
    pub data: Option<T>,
    pub errors: Vec<MutationError>,
}

impl<T> MutationResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failed(error: MutationError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }
}

pub type MutationResult<T> = Result<Json<MutationResponse<T>>, ServiceError>;

/// Folds a service result into a mutation response.
pub fn mutation<T>(result: Result<T, ServiceError>) -> MutationResult<T> {
    match result {
        Ok(data) => Ok(Json(MutationResponse::ok(data))),
        Err(err) => match err.mutation_error() {
            Some(error) => {
                tracing::debug!(error = %err, "mutation rejected");
                Ok(Json(MutationResponse::failed(error)))
            }
            None => Err(err),
        },
    }
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, ServiceError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .map(Some)
        .ok_or_else(|| ServiceError::invalid_field(name, "Header must be a UUID"))
}

/// The acting staff user or app, taken from the request headers.
/// Requests without either act as the system.
#[derive(Debug, Clone, Copy)]
pub struct RequestActor(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = header_uuid(&parts.headers, ACTOR_USER_HEADER)?;
        let app = header_uuid(&parts.headers, ACTOR_APP_HEADER)?;
        Ok(Self(Actor::from_ids(user, app)))
    }
}
