use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{mutation, MutationResult, RequestActor};
use crate::services::fulfillments::{
    FulfillInput, FulfillmentResult, RefundProductsInput, ReturnProductsInput, ReturnResult,
};
use crate::services::orders::FulfillmentDetails;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub allow_stock_to_be_exceeded: bool,
    #[serde(default = "default_notify")]
    pub notify_customer: bool,
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub warehouse_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TrackingRequest {
    pub tracking_number: String,
}

pub async fn fulfill_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<FulfillInput>,
) -> MutationResult<FulfillmentResult> {
    mutation(
        state
            .services
            .fulfillments
            .create_fulfillments(actor, id, input)
            .await,
    )
}

pub async fn approve_fulfillment(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> MutationResult<FulfillmentResult> {
    let Json(request) = body.unwrap_or(Json(ApproveRequest {
        allow_stock_to_be_exceeded: false,
        notify_customer: default_notify(),
    }));
    mutation(
        state
            .services
            .fulfillments
            .approve(
                actor,
                id,
                request.allow_stock_to_be_exceeded,
                request.notify_customer,
            )
            .await,
    )
}

pub async fn cancel_fulfillment(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> MutationResult<FulfillmentResult> {
    let warehouse_id = body.and_then(|Json(request)| request.warehouse_id);
    mutation(
        state
            .services
            .fulfillments
            .cancel(actor, id, warehouse_id)
            .await,
    )
}

pub async fn update_tracking(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(request): Json<TrackingRequest>,
) -> MutationResult<FulfillmentDetails> {
    mutation(
        state
            .services
            .fulfillments
            .update_tracking(actor, id, request.tracking_number)
            .await,
    )
}

pub async fn refund_products(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<RefundProductsInput>,
) -> MutationResult<FulfillmentResult> {
    mutation(
        state
            .services
            .fulfillments
            .refund_products(actor, id, input)
            .await,
    )
}

pub async fn return_products(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<ReturnProductsInput>,
) -> MutationResult<ReturnResult> {
    mutation(
        state
            .services
            .fulfillments
            .return_products(actor, id, input)
            .await,
    )
}
