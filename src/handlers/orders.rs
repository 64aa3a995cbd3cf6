use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{mutation, MutationResult, RequestActor};
use crate::errors::ServiceError;
use crate::services::order_events::OrderEventRecord;
use crate::services::orders::{
    DiscountInput, DraftDeletion, DraftOrderCreate, DraftOrderUpdate, OrderDetails,
    OrderLineInput,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OrderLinesRequest {
    pub lines: Vec<OrderLineInput>,
}

#[derive(Debug, Deserialize)]
pub struct LineQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub message: String,
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetails>, ServiceError> {
    Ok(Json(state.services.orders.get(id).await?))
}

pub async fn get_order_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<OrderEventRecord>>, ServiceError> {
    Ok(Json(state.services.orders.events(id).await?))
}

pub async fn create_draft_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(input): Json<DraftOrderCreate>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.draft_order_create(actor, input).await)
}

pub async fn update_draft_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<DraftOrderUpdate>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.draft_order_update(actor, id, input).await)
}

pub async fn complete_draft_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.draft_order_complete(actor, id).await)
}

pub async fn delete_draft_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<DraftDeletion> {
    mutation(state.services.orders.draft_order_delete(actor, id).await)
}

pub async fn confirm_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.confirm(actor, id).await)
}

pub async fn cancel_order(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.cancel(actor, id).await)
}

pub async fn add_order_lines(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(request): Json<OrderLinesRequest>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_lines_create(actor, id, request.lines)
            .await,
    )
}

pub async fn update_order_line(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(line_id): Path<Uuid>,
    Json(request): Json<LineQuantityRequest>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_line_update(actor, line_id, request.quantity)
            .await,
    )
}

pub async fn delete_order_line(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(line_id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.order_line_delete(actor, line_id).await)
}

pub async fn update_order_line_discount(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(line_id): Path<Uuid>,
    Json(input): Json<DiscountInput>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_line_discount_update(actor, line_id, input)
            .await,
    )
}

pub async fn remove_order_line_discount(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(line_id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_line_discount_remove(actor, line_id)
            .await,
    )
}

pub async fn add_order_discount(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<DiscountInput>,
) -> MutationResult<OrderDetails> {
    mutation(state.services.orders.order_discount_add(actor, id, input).await)
}

pub async fn update_order_discount(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(discount_id): Path<Uuid>,
    Json(input): Json<DiscountInput>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_discount_update(actor, discount_id, input)
            .await,
    )
}

pub async fn delete_order_discount(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(discount_id): Path<Uuid>,
) -> MutationResult<OrderDetails> {
    mutation(
        state
            .services
            .orders
            .order_discount_delete(actor, discount_id)
            .await,
    )
}

pub async fn add_note(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(request): Json<NoteRequest>,
) -> MutationResult<OrderEventRecord> {
    mutation(state.services.orders.add_note(actor, id, request.message).await)
}
