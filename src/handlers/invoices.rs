use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{mutation, MutationResult, RequestActor};
use crate::entities::invoice;
use crate::errors::ServiceError;
use crate::services::invoices::InvoiceUpdate;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceRequest {
    pub number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedRequest {
    pub number: String,
    pub url: String,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<invoice::Model>>, ServiceError> {
    Ok(Json(state.services.invoices.for_order(order_id).await?))
}

pub async fn request_invoice(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(order_id): Path<Uuid>,
    body: Option<Json<InvoiceRequest>>,
) -> MutationResult<invoice::Model> {
    let number = body.and_then(|Json(request)| request.number);
    mutation(state.services.invoices.request(actor, order_id, number).await)
}

pub async fn mark_generated(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(request): Json<GeneratedRequest>,
) -> MutationResult<invoice::Model> {
    mutation(
        state
            .services
            .invoices
            .mark_generated(actor, id, request.number, request.url)
            .await,
    )
}

pub async fn mark_failed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> MutationResult<invoice::Model> {
    mutation(state.services.invoices.mark_failed(id).await)
}

pub async fn update_invoice(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(update): Json<InvoiceUpdate>,
) -> MutationResult<invoice::Model> {
    mutation(state.services.invoices.update(actor, id, update).await)
}

pub async fn send_invoice(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<invoice::Model> {
    mutation(state.services.invoices.send(actor, id).await)
}
