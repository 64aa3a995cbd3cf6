use axum::{
    extract::{Path, State},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::{mutation, MutationResponse, MutationResult, RequestActor};
use crate::errors::{MutationError, MutationErrorCode, ServiceError};
use crate::services::orders::{OrderDetails, OrderPaymentResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AmountRequest {
    pub amount: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkAsPaidRequest {
    pub transaction_reference: Option<String>,
}

/// A declined gateway call still returns the recorded transaction, next to
/// the payment error.
fn payment_mutation(result: Result<OrderPaymentResult, ServiceError>) -> MutationResult<OrderPaymentResult> {
    match result {
        Ok(outcome) => {
            let errors = outcome
                .error
                .as_ref()
                .map(|error| {
                    MutationError::new(
                        Some("payment"),
                        MutationErrorCode::PaymentError,
                        error.message.clone(),
                    )
                })
                .into_iter()
                .collect();
            Ok(Json(MutationResponse {
                data: Some(outcome),
                errors,
            }))
        }
        Err(err) => mutation(Err(err)),
    }
}

pub async fn capture(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<AmountRequest>>,
) -> MutationResult<OrderPaymentResult> {
    let amount = body.and_then(|Json(request)| request.amount);
    payment_mutation(state.services.orders.order_capture(actor, id, amount).await)
}

pub async fn void(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> MutationResult<OrderPaymentResult> {
    payment_mutation(state.services.orders.order_void(actor, id).await)
}

pub async fn refund(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<AmountRequest>>,
) -> MutationResult<OrderPaymentResult> {
    let amount = body.and_then(|Json(request)| request.amount);
    payment_mutation(state.services.orders.order_refund(actor, id, amount).await)
}

pub async fn mark_as_paid(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<MarkAsPaidRequest>>,
) -> MutationResult<OrderDetails> {
    let reference = body.and_then(|Json(request)| request.transaction_reference);
    mutation(state.services.orders.mark_as_paid(actor, id, reference).await)
}
