use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{mutation, MutationResult, RequestActor};
use crate::entities::payment;
use crate::errors::ServiceError;
use crate::services::address::Address;
use crate::services::checkout::{
    CheckoutCompletion, CheckoutCreate, CheckoutDetails, CheckoutLineInput, CheckoutPaymentCreate,
    DeliveryMethodInput,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LinesRequest {
    pub lines: Vec<CheckoutLineInput>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PromoCodeRequest {
    pub promo_code: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(input): Json<CheckoutCreate>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.create(input).await)
}

pub async fn get_checkout(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
) -> Result<Json<CheckoutDetails>, ServiceError> {
    Ok(Json(state.services.checkout.get(token).await?))
}

pub async fn add_lines(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(request): Json<LinesRequest>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.add_lines(token, request.lines).await)
}

pub async fn update_lines(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(request): Json<LinesRequest>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.update_lines(token, request.lines).await)
}

pub async fn delete_line(
    State(state): State<AppState>,
    Path((token, line_id)): Path<(Uuid, Uuid)>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.delete_line(token, line_id).await)
}

pub async fn set_email(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(request): Json<EmailRequest>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.set_email(token, request.email).await)
}

pub async fn set_shipping_address(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(address): Json<Address>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.set_shipping_address(token, address).await)
}

pub async fn set_billing_address(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(address): Json<Address>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.set_billing_address(token, address).await)
}

pub async fn set_delivery_method(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(input): Json<DeliveryMethodInput>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.set_delivery_method(token, input).await)
}

pub async fn apply_promo_code(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(request): Json<PromoCodeRequest>,
) -> MutationResult<CheckoutDetails> {
    mutation(
        state
            .services
            .checkout
            .apply_promo_code(token, request.promo_code)
            .await,
    )
}

pub async fn remove_promo_code(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
) -> MutationResult<CheckoutDetails> {
    mutation(state.services.checkout.remove_promo_code(token).await)
}

pub async fn create_payment(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
    Json(input): Json<CheckoutPaymentCreate>,
) -> MutationResult<payment::Model> {
    mutation(state.services.checkout.create_payment(token, input).await)
}

pub async fn complete_checkout(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(token): Path<Uuid>,
) -> MutationResult<CheckoutCompletion> {
    mutation(state.services.checkout.complete(actor, token).await)
}
