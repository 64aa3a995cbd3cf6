//! Payment transaction engine.
//!
//! Every gateway call is bracketed by local writes: a transaction row is
//! inserted as a record of intent, the gateway is called, the row is updated
//! with the response and only then is the payment's charge state advanced,
//! re-derived from a fresh read and guarded by the payment `version`.

use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::payment::{self, ChargeStatus};
use crate::entities::payment_transaction::{self, TransactionKind};
use crate::errors::{PaymentError, PaymentErrorCode, ServiceError};
use crate::services::gateway::{GatewayError, GatewayRequest, GatewayResponse, PaymentGateway};

lazy_static! {
    static ref PAYMENT_TRANSACTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "payment_transactions_total",
            "Total number of payment gateway transactions"
        ),
        &["kind", "outcome"]
    )
    .expect("metric can be created");
}

/// Gateway name of payments recorded by staff without a provider.
pub const MANUAL_GATEWAY: &str = "manual";

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub gateway: String,
    pub token: String,
    pub total: Decimal,
    pub currency: String,
    pub checkout_token: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub billing_email: Option<String>,
    pub psp_reference: Option<String>,
}

/// Result of one gateway operation.
///
/// `error` is set when the gateway declined or could not be reached; the
/// transaction row is recorded either way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub transaction: payment_transaction::Model,
    pub payment: payment::Model,
    pub error: Option<PaymentError>,
}

impl TransactionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.transaction.is_success
    }

    pub fn action_required(&self) -> bool {
        self.is_success() && self.transaction.action_required
    }
}

/// The part of a payment a transaction kind can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeState {
    pub charge_status: ChargeStatus,
    pub captured_amount: Decimal,
    pub total: Decimal,
    pub is_active: bool,
    pub to_confirm: bool,
}

impl From<&payment::Model> for ChargeState {
    fn from(payment: &payment::Model) -> Self {
        Self {
            charge_status: payment.charge_status,
            captured_amount: payment.captured_amount,
            total: payment.total,
            is_active: payment.is_active,
            to_confirm: payment.to_confirm,
        }
    }
}

fn charged_status(captured: Decimal, total: Decimal) -> ChargeStatus {
    if captured <= Decimal::ZERO {
        ChargeStatus::NotCharged
    } else if captured >= total {
        ChargeStatus::FullyCharged
    } else {
        ChargeStatus::PartiallyCharged
    }
}

/// Charge state after a successful transaction of `kind`.
pub fn apply_transition(state: ChargeState, kind: TransactionKind, amount: Decimal) -> ChargeState {
    let mut next = state;
    match kind {
        TransactionKind::Capture | TransactionKind::RefundReversed | TransactionKind::RefundFailed => {
            next.captured_amount += amount;
            next.charge_status = charged_status(next.captured_amount, next.total);
            next.to_confirm = false;
        }
        TransactionKind::CaptureFailed => {
            next.captured_amount = (next.captured_amount - amount).max(Decimal::ZERO);
            next.charge_status = charged_status(next.captured_amount, next.total);
        }
        TransactionKind::Refund => {
            next.captured_amount = (next.captured_amount - amount).max(Decimal::ZERO);
            if next.captured_amount.is_zero() {
                next.charge_status = ChargeStatus::FullyRefunded;
                next.is_active = false;
            } else {
                next.charge_status = ChargeStatus::PartiallyRefunded;
            }
        }
        TransactionKind::Void => next.is_active = false,
        TransactionKind::Cancel => {
            next.charge_status = ChargeStatus::Cancelled;
            next.is_active = false;
        }
        TransactionKind::Pending => next.charge_status = ChargeStatus::Pending,
        TransactionKind::ActionToConfirm => next.to_confirm = true,
        TransactionKind::Auth | TransactionKind::Confirm => next.to_confirm = false,
        TransactionKind::External | TransactionKind::RefundOngoing => {}
    }
    next
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Authorize,
    Capture,
    Void,
    Refund,
    Confirm,
}

impl Operation {
    fn intent_kind(self) -> TransactionKind {
        match self {
            Operation::Authorize => TransactionKind::Auth,
            Operation::Capture => TransactionKind::Capture,
            Operation::Void => TransactionKind::Void,
            Operation::Refund => TransactionKind::Refund,
            Operation::Confirm => TransactionKind::Confirm,
        }
    }

    /// Kinds a gateway may answer this operation with.
    fn accepts(self, kind: TransactionKind) -> bool {
        use TransactionKind as K;
        match self {
            Operation::Authorize => matches!(kind, K::Auth | K::ActionToConfirm | K::Pending),
            Operation::Capture => matches!(kind, K::Capture | K::ActionToConfirm | K::Pending),
            Operation::Void => kind == K::Void,
            Operation::Refund => matches!(kind, K::Refund | K::RefundOngoing | K::Pending),
            Operation::Confirm => matches!(kind, K::Auth | K::Capture | K::Pending),
        }
    }
}

/// Holds a gateway answer to what was asked for.
///
/// A kind the operation cannot produce turns the answer into a failure and an
/// amount above the requested one is cut down to it.
fn screen_response(
    operation: Operation,
    request: &GatewayRequest,
    response: Result<GatewayResponse, GatewayError>,
) -> Result<GatewayResponse, GatewayError> {
    let mut response = response?;
    if response.is_success && !operation.accepts(response.kind) {
        warn!(
            operation = ?operation,
            kind = %response.kind,
            "gateway answered with an unexpected transaction kind"
        );
        response.error = Some(format!(
            "Gateway answered a {} request with a {} transaction",
            operation.intent_kind(),
            response.kind
        ));
        response.is_success = false;
        response.action_required = false;
    }
    if response.amount > request.amount || response.amount < Decimal::ZERO {
        warn!(
            requested = %request.amount,
            answered = %response.amount,
            "gateway amount differs from the requested amount"
        );
        response.amount = response.amount.min(request.amount).max(Decimal::ZERO);
    }
    Ok(response)
}

fn refuse(code: PaymentErrorCode, message: impl Into<String>) -> ServiceError {
    ServiceError::Payment(PaymentError::new(code, message))
}

fn manual_response(request: &GatewayRequest, kind: TransactionKind) -> GatewayResponse {
    GatewayResponse {
        is_success: true,
        action_required: false,
        action_required_data: None,
        kind,
        amount: request.amount,
        psp_reference: request.psp_reference.clone(),
        error: None,
        already_processed: false,
        raw: json!({ "gateway": MANUAL_GATEWAY, "kind": kind.to_string() }),
    }
}

#[derive(Clone)]
pub struct PaymentEngine {
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentEngine {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Creates a payment and deactivates the other active payments of the
    /// same checkout or order.
    #[instrument(skip(self, conn, new), fields(gateway = %new.gateway))]
    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        new: NewPayment,
    ) -> Result<payment::Model, ServiceError> {
        if new.total < Decimal::ZERO {
            return Err(ServiceError::invalid_field("amount", "Amount cannot be negative"));
        }

        let mut owner = Condition::any();
        if let Some(token) = new.checkout_token {
            owner = owner.add(payment::Column::CheckoutToken.eq(token));
        }
        if let Some(order_id) = new.order_id {
            owner = owner.add(payment::Column::OrderId.eq(order_id));
        }
        if new.checkout_token.is_some() || new.order_id.is_some() {
            payment::Entity::update_many()
                .col_expr(payment::Column::IsActive, Expr::value(false))
                .col_expr(payment::Column::ModifiedAt, Expr::value(Utc::now()))
                .filter(payment::Column::IsActive.eq(true))
                .filter(owner)
                .exec(conn)
                .await?;
        }

        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            gateway: Set(new.gateway),
            is_active: Set(true),
            to_confirm: Set(false),
            charge_status: Set(ChargeStatus::NotCharged),
            token: Set(new.token),
            total: Set(new.total),
            captured_amount: Set(Decimal::ZERO),
            currency: Set(new.currency),
            checkout_token: Set(new.checkout_token),
            order_id: Set(new.order_id),
            psp_reference: Set(new.psp_reference),
            billing_email: Set(new.billing_email),
            version: Set(0),
            created_at: Set(now),
            modified_at: Set(now),
        }
        .insert(conn)
        .await?;
        info!(payment_id = %payment.id, total = %payment.total, "payment created");
        Ok(payment)
    }

    pub async fn get<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(payment_id)
            .one(conn)
            .await?
            .ok_or_else(|| refuse(PaymentErrorCode::NotFound, format!("Payment {payment_id} not found")))
    }

    pub async fn active_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::IsActive.eq(true))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    pub async fn active_for_checkout<C: ConnectionTrait>(
        &self,
        conn: &C,
        checkout_token: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::CheckoutToken.eq(checkout_token))
            .filter(payment::Column::IsActive.eq(true))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    pub async fn transactions<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        Ok(payment_transaction::Entity::find()
            .filter(payment_transaction::Column::PaymentId.eq(payment_id))
            .order_by_asc(payment_transaction::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    #[instrument(skip(self, conn), fields(payment_id = %payment_id))]
    pub async fn authorize<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<TransactionOutcome, ServiceError> {
        let payment = self.get(conn, payment_id).await?;
        if !payment.is_active {
            return Err(PaymentError::inactive().into());
        }
        if payment.charge_status != ChargeStatus::NotCharged {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                "Only a payment that was not charged can be authorized",
            ));
        }
        let amount = payment.total;
        self.run(conn, payment, Operation::Authorize, amount, false).await
    }

    /// Captures `amount`, or everything still capturable when it is `None`.
    #[instrument(skip(self, conn), fields(payment_id = %payment_id))]
    pub async fn capture<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<TransactionOutcome, ServiceError> {
        let payment = self.get(conn, payment_id).await?;
        if !payment.is_active {
            return Err(PaymentError::inactive().into());
        }
        if !payment.can_capture() {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                format!("Cannot capture a payment that is {}", payment.charge_status),
            ));
        }

        let remaining = payment.remaining_capturable();
        let amount = amount.unwrap_or(remaining);
        if amount <= Decimal::ZERO {
            return Err(refuse(PaymentErrorCode::InvalidAmount, "Amount should be a positive number"));
        }
        if amount > remaining {
            return Err(refuse(
                PaymentErrorCode::AmountExceeded,
                format!("Unable to capture {amount}, only {remaining} remains capturable"),
            ));
        }
        self.run(conn, payment, Operation::Capture, amount, false).await
    }

    #[instrument(skip(self, conn), fields(payment_id = %payment_id))]
    pub async fn void<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<TransactionOutcome, ServiceError> {
        let payment = self.get(conn, payment_id).await?;
        if !payment.can_void() {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                "Only pre-authorized payments can be voided",
            ));
        }
        let authorized = payment_transaction::Entity::find()
            .filter(payment_transaction::Column::PaymentId.eq(payment.id))
            .filter(payment_transaction::Column::Kind.eq(TransactionKind::Auth))
            .filter(payment_transaction::Column::IsSuccess.eq(true))
            .one(conn)
            .await?;
        if authorized.is_none() {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                "Only pre-authorized payments can be voided",
            ));
        }
        let amount = payment.total;
        self.run(conn, payment, Operation::Void, amount, false).await
    }

    /// Refunds `amount`, or everything captured when it is `None`.
    #[instrument(skip(self, conn), fields(payment_id = %payment_id))]
    pub async fn refund<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<TransactionOutcome, ServiceError> {
        let payment = self.get(conn, payment_id).await?;
        if !payment.can_refund() {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                "Refund is possible only for captured payments",
            ));
        }

        let amount = amount.unwrap_or(payment.captured_amount);
        if amount < Decimal::ZERO {
            return Err(refuse(PaymentErrorCode::InvalidAmount, "Amount cannot be negative"));
        }
        if amount > payment.captured_amount {
            return Err(refuse(
                PaymentErrorCode::AmountExceeded,
                format!(
                    "Unable to refund {amount}, only {} was captured",
                    payment.captured_amount
                ),
            ));
        }
        self.run(conn, payment, Operation::Refund, amount, false).await
    }

    /// Completes a payment that was left waiting for out-of-band confirmation.
    #[instrument(skip(self, conn), fields(payment_id = %payment_id))]
    pub async fn confirm<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        capture: bool,
    ) -> Result<TransactionOutcome, ServiceError> {
        let payment = self.get(conn, payment_id).await?;
        if !payment.is_active {
            return Err(PaymentError::inactive().into());
        }
        if !payment.to_confirm {
            return Err(refuse(
                PaymentErrorCode::InvalidStatus,
                "Payment does not wait for confirmation",
            ));
        }
        let amount = payment.remaining_capturable();
        self.run(conn, payment, Operation::Confirm, amount, capture).await
    }

    /// Undoes at the gateway a charge whose local effects were rolled back.
    ///
    /// Authorizations are voided and captures refunded. The payment row is not
    /// touched since it never left its pre-charge state; the gateway call is
    /// recorded as a transaction.
    #[instrument(skip(self, conn, outcome), fields(payment_id = %outcome.payment.id))]
    pub async fn compensate<C: ConnectionTrait>(
        &self,
        conn: &C,
        outcome: &TransactionOutcome,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        if !outcome.is_success() {
            return Ok(None);
        }
        let request = GatewayRequest {
            payment_id: outcome.payment.id,
            token: outcome.payment.token.clone(),
            amount: outcome.transaction.amount,
            currency: outcome.transaction.currency.clone(),
            psp_reference: outcome.payment.psp_reference.clone(),
            capture_on_confirm: false,
        };
        let operation = match outcome.transaction.kind {
            TransactionKind::Auth => Operation::Void,
            TransactionKind::Capture => Operation::Refund,
            _ => return Ok(None),
        };

        let intent = self.record_intent(conn, &request, operation).await?;
        let response = self.call_gateway(&outcome.payment, operation, &request).await;
        let response = screen_response(operation, &request, response);
        let transaction = self.settle_intent(conn, intent, &response).await?;
        if transaction.is_success {
            info!(kind = %transaction.kind, "compensated gateway charge");
        } else {
            warn!(
                kind = %operation.intent_kind(),
                error = transaction.error.as_deref().unwrap_or_default(),
                "gateway compensation failed"
            );
        }
        Ok(Some(transaction))
    }

    async fn call_gateway(
        &self,
        payment: &payment::Model,
        operation: Operation,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if payment.gateway == MANUAL_GATEWAY {
            let kind = match operation {
                Operation::Confirm if request.capture_on_confirm => TransactionKind::Capture,
                Operation::Confirm => TransactionKind::Auth,
                other => other.intent_kind(),
            };
            return Ok(manual_response(request, kind));
        }
        match operation {
            Operation::Authorize => self.gateway.authorize(request).await,
            Operation::Capture => self.gateway.capture(request).await,
            Operation::Void => self.gateway.void(request).await,
            Operation::Refund => self.gateway.refund(request).await,
            Operation::Confirm => self.gateway.confirm(request).await,
        }
    }

    /// Writes the transaction row before the gateway is called.
    async fn record_intent<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: &GatewayRequest,
        operation: Operation,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let intent = payment_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(request.payment_id),
            kind: Set(operation.intent_kind()),
            is_success: Set(false),
            action_required: Set(false),
            action_required_data: Set(None),
            amount: Set(request.amount),
            currency: Set(request.currency.clone()),
            token: Set(request.token.clone()),
            error: Set(None),
            already_processed: Set(false),
            gateway_response: Set(json!({})),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;
        debug!(transaction_id = %intent.id, kind = %intent.kind, "payment intent recorded");
        Ok(intent)
    }

    /// Fills the intent row in with the gateway's answer.
    async fn settle_intent<C: ConnectionTrait>(
        &self,
        conn: &C,
        intent: payment_transaction::Model,
        response: &Result<GatewayResponse, GatewayError>,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let mut active: payment_transaction::ActiveModel = intent.into();
        match response {
            Ok(response) => {
                active.kind = Set(response.kind);
                active.is_success = Set(response.is_success);
                active.action_required = Set(response.action_required);
                active.action_required_data = Set(response.action_required_data.clone());
                active.amount = Set(response.amount);
                active.error = Set(response.error.clone());
                active.gateway_response = Set(response.raw.clone());
            }
            Err(err) => {
                active.error = Set(Some(err.to_string()));
                active.gateway_response = Set(json!({ "error": err.to_string() }));
            }
        }
        let transaction = active.update(conn).await?;

        let outcome = if transaction.is_success { "success" } else { "failure" };
        PAYMENT_TRANSACTIONS
            .with_label_values(&[&transaction.kind.to_string(), outcome])
            .inc();
        Ok(transaction)
    }

    /// Flags a transaction whose effect is now part of the payment.
    async fn mark_processed<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction: payment_transaction::Model,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let mut active: payment_transaction::ActiveModel = transaction.into();
        active.already_processed = Set(true);
        Ok(active.update(conn).await?)
    }

    /// Earlier transaction of the payment the gateway says it is replaying.
    async fn processed_twin<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction: &payment_transaction::Model,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        let candidates = payment_transaction::Entity::find()
            .filter(payment_transaction::Column::PaymentId.eq(transaction.payment_id))
            .filter(payment_transaction::Column::Kind.eq(transaction.kind))
            .filter(payment_transaction::Column::IsSuccess.eq(true))
            .filter(payment_transaction::Column::AlreadyProcessed.eq(true))
            .filter(payment_transaction::Column::Id.ne(transaction.id))
            .order_by_desc(payment_transaction::Column::CreatedAt)
            .all(conn)
            .await?;
        Ok(candidates.into_iter().find(|candidate| {
            candidate.amount == transaction.amount
                && candidate.currency == transaction.currency
                && candidate.action_required == transaction.action_required
        }))
    }

    async fn run<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment: payment::Model,
        operation: Operation,
        amount: Decimal,
        capture_on_confirm: bool,
    ) -> Result<TransactionOutcome, ServiceError> {
        let request = GatewayRequest {
            payment_id: payment.id,
            token: payment.token.clone(),
            amount,
            currency: payment.currency.clone(),
            psp_reference: payment.psp_reference.clone(),
            capture_on_confirm,
        };

        let intent = self.record_intent(conn, &request, operation).await?;
        let response = self.call_gateway(&payment, operation, &request).await;
        let response = screen_response(operation, &request, response);
        let mut transaction = self.settle_intent(conn, intent, &response).await?;

        let (payment, error) = match response {
            Ok(response) if response.is_success => {
                let replayed = if response.already_processed {
                    self.processed_twin(conn, &transaction).await?
                } else {
                    None
                };
                match replayed {
                    Some(twin) => {
                        info!(
                            transaction_id = %transaction.id,
                            processed_id = %twin.id,
                            "gateway replayed a processed transaction, payment left as is"
                        );
                        (self.get(conn, payment.id).await?, None)
                    }
                    None => {
                        let payment = self
                            .advance(
                                conn,
                                payment.id,
                                response.kind,
                                response.amount,
                                response.psp_reference,
                            )
                            .await?;
                        transaction = self.mark_processed(conn, transaction).await?;
                        (payment, None)
                    }
                }
            }
            Ok(response) => {
                let message = response
                    .error
                    .unwrap_or_else(|| "Payment was declined".to_string());
                warn!(kind = %transaction.kind, error = %message, "gateway declined");
                (payment, Some(PaymentError::new(PaymentErrorCode::GatewayFailure, message)))
            }
            Err(err) => {
                warn!(error = %err, "gateway call failed");
                (
                    payment,
                    Some(PaymentError::new(PaymentErrorCode::GatewayFailure, err.to_string())),
                )
            }
        };

        info!(
            kind = %transaction.kind,
            success = transaction.is_success,
            charge_status = %payment.charge_status,
            "payment transaction processed"
        );
        Ok(TransactionOutcome {
            transaction,
            payment,
            error,
        })
    }

    /// Applies a successful transaction to freshly read payment data.
    async fn advance<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        kind: TransactionKind,
        amount: Decimal,
        psp_reference: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        for _ in 0..2 {
            let current = self.get(conn, payment_id).await?;
            if kind == TransactionKind::Capture && current.captured_amount + amount > current.total {
                return Err(refuse(
                    PaymentErrorCode::AmountExceeded,
                    format!(
                        "Capture of {amount} would exceed the payment total {}",
                        current.total
                    ),
                ));
            }
            let next = apply_transition(ChargeState::from(&current), kind, amount);
            let result = payment::Entity::update_many()
                .col_expr(
                    payment::Column::ChargeStatus,
                    Expr::value(next.charge_status.into_value()),
                )
                .col_expr(payment::Column::CapturedAmount, Expr::value(next.captured_amount))
                .col_expr(payment::Column::IsActive, Expr::value(next.is_active))
                .col_expr(payment::Column::ToConfirm, Expr::value(next.to_confirm))
                .col_expr(
                    payment::Column::PspReference,
                    Expr::value(psp_reference.clone().or(current.psp_reference.clone())),
                )
                .col_expr(payment::Column::Version, Expr::value(current.version + 1))
                .col_expr(payment::Column::ModifiedAt, Expr::value(Utc::now()))
                .filter(payment::Column::Id.eq(payment_id))
                .filter(payment::Column::Version.eq(current.version))
                .exec(conn)
                .await?;
            if result.rows_affected == 1 {
                return self.get(conn, payment_id).await;
            }
            warn!(payment_id = %payment_id, "payment changed concurrently, re-deriving charge state");
        }
        Err(ServiceError::ConcurrentModification(payment_id))
    }
}
