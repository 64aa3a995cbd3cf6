use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::prelude::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::payment_transaction::TransactionKind;

/// Everything a gateway needs to act on a payment.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    pub payment_id: Uuid,
    pub token: String,
    pub amount: Decimal,
    pub currency: String,
    pub psp_reference: Option<String>,
    /// Whether a confirmed payment should end up captured rather than authorized.
    pub capture_on_confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub is_success: bool,
    pub action_required: bool,
    pub action_required_data: Option<Json>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub psp_reference: Option<String>,
    pub error: Option<String>,
    /// Set when the provider recognised the call as a replay of one it already handled.
    #[serde(default)]
    pub already_processed: bool,
    pub raw: Json,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Payment gateway rejected the request: {0}")]
    Rejected(String),
}

/// Outbound payment provider. Calls are never assumed idempotent.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn authorize(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    async fn capture(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    async fn void(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    async fn refund(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    async fn confirm(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Scripted gateway driven by the payment token prefix.
///
/// * `declined...` fails every call
/// * `3ds...` asks for confirmation on authorize/capture, succeeds on confirm
/// * `pending...` reports a pending charge
/// * `unavailable...` errors out as if the provider was unreachable
/// * anything else succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyGateway;

impl DummyGateway {
    pub const NAME: &'static str = "dummy";

    fn respond(
        &self,
        request: &GatewayRequest,
        kind: TransactionKind,
        allow_action: bool,
    ) -> Result<GatewayResponse, GatewayError> {
        let token = request.token.as_str();
        if token.starts_with("unavailable") {
            return Err(GatewayError::Unavailable("connection refused".into()));
        }

        let psp_reference = request
            .psp_reference
            .clone()
            .unwrap_or_else(|| format!("dummy-{}", Uuid::new_v4().simple()));

        let (is_success, action_required, kind, error) = if token.starts_with("declined") {
            (false, false, kind, Some("Card declined".to_string()))
        } else if allow_action && token.starts_with("3ds") {
            (true, true, TransactionKind::ActionToConfirm, None)
        } else if token.starts_with("pending") && kind != TransactionKind::Void {
            (true, false, TransactionKind::Pending, None)
        } else {
            (true, false, kind, None)
        };

        let action_required_data = action_required.then(|| {
            json!({
                "redirect_url": format!("https://dummy.example/3ds/{}", request.payment_id),
                "psp_reference": psp_reference,
            })
        });

        Ok(GatewayResponse {
            is_success,
            action_required,
            action_required_data,
            kind,
            amount: request.amount,
            raw: json!({
                "gateway": Self::NAME,
                "kind": kind.to_string(),
                "amount": request.amount.to_string(),
                "currency": request.currency,
                "success": is_success,
            }),
            psp_reference: Some(psp_reference),
            error,
            already_processed: false,
        })
    }
}

#[async_trait]
impl PaymentGateway for DummyGateway {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn authorize(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.respond(request, TransactionKind::Auth, true)
    }

    async fn capture(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.respond(request, TransactionKind::Capture, true)
    }

    async fn void(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.respond(request, TransactionKind::Void, false)
    }

    async fn refund(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.respond(request, TransactionKind::Refund, false)
    }

    async fn confirm(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let kind = if request.capture_on_confirm {
            TransactionKind::Capture
        } else {
            TransactionKind::Auth
        };
        self.respond(request, kind, false)
    }
}
