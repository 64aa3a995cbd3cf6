use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::invoice::{self, InvoiceStatus};
use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;
use crate::events::Notifier;
use crate::services::order_events::{self, Actor, OrderEventPayload};
use crate::services::orders::load_order;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceUpdate {
    pub number: Option<String>,
    pub url: Option<String>,
}

fn check_url(url: &str) -> Result<(), ServiceError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ServiceError::invalid_field("url", "Url must be an absolute http(s) address"))
    }
}

/// Invoices are produced by an external generator; the engine only tracks
/// their lifecycle: `pending` to `success` or `failed`.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
}

impl InvoiceService {
    pub fn new(db: Arc<DbPool>, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    async fn load(&self, invoice_id: Uuid) -> Result<invoice::Model, ServiceError> {
        invoice::Entity::find_by_id(invoice_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))
    }

    pub async fn for_order(&self, order_id: Uuid) -> Result<Vec<invoice::Model>, ServiceError> {
        Ok(invoice::Entity::find()
            .filter(invoice::Column::OrderId.eq(order_id))
            .order_by_asc(invoice::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn request(
        &self,
        actor: Actor,
        order_id: Uuid,
        number: Option<String>,
    ) -> Result<invoice::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let result = async {
            let order = load_order(&txn, order_id).await?;
            if matches!(order.status, OrderStatus::Draft | OrderStatus::Unconfirmed) {
                return Err(ServiceError::InvalidOrderStatusForAction(format!(
                    "Cannot request an invoice for an order that is {}",
                    order.status
                )));
            }
            if order.billing_address.is_none() {
                return Err(ServiceError::invalid_field(
                    "order_id",
                    "Cannot request an invoice for an order without a billing address",
                ));
            }
            let now = Utc::now();
            let invoice = invoice::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                number: Set(number),
                external_url: Set(None),
                status: Set(InvoiceStatus::Pending),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
            order_events::append(
                &txn,
                order.id,
                actor,
                OrderEventPayload::InvoiceRequested { invoice_id: invoice.id },
            )
            .await?;
            Ok(invoice)
        }
        .await;
        let invoice = db::finish(txn, result).await?;
        info!(invoice_id = %invoice.id, "invoice requested");
        self.notifier.invoice_requested(order_id, invoice.id).await;
        Ok(invoice)
    }

    #[instrument(skip(self, number, url), fields(invoice_id = %invoice_id))]
    pub async fn mark_generated(
        &self,
        actor: Actor,
        invoice_id: Uuid,
        number: String,
        url: String,
    ) -> Result<invoice::Model, ServiceError> {
        if number.trim().is_empty() {
            return Err(ServiceError::invalid_field("number", "Number is required"));
        }
        check_url(&url)?;
        let txn = self.db.begin().await?;
        let result = async {
            let invoice = invoice::Entity::find_by_id(invoice_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            if invoice.status == InvoiceStatus::Success {
                return Err(ServiceError::InvalidOperation(
                    "Invoice has already been generated".into(),
                ));
            }
            let order_id = invoice.order_id;
            let mut active: invoice::ActiveModel = invoice.into();
            active.number = Set(Some(number.clone()));
            active.external_url = Set(Some(url));
            active.status = Set(InvoiceStatus::Success);
            active.updated_at = Set(Utc::now());
            let invoice = active.update(&txn).await?;
            order_events::append(
                &txn,
                order_id,
                actor,
                OrderEventPayload::InvoiceGenerated { invoice_id, number },
            )
            .await?;
            Ok(invoice)
        }
        .await;
        db::finish(txn, result).await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_failed(&self, invoice_id: Uuid) -> Result<invoice::Model, ServiceError> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status == InvoiceStatus::Success {
            return Err(ServiceError::InvalidOperation(
                "Invoice has already been generated".into(),
            ));
        }
        let mut active: invoice::ActiveModel = invoice.into();
        active.status = Set(InvoiceStatus::Failed);
        active.updated_at = Set(Utc::now());
        let invoice = active.update(&*self.db).await?;
        info!(invoice_id = %invoice.id, "invoice generation failed");
        Ok(invoice)
    }

    #[instrument(skip(self, update), fields(invoice_id = %invoice_id))]
    pub async fn update(
        &self,
        actor: Actor,
        invoice_id: Uuid,
        update: InvoiceUpdate,
    ) -> Result<invoice::Model, ServiceError> {
        if update.number.is_none() && update.url.is_none() {
            return Err(ServiceError::invalid_field("number", "Either number or url is required"));
        }
        if let Some(url) = &update.url {
            check_url(url)?;
        }
        let txn = self.db.begin().await?;
        let result = async {
            let invoice = invoice::Entity::find_by_id(invoice_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            if invoice.status == InvoiceStatus::Success {
                return Err(ServiceError::InvalidOperation(
                    "A generated invoice cannot be updated".into(),
                ));
            }
            let order_id = invoice.order_id;
            let mut active: invoice::ActiveModel = invoice.into();
            if let Some(number) = &update.number {
                active.number = Set(Some(number.clone()));
            }
            if let Some(url) = &update.url {
                active.external_url = Set(Some(url.clone()));
            }
            active.updated_at = Set(Utc::now());
            let invoice = active.update(&txn).await?;
            order_events::append(
                &txn,
                order_id,
                actor,
                OrderEventPayload::InvoiceUpdated {
                    invoice_id,
                    number: update.number,
                    url: update.url,
                },
            )
            .await?;
            Ok(invoice)
        }
        .await;
        db::finish(txn, result).await
    }

    /// Sends a generated invoice to the customer.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send(&self, actor: Actor, invoice_id: Uuid) -> Result<invoice::Model, ServiceError> {
        let invoice = self.load(invoice_id).await?;
        if invoice.status != InvoiceStatus::Success || invoice.external_url.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Provided invoice is not ready to be sent".into(),
            ));
        }
        order_events::append(
            &*self.db,
            invoice.order_id,
            actor,
            OrderEventPayload::InvoiceSent { invoice_id },
        )
        .await?;
        info!(invoice_id = %invoice_id, "invoice sent");
        self.notifier.invoice_sent(invoice.order_id, invoice_id).await;
        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_must_be_absolute() {
        assert!(check_url("https://invoices.example.com/1.pdf").is_ok());
        assert!(check_url("http://localhost/1.pdf").is_ok());
        assert!(check_url("/relative/1.pdf").is_err());
        assert!(check_url("ftp://example.com/1.pdf").is_err());
    }
}
