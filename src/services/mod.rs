// Leaves first: the ledger, pricing, gateway and event log have no
// dependency on the aggregates built on top of them.
pub mod address;
pub mod gateway;
pub mod order_events;
pub mod pricing;
pub mod stock_ledger;

pub mod payments;

pub mod checkout;
pub mod fulfillments;
pub mod invoices;
pub mod orders;

use crate::config::AppConfig;

/// Engine-wide knobs taken from the application configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_checkout_line_quantity: i32,
    pub fulfillment_auto_approve: bool,
    pub fulfillment_allow_unpaid: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_checkout_line_quantity: 50,
            fulfillment_auto_approve: true,
            fulfillment_allow_unpaid: true,
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_checkout_line_quantity: config.max_checkout_line_quantity,
            fulfillment_auto_approve: config.fulfillment_auto_approve,
            fulfillment_allow_unpaid: config.fulfillment_allow_unpaid,
        }
    }
}
