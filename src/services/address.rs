use sea_orm::prelude::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::ServiceError;

/// Postal address stored as JSON on checkouts and orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, max = 256))]
    pub first_name: String,
    #[validate(length(min = 1, max = 256))]
    pub last_name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[validate(length(min = 1, max = 256))]
    pub address_line_1: String,
    #[serde(default)]
    pub address_line_2: Option<String>,
    #[validate(length(min = 1, max = 256))]
    pub city: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    /// ISO 3166-1 alpha-2
    #[validate(length(equal = 2))]
    pub country_code: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Address {
    /// Validates the address and converts it into its stored JSON form.
    pub fn to_json(&self) -> Result<Json, ServiceError> {
        self.validate()?;
        let mut address = self.clone();
        address.country_code = address.country_code.to_ascii_uppercase();
        Ok(serde_json::to_value(address)?)
    }

    pub fn from_json(value: &Json) -> Result<Self, ServiceError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Country of a stored address, if it has one.
pub fn country_of(value: Option<&Json>) -> Option<String> {
    value
        .and_then(|address| address.get("country_code"))
        .and_then(|code| code.as_str())
        .map(str::to_ascii_uppercase)
}
