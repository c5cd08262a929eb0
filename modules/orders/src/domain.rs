//! Order model and input validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Event type written to the outbox when an order is placed
pub const ORDER_CREATED: &str = "order.created";

pub const STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub customer_name: String,
    pub customer_email: String,
    /// Minor currency units
    pub total_amount: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /orders`; every field is optional so that missing fields
/// surface as validation errors rather than deserialization failures
///
/// `total_amount` is kept as raw JSON so that decimals and strings are
/// reported in the validation details instead of failing extraction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub total_amount: Option<Value>,
}

/// A validated order ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub customer_name: String,
    pub customer_email: String,
    pub total_amount: i64,
}

impl CreateOrderRequest {
    /// Validate the request, collecting every problem rather than the first
    pub fn validate(self) -> Result<NewOrder, Vec<String>> {
        let mut errors = Vec::new();

        let customer_name = self
            .customer_name
            .map(|name| name.trim().to_string())
            .unwrap_or_default();
        if customer_name.is_empty() {
            errors.push("customer_name is required".to_string());
        }

        let customer_email = self
            .customer_email
            .map(|email| email.trim().to_string())
            .unwrap_or_default();
        if customer_email.is_empty() {
            errors.push("customer_email is required".to_string());
        } else if !is_valid_email(&customer_email) {
            errors.push("customer_email must be a valid email".to_string());
        }

        let total_amount = match minor_units(self.total_amount.as_ref()) {
            Ok(amount) if amount > 0 => amount,
            Ok(_) => {
                errors.push("total_amount must be greater than 0".to_string());
                0
            }
            Err(message) => {
                errors.push(message.to_string());
                0
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(NewOrder {
            customer_name,
            customer_email,
            total_amount,
        })
    }
}

/// Amount in minor units; absent or null counts as zero
fn minor_units(value: Option<&Value>) -> Result<i64, &'static str> {
    let number = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(number)) => number,
        Some(_) => return Err("total_amount must be a number"),
    };

    if let Some(amount) = number.as_i64() {
        return Ok(amount);
    }

    match number.as_f64() {
        Some(amount) if amount.fract() == 0.0 && amount.abs() < i64::MAX as f64 => {
            Ok(amount as i64)
        }
        Some(amount) if amount.fract() != 0.0 => {
            Err("total_amount must be a whole number of minor units")
        }
        _ => Err("total_amount is out of range"),
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
