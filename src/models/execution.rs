//! Outcome of one order action.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub order_id: Option<u64>,
    pub fill_price: Option<Decimal>,
    pub fill_size: Option<Decimal>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn filled(order_id: Option<u64>, price: Decimal, size: Decimal) -> Self {
        Self {
            success: true,
            order_id,
            fill_price: Some(price),
            fill_size: Some(size),
            error: None,
        }
    }

    /// Accepted by the exchange but not filled yet.
    pub fn resting(order_id: u64) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            ..Default::default()
        }
    }

    /// Some size filled but the action is incomplete.
    pub fn partial(price: Decimal, size: Decimal, error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            fill_price: Some(price),
            fill_size: Some(size),
            error: Some(error.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_resting(&self) -> bool {
        self.success && self.fill_price.is_none() && self.order_id.is_some()
    }
}
