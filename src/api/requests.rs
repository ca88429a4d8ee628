use serde::{Deserialize, Serialize};

/// Request to create an order on the demo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub item: String,
    pub quantity: u32,
    /// Alternative to the idempotency header when `body_key = "request_id"`
    pub request_id: Option<String>,
}

impl CreateOrderRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.item.trim().is_empty() {
            errors.push(ValidationError::new("item", "item cannot be empty"));
        }

        if self.quantity == 0 {
            errors.push(ValidationError::new("quantity", "quantity must be positive"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}
