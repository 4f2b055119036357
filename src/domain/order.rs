use serde::{Deserialize, Serialize};

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Resting on the book
    Open,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Conditional order triggered and closed by the exchange
    Closed,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// Whether a protective order actually executed (as opposed to being pulled)
    pub fn is_executed(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Closed)
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "OPEN" | "NEW" => Ok(OrderStatus::Open),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CLOSED" | "TRIGGERED" => Ok(OrderStatus::Closed),
            "CANCELED" | "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "EXPIRED" => Ok(OrderStatus::Expired),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

/// Minimal view of an exchange order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executed_statuses() {
        assert!(OrderStatus::Filled.is_executed());
        assert!(OrderStatus::Closed.is_executed());
        assert!(!OrderStatus::Cancelled.is_executed());
        assert!(!OrderStatus::Open.is_executed());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_exchange_status_aliases() {
        assert_eq!(OrderStatus::try_from("canceled").unwrap(), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::try_from("NEW").unwrap(), OrderStatus::Open);
        assert!(OrderStatus::try_from("limbo").is_err());
    }
}
