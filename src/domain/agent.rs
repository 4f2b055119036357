use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque identity of one agent across the whole fleet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Desired lifecycle status of an agent as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Stopped => "stopped",
        }
    }
}

impl TryFrom<&str> for AgentStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "running" => Ok(AgentStatus::Running),
            "stopped" => Ok(AgentStatus::Stopped),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted agent record restored on recovery and saved after closures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub status: AgentStatus,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub realized_pnl: Decimal,
    /// Protective orders placed with the last opened position
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: impl Into<AgentId>, user_id: &str, symbol: &str, initial_balance: Decimal) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            status: AgentStatus::Running,
            initial_balance,
            current_balance: initial_balance,
            realized_pnl: Decimal::ZERO,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Book a realized close against the running balance
    pub fn apply_realized_pnl(&mut self, pnl: Decimal) {
        self.current_balance += pnl;
        self.realized_pnl += pnl;
        self.stop_loss_order_id = None;
        self.take_profit_order_id = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_realized_pnl_clears_protective_orders() {
        let mut record = AgentRecord::new("a1", "u1", "BTCUSDT", dec!(1000));
        record.stop_loss_order_id = Some("sl-1".into());
        record.take_profit_order_id = Some("tp-1".into());

        record.apply_realized_pnl(dec!(-25.5));

        assert_eq!(record.current_balance, dec!(974.5));
        assert_eq!(record.realized_pnl, dec!(-25.5));
        assert!(record.stop_loss_order_id.is_none());
        assert!(record.take_profit_order_id.is_none());
    }

    #[test]
    fn test_agent_status_parse() {
        assert_eq!(AgentStatus::try_from("RUNNING").unwrap(), AgentStatus::Running);
        assert!(AgentStatus::try_from("paused").is_err());
    }
}
