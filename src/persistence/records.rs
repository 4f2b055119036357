//! High-volume records routed through batch writers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::AgentId;

/// OHLCV bar for one symbol and interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn group_key(&self) -> (String, String) {
        (self.symbol.clone(), self.interval.clone())
    }

    /// Collapse repeated updates of the same bar to the latest one.
    ///
    /// A multi-row upsert may not touch the same row twice, and a still-open
    /// bar is usually updated several times per flush.
    pub fn latest_per_bar(rows: Vec<Candle>) -> Vec<Candle> {
        let mut slots: HashMap<(String, String, DateTime<Utc>), usize> = HashMap::new();
        let mut latest: Vec<Candle> = Vec::with_capacity(rows.len());

        for candle in rows {
            let key = (candle.symbol.clone(), candle.interval.clone(), candle.open_time);
            match slots.get(&key) {
                Some(&slot) => latest[slot] = candle,
                None => {
                    slots.insert(key, latest.len());
                    latest.push(candle);
                }
            }
        }
        latest
    }
}

/// Telemetry kinds emitted by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    PositionSnapshot,
    PositionClosed,
    LockLost,
    Decision,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::PositionSnapshot => "position_snapshot",
            TelemetryKind::PositionClosed => "position_closed",
            TelemetryKind::LockLost => "lock_lost",
            TelemetryKind::Decision => "decision",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry point for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTelemetry {
    pub agent_id: AgentId,
    pub kind: TelemetryKind,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AgentTelemetry {
    pub fn new(agent_id: AgentId, kind: TelemetryKind, payload: serde_json::Value) -> Self {
        Self {
            agent_id,
            kind,
            payload,
            recorded_at: Utc::now(),
        }
    }

    pub fn group_key(&self) -> (AgentId, TelemetryKind) {
        (self.agent_id.clone(), self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(symbol: &str, minute: u32, close: Decimal) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: "1m".into(),
            open_time: Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0).unwrap(),
            open: dec!(100),
            high: close.max(dec!(100)),
            low: close.min(dec!(100)),
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_repeated_bar_keeps_latest_update() {
        let rows = vec![
            bar("BTCUSDT", 0, dec!(101)),
            bar("ETHUSDT", 0, dec!(50)),
            bar("BTCUSDT", 0, dec!(103)),
            bar("BTCUSDT", 1, dec!(104)),
            bar("BTCUSDT", 0, dec!(102)),
        ];

        let latest = Candle::latest_per_bar(rows);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].close, dec!(102));
        assert_eq!(latest[1].symbol, "ETHUSDT");
        assert_eq!(latest[2].close, dec!(104));
    }
}
