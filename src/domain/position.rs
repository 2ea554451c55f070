use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Exchange-reported open exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry: Decimal,
    pub stop: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    /// Only present when the exchange supplies it
    pub liq_price: Option<Decimal>,
    pub mark_price: Decimal,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }
}

/// Liquidation price together with how much to trust it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEstimate {
    pub price: Decimal,
    /// Locally approximated (maintenance margin and fees not modelled)
    pub approximate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    #[default]
    Isolated,
    /// Cross margin backed by extra account collateral
    Cross { collateral: Decimal },
}

/// Position-level stop / target replacement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionUpdate {
    pub owner: String,
    pub symbol: String,
    pub stop: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Which mechanism closed a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
    /// Reduce-only or market close placed by a client
    Manual,
    Liquidation,
}

/// Last closing fill of a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitFill {
    pub price: Decimal,
    pub qty: Decimal,
    pub trigger: ExitTrigger,
    /// Client key of the closing order, if an order closed it
    pub order_key: Option<String>,
    pub at: DateTime<Utc>,
}
