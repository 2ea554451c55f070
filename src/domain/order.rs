use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// What an order is for within a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    /// Entry ladder level (0-based index into the intent's levels)
    Entry { level: usize },
    Stop,
    /// Reduce-only target; `revision` changes when targets are re-placed
    TakeProfit { index: usize, revision: u32 },
    /// Market close of the filled quantity (rollback)
    Close,
}

impl OrderRole {
    /// Stable tag mixed into idempotency keys
    pub fn tag(&self) -> String {
        match self {
            OrderRole::Entry { level } => format!("entry-{}", level),
            OrderRole::Stop => "sl".to_string(),
            OrderRole::TakeProfit { index, revision } => format!("tp-{}-r{}", index, revision),
            OrderRole::Close => "close".to_string(),
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, OrderRole::Entry { .. })
    }
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One intended exchange order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub owner: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    /// None for market orders
    pub price: Option<Decimal>,
    /// Conditional placement threshold for touch-activated entries
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    /// Client-assigned idempotency key
    pub key: String,
    pub role: OrderRole,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Conditional order waiting for its trigger
    Untriggered,
    /// Live on the book
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Untriggered | OrderStatus::New | OrderStatus::PartiallyFilled
        )
    }
}

/// Order state read back from the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub key: String,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    /// Zero until the exchange has settled the fill price
    pub avg_price: Decimal,
}

impl OrderSnapshot {
    /// Filled with a usable average price
    pub fn is_final_fill(&self) -> bool {
        self.status == OrderStatus::Filled && self.avg_price > Decimal::ZERO
    }
}
