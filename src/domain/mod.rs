pub mod instrument;
pub mod intent;
pub mod order;
pub mod position;

pub use instrument::InstrumentRules;
pub use intent::{
    EntryActivation, EntryLevel, EntryPrice, StrategyClass, TakeProfit, TargetLevel, TradeIntent,
};
pub use order::{OrderRole, OrderSide, OrderSnapshot, OrderSpec, OrderStatus, OrderType};
pub use position::{
    ExitFill, ExitTrigger, LiquidationEstimate, MarginMode, Position, ProtectionUpdate,
};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// +1 for long, -1 for short; multiplies a price move into PnL
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens or adds to the position
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes the position
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// Stop must sit strictly beyond the entry on the losing side
    pub fn stop_is_beyond(&self, entry: Decimal, stop: Decimal) -> bool {
        match self {
            Side::Long => stop < entry,
            Side::Short => stop > entry,
        }
    }

    /// Target must sit strictly beyond the entry on the winning side
    pub fn target_is_beyond(&self, entry: Decimal, target: Decimal) -> bool {
        match self {
            Side::Long => target > entry,
            Side::Short => target < entry,
        }
    }

    /// Signed move from `from` to `to`, positive when favourable
    pub fn favorable_move(&self, from: Decimal, to: Decimal) -> Decimal {
        (to - from) * self.sign()
    }

    /// Whether `candidate` is a better (more protective) stop than `current`
    pub fn stop_improves(&self, current: Decimal, candidate: Decimal) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}
