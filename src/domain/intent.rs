use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Side;

/// Where an entry level executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPrice {
    Market,
    Limit(Decimal),
}

impl EntryPrice {
    pub fn limit(&self) -> Option<Decimal> {
        match self {
            EntryPrice::Market => None,
            EntryPrice::Limit(p) => Some(*p),
        }
    }

    /// Price used for risk: the limit, or the reference price for market levels
    pub fn resolve(&self, reference: Option<Decimal>) -> Option<Decimal> {
        self.limit().or(reference)
    }
}

/// When a resting entry order should exist on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryActivation {
    /// Placed as soon as the ladder executes
    #[default]
    Immediate,
    /// Placed once price comes within the activation buffer of the level
    Touch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLevel {
    pub price: EntryPrice,
    pub weight: Decimal,
    #[serde(default)]
    pub activation: EntryActivation,
}

impl EntryLevel {
    pub fn limit(price: Decimal, weight: Decimal) -> Self {
        Self {
            price: EntryPrice::Limit(price),
            weight,
            activation: EntryActivation::Immediate,
        }
    }

    pub fn market(weight: Decimal) -> Self {
        Self {
            price: EntryPrice::Market,
            weight,
            activation: EntryActivation::Immediate,
        }
    }

    pub fn touch(mut self) -> Self {
        self.activation = EntryActivation::Touch;
        self
    }
}

/// One exit level of a take-profit ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLevel {
    pub price: Decimal,
    /// Percent of the position closed at this level (0-100)
    pub close_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfit {
    Single(Decimal),
    Ladder(Vec<TargetLevel>),
    /// Target placed at entry +/- stop distance * multiple
    RiskReward(Decimal),
}

/// Bucket used by the expected-value gate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyClass {
    pub archetype: String,
    pub symbol: String,
}

impl StrategyClass {
    pub fn new(archetype: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            archetype: archetype.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for StrategyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.archetype, self.symbol)
    }
}

/// What an upstream producer (UI wizard, scenario feed) asks us to trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub entries: Vec<EntryLevel>,
    pub stop: Decimal,
    pub risk_usd: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub take_profit: Option<TakeProfit>,
    #[serde(default)]
    pub strategy_class: Option<StrategyClass>,
}

impl TradeIntent {
    pub fn weight_sum(&self) -> Decimal {
        self.entries.iter().map(|e| e.weight).sum()
    }

    pub fn has_market_entry(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.price, EntryPrice::Market))
    }

    pub fn has_touch_entry(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.activation == EntryActivation::Touch)
    }

    /// Whether planning needs the current mark price
    pub fn needs_reference_price(&self) -> bool {
        self.has_market_entry() || self.has_touch_entry()
    }

    /// Weighted entry across levels, resolving market levels with `reference`
    pub fn weighted_entry(&self, reference: Option<Decimal>) -> Option<Decimal> {
        let total = self.weight_sum();
        if total <= Decimal::ZERO {
            return None;
        }
        let mut acc = Decimal::ZERO;
        for level in &self.entries {
            acc += level.weight * level.price.resolve(reference)?;
        }
        Some(acc / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_json_shape() {
        let json = r#"{
            "owner": "u1",
            "symbol": "BTCUSDT",
            "side": "long",
            "entries": [
                {"price": {"limit": "95000"}, "weight": "0.6"},
                {"price": "market", "weight": "0.4", "activation": "touch"}
            ],
            "stop": "94300",
            "risk_usd": "10",
            "leverage": "5",
            "take_profit": {"risk_reward": "2"}
        }"#;

        let intent: TradeIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.entries[0].price, EntryPrice::Limit(dec!(95000)));
        assert_eq!(intent.entries[1].activation, EntryActivation::Touch);
        assert_eq!(intent.take_profit, Some(TakeProfit::RiskReward(dec!(2))));
        assert!(intent.strategy_class.is_none());
        assert!(intent.needs_reference_price());
    }

    #[test]
    fn test_weighted_entry() {
        let intent = TradeIntent {
            owner: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entries: vec![
                EntryLevel::limit(dec!(95000), dec!(0.6)),
                EntryLevel::limit(dec!(94800), dec!(0.4)),
            ],
            stop: dec!(94300),
            risk_usd: dec!(10),
            leverage: dec!(5),
            take_profit: None,
            strategy_class: None,
        };

        assert_eq!(intent.weighted_entry(None), Some(dec!(94920)));
        assert!(!intent.needs_reference_price());
    }
}
