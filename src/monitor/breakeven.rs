use rust_decimal::Decimal;

use crate::config::BreakevenConfig;
use crate::domain::Side;
use crate::risk::{quantize_price, PriceRole};

/// What the breakeven rule looks at on each cycle
#[derive(Debug, Clone)]
pub struct BreakevenInput<'a> {
    pub side: Side,
    pub entry: Decimal,
    pub current_stop: Option<Decimal>,
    pub peak_size: Decimal,
    pub size: Decimal,
    /// 1-based indices of targets seen filled
    pub targets_filled: &'a [usize],
    pub already_applied: bool,
    pub tick_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct BreakevenRule {
    config: BreakevenConfig,
}

impl BreakevenRule {
    pub fn new(config: BreakevenConfig) -> Self {
        Self { config }
    }

    /// Stop price at entry (plus fee allowance)
    pub fn breakeven_price(&self, side: Side, entry: Decimal, tick_size: Decimal) -> Decimal {
        let raw = entry * (Decimal::ONE + side.sign() * self.config.fee_buffer_pct);
        quantize_price(raw, tick_size, PriceRole::Stop, side)
    }

    /// New stop to apply, if the rule fires now
    pub fn evaluate(&self, input: &BreakevenInput<'_>) -> Option<Decimal> {
        if !self.config.enabled || input.already_applied || input.peak_size <= Decimal::ZERO {
            return None;
        }
        if !input
            .targets_filled
            .iter()
            .any(|index| *index >= self.config.after_target)
        {
            return None;
        }

        let closed_fraction = (input.peak_size - input.size) / input.peak_size;
        if closed_fraction < self.config.min_closed_fraction {
            return None;
        }

        let price = self.breakeven_price(input.side, input.entry, input.tick_size);
        match input.current_stop {
            Some(stop) if !input.side.stop_improves(stop, price) => None,
            _ => Some(price),
        }
    }
}
