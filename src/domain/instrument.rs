use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-symbol quantization grid and limits, immutable for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub symbol: String,
    pub qty_step: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
    pub max_leverage: Decimal,
}

impl InstrumentRules {
    /// Sanity checks on exchange-supplied rules
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.qty_step <= Decimal::ZERO {
            errors.push(format!("{}: qty_step must be positive", self.symbol));
        }
        if self.tick_size <= Decimal::ZERO {
            errors.push(format!("{}: tick_size must be positive", self.symbol));
        }
        if self.min_qty < Decimal::ZERO || self.max_qty < self.min_qty {
            errors.push(format!(
                "{}: qty bounds [{}, {}] are inconsistent",
                self.symbol, self.min_qty, self.max_qty
            ));
        }
        if self.min_notional < Decimal::ZERO {
            errors.push(format!("{}: min_notional must not be negative", self.symbol));
        }
        if self.max_leverage < Decimal::ONE {
            errors.push(format!("{}: max_leverage must be at least 1", self.symbol));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
