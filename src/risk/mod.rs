pub mod calculator;
pub mod quantize;

pub use calculator::{
    LiquidationInput, OrderCheck, PositionSizing, RiskCalculator, SizingRequest,
};
pub use quantize::{price_rounding, quantize, quantize_price, quantize_qty, PriceRole, RoundingMode};
