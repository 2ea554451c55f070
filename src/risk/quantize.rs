//! Snapping quantities and prices onto an exchange's discrete grid

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    /// Toward negative infinity
    Down,
    /// Toward positive infinity
    Up,
    /// Nearest multiple, midpoint away from zero
    Nearest,
}

/// What a price is used for; decides its rounding direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceRole {
    Entry,
    Stop,
    Target,
}

/// Round `value` to a multiple of `step`. A non-positive step leaves the value untouched.
pub fn quantize(value: Decimal, step: Decimal, mode: RoundingMode) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let units = value / step;
    let units = match mode {
        RoundingMode::Down => units.floor(),
        RoundingMode::Up => units.ceil(),
        RoundingMode::Nearest => units.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
    };
    (units * step).normalize()
}

/// Quantities always floor so a rounded order never exceeds the budget
pub fn quantize_qty(qty: Decimal, step: Decimal) -> Decimal {
    quantize(qty, step, RoundingMode::Down).max(Decimal::ZERO)
}

/// Rounding direction that never makes the price worse for its role.
///
/// Entries round toward a better fill, stops round toward the entry
/// (smaller loss), targets round toward the entry (never overstating reward).
pub fn price_rounding(role: PriceRole, side: Side) -> RoundingMode {
    match (role, side) {
        (PriceRole::Entry, Side::Long) => RoundingMode::Down,
        (PriceRole::Entry, Side::Short) => RoundingMode::Up,
        (PriceRole::Stop, Side::Long) => RoundingMode::Up,
        (PriceRole::Stop, Side::Short) => RoundingMode::Down,
        (PriceRole::Target, Side::Long) => RoundingMode::Down,
        (PriceRole::Target, Side::Short) => RoundingMode::Up,
    }
}

pub fn quantize_price(price: Decimal, tick: Decimal, role: PriceRole, side: Side) -> Decimal {
    quantize(price, tick, price_rounding(role, side))
}
