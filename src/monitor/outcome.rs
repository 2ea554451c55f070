//! Closed-trade taxonomy and R-multiple accounting

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::{ExitTrigger, Side, StrategyClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    /// Original stop hit before breakeven protection
    EarlyStop,
    BreakevenAfterTarget,
    /// Stop hit beyond breakeven, in profit
    TrailingStopInProfit,
    Target1Final,
    Target2Final,
    Target3Final,
    /// Closed by something other than our protective levels
    ExternalClose,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::EarlyStop => "early_stop",
            TradeOutcome::BreakevenAfterTarget => "breakeven_after_target",
            TradeOutcome::TrailingStopInProfit => "trailing_stop_in_profit",
            TradeOutcome::Target1Final => "target_1_final",
            TradeOutcome::Target2Final => "target_2_final",
            TradeOutcome::Target3Final => "target_3_final",
            TradeOutcome::ExternalClose => "external_close",
        }
    }

    fn for_target(index: usize) -> Self {
        match index {
            0 | 1 => TradeOutcome::Target1Final,
            2 => TradeOutcome::Target2Final,
            _ => TradeOutcome::Target3Final,
        }
    }
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the final fill closed the position
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub side: Side,
    pub entry: Decimal,
    pub trigger: ExitTrigger,
    pub exit_price: Decimal,
    /// Index of the target order that took the last fill, if one did
    pub closing_target: Option<usize>,
    /// Stop set by the breakeven rule, if it fired
    pub breakeven_stop: Option<Decimal>,
}

pub fn classify(exit: &ExitContext) -> TradeOutcome {
    match exit.trigger {
        ExitTrigger::TakeProfit => TradeOutcome::for_target(exit.closing_target.unwrap_or(1)),
        ExitTrigger::StopLoss => match exit.breakeven_stop {
            Some(be) if exit.side.favorable_move(be, exit.exit_price) > Decimal::ZERO => {
                TradeOutcome::TrailingStopInProfit
            }
            Some(_) => TradeOutcome::BreakevenAfterTarget,
            None if exit.side.favorable_move(exit.entry, exit.exit_price) > Decimal::ZERO => {
                TradeOutcome::TrailingStopInProfit
            }
            None => TradeOutcome::EarlyStop,
        },
        ExitTrigger::Manual | ExitTrigger::Liquidation => TradeOutcome::ExternalClose,
    }
}

/// Realized R: signed exit distance weighted by closed quantity, over the
/// initial risk (entered quantity times initial stop distance).
pub fn r_multiple(side: Side, entry: Decimal, initial_stop: Decimal, entered_qty: Decimal, fills: &[(Decimal, Decimal)]) -> Decimal {
    let initial_risk = entered_qty * (entry - initial_stop).abs();
    if initial_risk.is_zero() {
        return Decimal::ZERO;
    }
    let realized: Decimal = fills
        .iter()
        .map(|(qty, price)| *qty * side.favorable_move(entry, *price))
        .sum();
    (realized / initial_risk).round_dp(4)
}

/// One closed trade as fed to the EV book and reported downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub strategy_class: Option<StrategyClass>,
    pub outcome: TradeOutcome,
    pub r_multiple: Decimal,
    pub entry: Decimal,
    pub exit_price: Decimal,
    pub initial_stop: Decimal,
    pub entered_qty: Decimal,
    pub targets_filled: Vec<usize>,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exit(trigger: ExitTrigger, exit_price: Decimal) -> ExitContext {
        ExitContext {
            side: Side::Long,
            entry: dec!(95000),
            trigger,
            exit_price,
            closing_target: None,
            breakeven_stop: None,
        }
    }

    #[test]
    fn test_stop_classification() {
        assert_eq!(classify(&exit(ExitTrigger::StopLoss, dec!(94300))), TradeOutcome::EarlyStop);

        let mut be = exit(ExitTrigger::StopLoss, dec!(95000));
        be.breakeven_stop = Some(dec!(95000));
        assert_eq!(classify(&be), TradeOutcome::BreakevenAfterTarget);

        let mut trailed = exit(ExitTrigger::StopLoss, dec!(95600));
        trailed.breakeven_stop = Some(dec!(95000));
        assert_eq!(classify(&trailed), TradeOutcome::TrailingStopInProfit);
    }

    #[test]
    fn test_target_classification() {
        let mut tp = exit(ExitTrigger::TakeProfit, dec!(97000));
        assert_eq!(classify(&tp), TradeOutcome::Target1Final);
        tp.closing_target = Some(2);
        assert_eq!(classify(&tp), TradeOutcome::Target2Final);
        tp.closing_target = Some(5);
        assert_eq!(classify(&tp), TradeOutcome::Target3Final);

        assert_eq!(classify(&exit(ExitTrigger::Manual, dec!(95100))), TradeOutcome::ExternalClose);
        assert_eq!(classify(&exit(ExitTrigger::Liquidation, dec!(76000))), TradeOutcome::ExternalClose);
    }

    #[test]
    fn test_r_multiple() {
        // Full stop-out is -1R
        let r = r_multiple(Side::Long, dec!(95000), dec!(94300), dec!(0.014), &[(dec!(0.014), dec!(94300))]);
        assert_eq!(r, dec!(-1));

        // Half at +1R, half at breakeven
        let r = r_multiple(
            Side::Long,
            dec!(95000),
            dec!(94300),
            dec!(0.014),
            &[(dec!(0.007), dec!(95700)), (dec!(0.007), dec!(95000))],
        );
        assert_eq!(r, dec!(0.5));

        // Short at 2R
        let r = r_multiple(Side::Short, dec!(100), dec!(101), dec!(3), &[(dec!(3), dec!(98))]);
        assert_eq!(r, dec!(2));

        assert_eq!(r_multiple(Side::Long, dec!(100), dec!(100), dec!(1), &[]), Decimal::ZERO);
    }
}
