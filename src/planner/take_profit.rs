//! Resolving a take-profit spec against the realized entry

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{InstrumentRules, Side, TakeProfit};
use crate::risk::{quantize_price, quantize_qty, PriceRole};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOrder {
    /// 1-based target level
    pub index: usize,
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetPlan {
    None,
    /// Single target attached to the position itself
    Position(TargetOrder),
    /// Ladder of separate reduce-only orders
    Orders(Vec<TargetOrder>),
}

impl TargetPlan {
    pub fn orders(&self) -> Vec<TargetOrder> {
        match self {
            TargetPlan::None => Vec::new(),
            TargetPlan::Position(t) => vec![t.clone()],
            TargetPlan::Orders(ts) => ts.clone(),
        }
    }

    pub fn position_target(&self) -> Option<Decimal> {
        match self {
            TargetPlan::Position(t) => Some(t.price),
            _ => None,
        }
    }

    /// Quantity-weighted target price
    pub fn weighted_price(&self) -> Option<Decimal> {
        let orders = self.orders();
        let qty: Decimal = orders.iter().map(|t| t.qty).sum();
        if qty.is_zero() {
            return None;
        }
        Some(orders.iter().map(|t| t.price * t.qty).sum::<Decimal>() / qty)
    }
}

/// Build target orders for `qty` filled at `avg_entry`.
///
/// Ladder levels below the minimum quantity carry their share into the next
/// level; whatever rounding leaves over after the last level goes to the
/// last placed target.
pub fn resolve_targets(
    take_profit: Option<&TakeProfit>,
    side: Side,
    avg_entry: Decimal,
    stop: Decimal,
    qty: Decimal,
    rules: &InstrumentRules,
) -> TargetPlan {
    let target_price = |p: Decimal| quantize_price(p, rules.tick_size, PriceRole::Target, side);

    match take_profit {
        None => TargetPlan::None,
        Some(TakeProfit::Single(price)) => TargetPlan::Position(TargetOrder {
            index: 1,
            price: target_price(*price),
            qty,
        }),
        Some(TakeProfit::RiskReward(multiple)) => {
            let distance = (avg_entry - stop).abs();
            TargetPlan::Position(TargetOrder {
                index: 1,
                price: target_price(avg_entry + side.sign() * distance * multiple),
                qty,
            })
        }
        Some(TakeProfit::Ladder(levels)) => {
            let mut placed: Vec<TargetOrder> = Vec::new();
            let mut carry = Decimal::ZERO;

            for (i, level) in levels.iter().enumerate() {
                let raw = qty * level.close_pct / Decimal::ONE_HUNDRED + carry;
                let level_qty = quantize_qty(raw, rules.qty_step);
                if level_qty.is_zero() || level_qty < rules.min_qty {
                    carry = raw;
                    continue;
                }
                placed.push(TargetOrder {
                    index: i + 1,
                    price: target_price(level.price),
                    qty: level_qty,
                });
                carry = raw - level_qty;
            }

            let total_pct: Decimal = levels.iter().map(|l| l.close_pct).sum();
            let intended = quantize_qty(qty * total_pct / Decimal::ONE_HUNDRED, rules.qty_step);
            let placed_qty: Decimal = placed.iter().map(|t| t.qty).sum();
            if let Some(last) = placed.last_mut() {
                if intended > placed_qty {
                    last.qty += intended - placed_qty;
                }
            }

            TargetPlan::Orders(placed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetLevel;
    use rust_decimal_macros::dec;

    fn rules(min_qty: Decimal) -> InstrumentRules {
        InstrumentRules {
            symbol: "BTCUSDT".into(),
            qty_step: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty,
            max_qty: dec!(100),
            min_notional: dec!(5),
            max_leverage: dec!(100),
        }
    }

    fn ladder(pcts: &[(Decimal, Decimal)]) -> TakeProfit {
        TakeProfit::Ladder(
            pcts.iter()
                .map(|(price, close_pct)| TargetLevel {
                    price: *price,
                    close_pct: *close_pct,
                })
                .collect(),
        )
    }

    #[test]
    fn test_rr_target_uses_realized_entry() {
        let plan = resolve_targets(
            Some(&TakeProfit::RiskReward(dec!(2))),
            Side::Long,
            dec!(95000),
            dec!(94300),
            dec!(0.014),
            &rules(dec!(0.001)),
        );
        assert_eq!(plan.position_target(), Some(dec!(96400)));

        let short = resolve_targets(
            Some(&TakeProfit::RiskReward(dec!(1.5))),
            Side::Short,
            dec!(100.03),
            dec!(101),
            dec!(1),
            &rules(dec!(0.001)),
        );
        // 100.03 - 0.97 * 1.5 = 98.575, rounded up toward entry
        assert_eq!(short.position_target(), Some(dec!(98.6)));
    }

    #[test]
    fn test_ladder_splits_by_percent() {
        let tp = ladder(&[
            (dec!(96000), dec!(10)),
            (dec!(97000), dec!(30)),
            (dec!(98000), dec!(60)),
        ]);
        let plan = resolve_targets(Some(&tp), Side::Long, dec!(95000), dec!(94300), dec!(0.014), &rules(dec!(0.001)));

        let orders = plan.orders();
        let qtys: Vec<_> = orders.iter().map(|t| t.qty).collect();
        assert_eq!(qtys, vec![dec!(0.001), dec!(0.004), dec!(0.009)]);
        assert_eq!(orders.iter().map(|t| t.qty).sum::<Decimal>(), dec!(0.014));
    }

    #[test]
    fn test_ladder_carries_skipped_levels_forward() {
        let tp = ladder(&[
            (dec!(96000), dec!(10)),
            (dec!(97000), dec!(30)),
            (dec!(98000), dec!(60)),
        ]);
        let plan = resolve_targets(Some(&tp), Side::Long, dec!(95000), dec!(94300), dec!(0.014), &rules(dec!(0.005)));

        let orders = plan.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].index, 2);
        assert_eq!(orders[0].qty, dec!(0.005));
        assert_eq!(orders[1].index, 3);
        assert_eq!(orders[1].qty, dec!(0.009));
    }

    #[test]
    fn test_ladder_leftover_goes_to_last_placed() {
        let tp = ladder(&[(dec!(96000), dec!(90)), (dec!(97000), dec!(10))]);
        let plan = resolve_targets(Some(&tp), Side::Long, dec!(95000), dec!(94300), dec!(0.014), &rules(dec!(0.003)));

        let orders = plan.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].index, 1);
        assert_eq!(orders[0].qty, dec!(0.014));
    }

    #[test]
    fn test_partial_ladder_leaves_runner_open() {
        let tp = ladder(&[(dec!(96000), dec!(50))]);
        let plan = resolve_targets(Some(&tp), Side::Long, dec!(95000), dec!(94300), dec!(0.014), &rules(dec!(0.001)));
        assert_eq!(plan.orders()[0].qty, dec!(0.007));
    }

    #[test]
    fn test_weighted_price() {
        let plan = TargetPlan::Orders(vec![
            TargetOrder {
                index: 1,
                price: dec!(100),
                qty: dec!(1),
            },
            TargetOrder {
                index: 2,
                price: dec!(110),
                qty: dec!(3),
            },
        ]);
        assert_eq!(plan.weighted_price(), Some(dec!(107.5)));
        assert_eq!(TargetPlan::None.weighted_price(), None);
    }
}
