//! Risk-on-Plan ladder allocation with auto-downgrade
//!
//! 1. P_avg = sum(weight_i * price_i)
//! 2. Q_total = risk_usd / |P_avg - stop|
//! 3. Q_i = floor(Q_total * weight_i, qty_step)
//! 4. While some Q_i breaks min qty / min notional: drop the worst-filling
//!    infeasible level, renormalize, start over.
//!
//! Since every level sits on the same side of the stop and each Q_i is
//! floored, sum(Q_i * |price_i - stop|) <= Q_total * |P_avg - stop| = risk_usd
//! for any subset of levels that fills.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::domain::{
    EntryActivation, EntryPrice, InstrumentRules, OrderType, Side, StrategyClass, TakeProfit,
    TradeIntent,
};
use crate::error::{LimitViolation, Result, ValidationError};
use crate::risk::{quantize, quantize_price, quantize_qty, PriceRole, RiskCalculator, RoundingMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOrder {
    /// Index of the originating entry level in the intent
    pub level: usize,
    pub order_type: OrderType,
    /// Limit price, or the reference price used for risk on market levels
    pub price: Decimal,
    pub qty: Decimal,
    pub weight: Decimal,
    /// Placement threshold for touch-activated levels
    pub activation_price: Option<Decimal>,
}

/// A level removed by auto-downgrade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downgrade {
    pub level: usize,
    pub price: Decimal,
    pub weight: Decimal,
    pub qty: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: Decimal,
    /// Tick-quantized stop
    pub stop: Decimal,
    pub orders: Vec<PlannedOrder>,
    /// Weighted-average entry, P_avg
    pub avg_entry: Decimal,
    pub total_qty: Decimal,
    /// Loss if every level fills and the stop is hit
    pub total_risk: Decimal,
    pub risk_budget: Decimal,
    pub margin: Decimal,
    pub take_profit: Option<TakeProfit>,
    pub strategy_class: Option<StrategyClass>,
    pub rules: InstrumentRules,
    pub downgrades: Vec<Downgrade>,
}

impl Ladder {
    pub fn weight_sum(&self) -> Decimal {
        self.orders.iter().map(|o| o.weight).sum()
    }

    pub fn has_market_orders(&self) -> bool {
        self.orders.iter().any(|o| o.order_type == OrderType::Market)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    level: usize,
    order_type: OrderType,
    price: Decimal,
    weight: Decimal,
    activation_price: Option<Decimal>,
}

struct Allocation {
    orders: Vec<PlannedOrder>,
    avg_entry: Decimal,
    downgrades: Vec<Downgrade>,
}

#[derive(Debug, Clone)]
pub struct LadderPlanner {
    calculator: RiskCalculator,
    config: PlannerConfig,
}

impl LadderPlanner {
    pub fn new(calculator: RiskCalculator, config: PlannerConfig) -> Self {
        Self { calculator, config }
    }

    pub fn calculator(&self) -> &RiskCalculator {
        &self.calculator
    }

    /// Resolve an intent into a concrete ladder
    pub fn plan(
        &self,
        intent: &TradeIntent,
        rules: &InstrumentRules,
        reference_price: Option<Decimal>,
    ) -> Result<Ladder> {
        self.calculator.validate_intent(intent, reference_price)?;

        let weight_sum = intent.weight_sum();
        if (weight_sum - Decimal::ONE).abs() > self.config.weight_epsilon {
            return Err(ValidationError::InvalidIntent(format!(
                "entry weights sum to {}, expected 1 +/- {}",
                weight_sum, self.config.weight_epsilon
            ))
            .into());
        }

        let side = intent.side;
        let stop = quantize_price(intent.stop, rules.tick_size, PriceRole::Stop, side);

        let mut candidates = Vec::with_capacity(intent.entries.len());
        for (level, entry) in intent.entries.iter().enumerate() {
            let (order_type, raw_price) = match entry.price {
                EntryPrice::Limit(p) => (OrderType::Limit, p),
                EntryPrice::Market => (
                    OrderType::Market,
                    reference_price.ok_or_else(|| ValidationError::MissingReferencePrice {
                        symbol: intent.symbol.clone(),
                    })?,
                ),
            };
            let price = quantize_price(raw_price, rules.tick_size, PriceRole::Entry, side);
            let activation_price = match (entry.activation, order_type) {
                (EntryActivation::Touch, OrderType::Limit) => {
                    Some(self.activation_price(side, price, reference_price, rules))
                }
                _ => None,
            };
            candidates.push(Candidate {
                level,
                order_type,
                price,
                weight: entry.weight,
                activation_price,
            });
        }

        let allocation = self.allocate(side, stop, intent.risk_usd, candidates, rules)?;
        let ladder = self.finish(
            Uuid::new_v4(),
            intent.owner.clone(),
            intent.symbol.clone(),
            side,
            intent.leverage,
            stop,
            intent.risk_usd,
            intent.take_profit.clone(),
            intent.strategy_class.clone(),
            rules,
            allocation,
        )?;

        info!(
            trade_id = %ladder.trade_id,
            owner = %ladder.owner,
            symbol = %ladder.symbol,
            "Planned {} level ladder: qty {} @ avg {} (risk {} of {}, {} downgraded)",
            ladder.orders.len(),
            ladder.total_qty,
            ladder.avg_entry,
            ladder.total_risk,
            ladder.risk_budget,
            ladder.downgrades.len()
        );

        Ok(ladder)
    }

    /// Re-run allocation over an existing ladder's levels.
    /// A feasible ladder comes back unchanged.
    pub fn rebalance(&self, ladder: &Ladder) -> Result<Ladder> {
        let candidates = ladder
            .orders
            .iter()
            .map(|o| Candidate {
                level: o.level,
                order_type: o.order_type,
                price: o.price,
                weight: o.weight,
                activation_price: o.activation_price,
            })
            .collect();

        let mut allocation = self.allocate(
            ladder.side,
            ladder.stop,
            ladder.risk_budget,
            candidates,
            &ladder.rules,
        )?;
        let mut downgrades = ladder.downgrades.clone();
        downgrades.append(&mut allocation.downgrades);
        allocation.downgrades = downgrades;

        self.finish(
            ladder.trade_id,
            ladder.owner.clone(),
            ladder.symbol.clone(),
            ladder.side,
            ladder.leverage,
            ladder.stop,
            ladder.risk_budget,
            ladder.take_profit.clone(),
            ladder.strategy_class.clone(),
            &ladder.rules,
            allocation,
        )
    }

    fn allocate(
        &self,
        side: Side,
        stop: Decimal,
        risk_usd: Decimal,
        mut survivors: Vec<Candidate>,
        rules: &InstrumentRules,
    ) -> Result<Allocation> {
        let mut downgrades = Vec::new();

        loop {
            if survivors.is_empty() {
                return Err(ValidationError::InfeasiblePlan(format!(
                    "no entry level reaches min qty {} / min notional {} within ${} risk",
                    rules.min_qty, rules.min_notional, risk_usd
                ))
                .into());
            }

            normalize_weights(&mut survivors);

            let avg_entry: Decimal = survivors.iter().map(|c| c.weight * c.price).sum();
            let q_total = self.calculator.size(risk_usd, avg_entry, stop)?;
            let qtys: Vec<Decimal> = survivors
                .iter()
                .map(|c| quantize_qty(q_total * c.weight, rules.qty_step))
                .collect();

            let infeasible: Vec<usize> = (0..survivors.len())
                .filter(|&i| infeasible_reason(qtys[i], survivors[i].price, rules).is_some())
                .collect();

            if infeasible.is_empty() {
                let orders = survivors
                    .into_iter()
                    .zip(qtys)
                    .map(|(c, qty)| PlannedOrder {
                        level: c.level,
                        order_type: c.order_type,
                        price: c.price,
                        qty,
                        weight: c.weight,
                        activation_price: c.activation_price,
                    })
                    .collect();
                return Ok(Allocation {
                    orders,
                    avg_entry,
                    downgrades,
                });
            }

            // Worst expected fill first: furthest from market in the entry
            // direction, then the smaller weight, then the later level.
            let drop_idx = infeasible
                .iter()
                .copied()
                .min_by_key(|&i| {
                    let c = &survivors[i];
                    (side.sign() * c.price, c.weight, Reverse(c.level))
                })
                .unwrap_or(infeasible[0]);

            let dropped = survivors.remove(drop_idx);
            let reason = infeasible_reason(qtys[drop_idx], dropped.price, rules).unwrap_or_default();
            debug!(
                level = dropped.level,
                price = %dropped.price,
                "Auto-downgrade: dropping level ({})",
                reason
            );
            downgrades.push(Downgrade {
                level: dropped.level,
                price: dropped.price,
                weight: dropped.weight,
                qty: qtys[drop_idx],
                reason,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        trade_id: Uuid,
        owner: String,
        symbol: String,
        side: Side,
        leverage: Decimal,
        stop: Decimal,
        risk_budget: Decimal,
        take_profit: Option<TakeProfit>,
        strategy_class: Option<StrategyClass>,
        rules: &InstrumentRules,
        allocation: Allocation,
    ) -> Result<Ladder> {
        for order in &allocation.orders {
            if order.qty > rules.max_qty {
                return Err(LimitViolation::AboveMaxQty {
                    qty: order.qty,
                    max: rules.max_qty,
                }
                .into());
            }
        }

        let total_qty: Decimal = allocation.orders.iter().map(|o| o.qty).sum();
        let total_risk: Decimal = allocation
            .orders
            .iter()
            .map(|o| RiskCalculator::risk_at_stop(o.qty, o.price, stop))
            .sum();
        let notional: Decimal = allocation.orders.iter().map(|o| o.qty * o.price).sum();

        if total_risk > risk_budget {
            return Err(ValidationError::InfeasiblePlan(format!(
                "quantized risk {} exceeds budget {}",
                total_risk, risk_budget
            ))
            .into());
        }
        self.calculator
            .check_exposure(total_risk, notional, leverage, rules)?;

        Ok(Ladder {
            trade_id,
            owner,
            symbol,
            side,
            leverage,
            stop,
            orders: allocation.orders,
            avg_entry: allocation.avg_entry,
            total_qty,
            total_risk,
            risk_budget,
            margin: self.calculator.margin(Decimal::ONE, notional, leverage)?,
            take_profit,
            strategy_class,
            rules: rules.clone(),
            downgrades: allocation.downgrades,
        })
    }

    /// Placement threshold sitting between the current price and the level,
    /// one buffer away from the level, so the order rests before price arrives.
    fn activation_price(
        &self,
        side: Side,
        price: Decimal,
        reference: Option<Decimal>,
        rules: &InstrumentRules,
    ) -> Decimal {
        let approaching_from_above = match reference {
            Some(r) if r != price => r > price,
            _ => side == Side::Long,
        };
        let buffer = self.config.activation_buffer_pct;
        let raw = if approaching_from_above {
            price * (Decimal::ONE + buffer)
        } else {
            price * (Decimal::ONE - buffer)
        };
        quantize(raw, rules.tick_size, RoundingMode::Nearest)
    }
}

/// Rescale weights to sum to exactly one; the last level absorbs the remainder
fn normalize_weights(levels: &mut [Candidate]) {
    let total: Decimal = levels.iter().map(|c| c.weight).sum();
    if total == Decimal::ONE || total <= Decimal::ZERO || levels.is_empty() {
        return;
    }
    let last = levels.len() - 1;
    let mut acc = Decimal::ZERO;
    for c in &mut levels[..last] {
        c.weight /= total;
        acc += c.weight;
    }
    levels[last].weight = Decimal::ONE - acc;
}

fn infeasible_reason(qty: Decimal, price: Decimal, rules: &InstrumentRules) -> Option<String> {
    if qty.is_zero() || qty < rules.min_qty {
        return Some(format!("qty {} below min {}", qty, rules.min_qty));
    }
    if qty * price < rules.min_notional {
        return Some(format!(
            "notional {} below min {}",
            qty * price,
            rules.min_notional
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::domain::EntryLevel;
    use crate::error::RiskonError;
    use rust_decimal_macros::dec;

    fn rules(step: Decimal) -> InstrumentRules {
        InstrumentRules {
            symbol: "BTCUSDT".into(),
            qty_step: step,
            tick_size: dec!(0.1),
            min_qty: step,
            max_qty: dec!(100),
            min_notional: dec!(5),
            max_leverage: dec!(100),
        }
    }

    fn planner() -> LadderPlanner {
        let risk = RiskConfig {
            max_margin_usd: dec!(1000),
            ..RiskConfig::default()
        };
        LadderPlanner::new(RiskCalculator::new(risk), PlannerConfig::default())
    }

    fn intent(entries: Vec<EntryLevel>) -> TradeIntent {
        TradeIntent {
            owner: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entries,
            stop: dec!(94300),
            risk_usd: dec!(10),
            leverage: dec!(5),
            take_profit: None,
            strategy_class: None,
        }
    }

    fn two_level() -> TradeIntent {
        intent(vec![
            EntryLevel::limit(dec!(95000), dec!(0.6)),
            EntryLevel::limit(dec!(94800), dec!(0.4)),
        ])
    }

    #[test]
    fn test_single_level() {
        let ladder = planner()
            .plan(&intent(vec![EntryLevel::limit(dec!(95000), Decimal::ONE)]), &rules(dec!(0.001)), None)
            .unwrap();

        assert_eq!(ladder.orders.len(), 1);
        assert_eq!(ladder.total_qty, dec!(0.014));
        assert_eq!(ladder.total_risk, dec!(9.8));
        assert_eq!(ladder.margin, dec!(266));
    }

    #[test]
    fn test_two_level_allocation() {
        let ladder = planner().plan(&two_level(), &rules(dec!(0.001)), None).unwrap();

        assert_eq!(ladder.avg_entry, dec!(94920));
        assert_eq!(ladder.orders[0].qty, dec!(0.009));
        assert_eq!(ladder.orders[1].qty, dec!(0.006));
        assert_eq!(ladder.weight_sum(), Decimal::ONE);
        assert!(ladder.downgrades.is_empty());
        // 0.009 * 700 + 0.006 * 500
        assert_eq!(ladder.total_risk, dec!(9.3));
        assert!(ladder.total_risk <= ladder.risk_budget);
    }

    #[test]
    fn test_coarse_step_drops_worst_level() {
        let ladder = planner().plan(&two_level(), &rules(dec!(0.01)), None).unwrap();

        assert_eq!(ladder.orders.len(), 1);
        assert_eq!(ladder.orders[0].level, 0);
        assert_eq!(ladder.orders[0].price, dec!(95000));
        assert_eq!(ladder.orders[0].weight, Decimal::ONE);
        assert_eq!(ladder.orders[0].qty, dec!(0.01));
        assert_eq!(ladder.downgrades.len(), 1);
        assert_eq!(ladder.downgrades[0].level, 1);
        assert!(ladder.total_risk <= dec!(10));
    }

    #[test]
    fn test_short_drops_highest_level() {
        let mut short = intent(vec![
            EntryLevel::limit(dec!(95000), dec!(0.6)),
            EntryLevel::limit(dec!(95200), dec!(0.4)),
        ]);
        short.side = Side::Short;
        short.stop = dec!(95700);

        let ladder = planner().plan(&short, &rules(dec!(0.01)), None).unwrap();
        assert_eq!(ladder.orders.len(), 1);
        assert_eq!(ladder.orders[0].price, dec!(95000));
        assert_eq!(ladder.downgrades[0].price, dec!(95200));
    }

    #[test]
    fn test_infeasible_when_nothing_survives() {
        let err = planner()
            .plan(&two_level(), &rules(dec!(0.1)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            RiskonError::Validation(ValidationError::InfeasiblePlan(_))
        ));
    }

    #[test]
    fn test_min_notional_triggers_downgrade() {
        let mut r = rules(dec!(0.001));
        r.min_notional = dec!(600);
        // Level qtys 0.009 (855 notional) and 0.006 (568.8 notional)
        let ladder = planner().plan(&two_level(), &r, None).unwrap();
        assert_eq!(ladder.orders.len(), 1);
        assert_eq!(ladder.orders[0].qty, dec!(0.014));
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let planner = planner();
        let three = intent(vec![
            EntryLevel::limit(dec!(95000), dec!(0.34)),
            EntryLevel::limit(dec!(94900), dec!(0.33)),
            EntryLevel::limit(dec!(94800), dec!(0.33)),
        ]);
        for step in [dec!(0.001), dec!(0.01)] {
            let ladder = planner.plan(&three, &rules(step), None).unwrap();
            assert_eq!(planner.rebalance(&ladder).unwrap(), ladder);
        }
    }

    #[test]
    fn test_weights_normalized_after_downgrade() {
        let planner = planner();
        let three = intent(vec![
            EntryLevel::limit(dec!(95000), dec!(0.3)),
            EntryLevel::limit(dec!(94900), dec!(0.3)),
            EntryLevel::limit(dec!(94800), dec!(0.4)),
        ]);
        let mut r = rules(dec!(0.001));
        r.min_qty = dec!(0.006);
        let ladder = planner.plan(&three, &r, None).unwrap();
        assert_eq!(ladder.downgrades[0].level, 1);
        assert!(!ladder.downgrades.is_empty());
        assert_eq!(ladder.weight_sum(), Decimal::ONE);
        assert!(ladder.total_risk <= dec!(10));
    }

    #[test]
    fn test_weight_sum_out_of_tolerance() {
        let bad = intent(vec![
            EntryLevel::limit(dec!(95000), dec!(0.6)),
            EntryLevel::limit(dec!(94800), dec!(0.3)),
        ]);
        assert!(matches!(
            planner().plan(&bad, &rules(dec!(0.001)), None),
            Err(RiskonError::Validation(ValidationError::InvalidIntent(_)))
        ));
    }

    #[test]
    fn test_market_level_uses_reference_price() {
        let market = intent(vec![EntryLevel::market(Decimal::ONE)]);
        let ladder = planner()
            .plan(&market, &rules(dec!(0.001)), Some(dec!(95000)))
            .unwrap();
        assert_eq!(ladder.orders[0].order_type, OrderType::Market);
        assert_eq!(ladder.orders[0].price, dec!(95000));
        assert!(ladder.has_market_orders());
    }

    #[test]
    fn test_touch_activation_buffer() {
        let touch = intent(vec![EntryLevel::limit(dec!(95000), Decimal::ONE).touch()]);
        let ladder = planner()
            .plan(&touch, &rules(dec!(0.001)), Some(dec!(96000)))
            .unwrap();
        // Price approaches from above: threshold 0.5% above the level
        assert_eq!(ladder.orders[0].activation_price, Some(dec!(95475)));
        // Risk still computed on the stored level price
        assert_eq!(ladder.orders[0].price, dec!(95000));
        assert_eq!(ladder.total_qty, dec!(0.014));
    }

    #[test]
    fn test_aggregate_margin_limit() {
        let strict = LadderPlanner::new(
            RiskCalculator::new(RiskConfig::default()),
            PlannerConfig::default(),
        );
        assert!(matches!(
            strict.plan(&two_level(), &rules(dec!(0.001)), None),
            Err(RiskonError::Validation(ValidationError::Limit(
                LimitViolation::MarginExceeded { .. }
            )))
        ));
    }
}
