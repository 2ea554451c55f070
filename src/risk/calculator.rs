//! Position sizing, margin and limit validation
//!
//! Pure functions over `Decimal`: no state beyond the configured limits, no I/O.
//! Leverage only ever feeds the margin computation, never the size.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::quantize::{quantize_price, quantize_qty, PriceRole};
use crate::config::RiskConfig;
use crate::domain::{
    EntryPrice, InstrumentRules, LiquidationEstimate, MarginMode, Side, TakeProfit, TradeIntent,
};
use crate::error::{LimitViolation, Result, ValidationError};

/// One order's figures as checked against rules and limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderCheck {
    pub qty: Decimal,
    pub price: Decimal,
    pub stop: Decimal,
    pub leverage: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidationInput {
    pub side: Side,
    pub entry: Decimal,
    pub qty: Decimal,
    pub leverage: Decimal,
    pub mode: MarginMode,
    /// Value from exchange position data, preferred when present
    pub reported: Option<Decimal>,
}

/// Single-order sizing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingRequest {
    pub side: Side,
    pub entry: Decimal,
    pub stop: Decimal,
    pub risk_usd: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub target: Option<Decimal>,
    #[serde(default)]
    pub margin_mode: MarginMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    pub entry: Decimal,
    pub stop: Decimal,
    pub qty_raw: Decimal,
    pub qty: Decimal,
    pub notional: Decimal,
    pub margin: Decimal,
    /// Loss if stopped after quantization; never above the requested risk
    pub actual_risk_usd: Decimal,
    pub stop_distance_pct: Decimal,
    pub rr: Option<Decimal>,
    pub liquidation: LiquidationEstimate,
}

#[derive(Debug, Clone)]
pub struct RiskCalculator {
    config: RiskConfig,
}

impl RiskCalculator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // =========================================================================
    // Sizing
    // =========================================================================

    /// qty_raw = risk_usd / |entry - stop|, before any quantization
    pub fn size(&self, risk_usd: Decimal, entry: Decimal, stop: Decimal) -> Result<Decimal> {
        if entry == stop {
            return Err(ValidationError::InvalidRange { entry, stop }.into());
        }
        if risk_usd <= Decimal::ZERO {
            return Err(ValidationError::InvalidIntent(format!(
                "risk_usd must be positive, got {}",
                risk_usd
            ))
            .into());
        }
        Ok(risk_usd / (entry - stop).abs())
    }

    /// margin = qty * entry / leverage
    pub fn margin(&self, qty: Decimal, entry: Decimal, leverage: Decimal) -> Result<Decimal> {
        if leverage <= Decimal::ZERO {
            return Err(ValidationError::InvalidIntent(format!(
                "leverage must be positive, got {}",
                leverage
            ))
            .into());
        }
        Ok(qty * entry / leverage)
    }

    /// Loss if the stop is hit
    pub fn risk_at_stop(qty: Decimal, entry: Decimal, stop: Decimal) -> Decimal {
        qty * (entry - stop).abs()
    }

    pub fn stop_distance_pct(entry: Decimal, stop: Decimal) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        (entry - stop).abs() / entry * Decimal::ONE_HUNDRED
    }

    /// Reward-to-risk, direction aware: negative when the target sits on the losing side
    pub fn reward_to_risk(side: Side, entry: Decimal, stop: Decimal, target: Decimal) -> Result<Decimal> {
        let risk = side.favorable_move(stop, entry);
        if risk <= Decimal::ZERO {
            return Err(ValidationError::InvalidRange { entry, stop }.into());
        }
        Ok(side.favorable_move(entry, target) / risk)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Leverage cap: the tighter of the account limit and the instrument limit
    pub fn max_leverage(&self, rules: &InstrumentRules) -> Decimal {
        self.config.max_leverage.min(rules.max_leverage)
    }

    /// Every violated rule, in inspection order
    pub fn violations(&self, check: &OrderCheck, rules: &InstrumentRules) -> Vec<LimitViolation> {
        let mut found = Vec::new();
        let notional = check.qty * check.price;

        if check.qty < rules.min_qty {
            found.push(LimitViolation::BelowMinQty {
                qty: check.qty,
                min: rules.min_qty,
            });
        }
        if check.qty > rules.max_qty {
            found.push(LimitViolation::AboveMaxQty {
                qty: check.qty,
                max: rules.max_qty,
            });
        }
        if notional < rules.min_notional {
            found.push(LimitViolation::BelowMinNotional {
                notional,
                min: rules.min_notional,
            });
        }
        found.extend(self.exposure_violations(
            Self::risk_at_stop(check.qty, check.price, check.stop),
            notional,
            check.leverage,
            rules,
        ));
        found
    }

    /// First violation wins; use `violations` for the full set
    pub fn validate(&self, check: &OrderCheck, rules: &InstrumentRules) -> Result<()> {
        match self.violations(check, rules).into_iter().next() {
            Some(violation) => Err(violation.into()),
            None => Ok(()),
        }
    }

    /// Leverage, risk and margin checks on an aggregate (a whole ladder)
    pub fn check_exposure(
        &self,
        risk_usd: Decimal,
        notional: Decimal,
        leverage: Decimal,
        rules: &InstrumentRules,
    ) -> Result<()> {
        match self
            .exposure_violations(risk_usd, notional, leverage, rules)
            .into_iter()
            .next()
        {
            Some(violation) => Err(violation.into()),
            None => Ok(()),
        }
    }

    fn exposure_violations(
        &self,
        risk_usd: Decimal,
        notional: Decimal,
        leverage: Decimal,
        rules: &InstrumentRules,
    ) -> Vec<LimitViolation> {
        let mut found = Vec::new();
        let max_leverage = self.max_leverage(rules);

        if leverage > max_leverage {
            found.push(LimitViolation::LeverageExceeded {
                leverage,
                max: max_leverage,
            });
        }
        if risk_usd > self.config.max_risk_usd {
            found.push(LimitViolation::RiskExceeded {
                risk: risk_usd,
                max: self.config.max_risk_usd,
            });
        }
        if leverage > Decimal::ZERO {
            let margin = notional / leverage;
            if margin > self.config.max_margin_usd {
                found.push(LimitViolation::MarginExceeded {
                    margin,
                    max: self.config.max_margin_usd,
                });
            }
        }
        found
    }

    /// Reject intents that can never produce a sane order
    pub fn validate_intent(&self, intent: &TradeIntent, reference: Option<Decimal>) -> Result<()> {
        let invalid = |msg: String| -> crate::error::RiskonError {
            ValidationError::InvalidIntent(msg).into()
        };

        if intent.entries.is_empty() {
            return Err(invalid("at least one entry level is required".into()));
        }
        if intent.risk_usd <= Decimal::ZERO {
            return Err(invalid(format!("risk_usd must be positive, got {}", intent.risk_usd)));
        }
        if intent.stop <= Decimal::ZERO {
            return Err(invalid(format!("stop must be positive, got {}", intent.stop)));
        }
        if intent.leverage < Decimal::ONE {
            return Err(invalid(format!("leverage must be at least 1, got {}", intent.leverage)));
        }
        if intent.leverage > self.config.max_leverage {
            return Err(LimitViolation::LeverageExceeded {
                leverage: intent.leverage,
                max: self.config.max_leverage,
            }
            .into());
        }
        if intent.risk_usd > self.config.max_risk_usd {
            return Err(LimitViolation::RiskExceeded {
                risk: intent.risk_usd,
                max: self.config.max_risk_usd,
            }
            .into());
        }

        let mut prices = Vec::with_capacity(intent.entries.len());
        for (idx, level) in intent.entries.iter().enumerate() {
            if level.weight <= Decimal::ZERO {
                return Err(invalid(format!("entry {} has non-positive weight", idx)));
            }
            if let EntryPrice::Limit(p) = level.price {
                if p <= Decimal::ZERO {
                    return Err(invalid(format!("entry {} has non-positive price", idx)));
                }
            }
            let price = level.price.resolve(reference).ok_or_else(|| {
                ValidationError::MissingReferencePrice {
                    symbol: intent.symbol.clone(),
                }
            })?;
            if !intent.side.stop_is_beyond(price, intent.stop) {
                return Err(invalid(format!(
                    "stop {} is not beyond entry {} for a {} position",
                    intent.stop, price, intent.side
                )));
            }
            prices.push(price);
        }

        // Noise zone: stops too close to entry get hunted by ordinary volatility
        if let Some(weighted) = intent.weighted_entry(reference) {
            let distance_pct = Self::stop_distance_pct(weighted, intent.stop);
            if distance_pct < self.config.min_stop_distance_pct {
                return Err(ValidationError::StopTooTight {
                    distance_pct: distance_pct.round_dp(4),
                    min_pct: self.config.min_stop_distance_pct,
                }
                .into());
            }
        }

        match &intent.take_profit {
            None => {}
            Some(TakeProfit::RiskReward(multiple)) => {
                if *multiple <= Decimal::ZERO {
                    return Err(invalid(format!("RR multiple must be positive, got {}", multiple)));
                }
            }
            Some(TakeProfit::Single(target)) => {
                self.check_target(intent.side, &prices, *target)?;
            }
            Some(TakeProfit::Ladder(levels)) => {
                if levels.is_empty() {
                    return Err(invalid("take-profit ladder has no levels".into()));
                }
                let mut total_pct = Decimal::ZERO;
                for level in levels {
                    if level.close_pct <= Decimal::ZERO {
                        return Err(invalid(format!(
                            "take-profit at {} has non-positive close_pct",
                            level.price
                        )));
                    }
                    total_pct += level.close_pct;
                    self.check_target(intent.side, &prices, level.price)?;
                }
                if total_pct > Decimal::ONE_HUNDRED {
                    return Err(invalid(format!(
                        "take-profit close_pct sums to {}%, above 100%",
                        total_pct
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_target(&self, side: Side, entries: &[Decimal], target: Decimal) -> Result<()> {
        match entries.iter().find(|e| !side.target_is_beyond(**e, target)) {
            Some(entry) => Err(ValidationError::InvalidIntent(format!(
                "target {} is not beyond entry {} for a {} position",
                target, entry, side
            ))
            .into()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Liquidation
    // =========================================================================

    /// Exchange value when supplied, otherwise a first-order approximation
    pub fn liquidation_estimate(&self, input: &LiquidationInput) -> Result<LiquidationEstimate> {
        if let Some(price) = input.reported.filter(|p| *p > Decimal::ZERO) {
            return Ok(LiquidationEstimate {
                price,
                approximate: false,
            });
        }
        if input.qty <= Decimal::ZERO {
            return Err(ValidationError::InvalidIntent(
                "liquidation estimate needs a positive quantity".into(),
            )
            .into());
        }

        let margin = self.margin(input.qty, input.entry, input.leverage)?;
        let buffer = match input.mode {
            MarginMode::Isolated => margin,
            MarginMode::Cross { collateral } => margin + collateral.max(Decimal::ZERO),
        };
        let price = input.entry - input.side.sign() * buffer / input.qty;

        Ok(LiquidationEstimate {
            price: price.max(Decimal::ZERO),
            approximate: true,
        })
    }

    // =========================================================================
    // Single-order sizing
    // =========================================================================

    pub fn size_position(&self, req: &SizingRequest, rules: &InstrumentRules) -> Result<PositionSizing> {
        let entry = quantize_price(req.entry, rules.tick_size, PriceRole::Entry, req.side);
        let stop = quantize_price(req.stop, rules.tick_size, PriceRole::Stop, req.side);

        if !req.side.stop_is_beyond(entry, stop) {
            if entry == stop {
                return Err(ValidationError::InvalidRange { entry, stop }.into());
            }
            return Err(ValidationError::InvalidIntent(format!(
                "stop {} is not beyond entry {} for a {} position",
                stop, entry, req.side
            ))
            .into());
        }

        let stop_distance_pct = Self::stop_distance_pct(entry, stop);
        if stop_distance_pct < self.config.min_stop_distance_pct {
            return Err(ValidationError::StopTooTight {
                distance_pct: stop_distance_pct.round_dp(4),
                min_pct: self.config.min_stop_distance_pct,
            }
            .into());
        }

        let qty_raw = self.size(req.risk_usd, entry, stop)?;
        let qty = quantize_qty(qty_raw, rules.qty_step);
        let margin = self.margin(qty, entry, req.leverage)?;

        self.validate(
            &OrderCheck {
                qty,
                price: entry,
                stop,
                leverage: req.leverage,
            },
            rules,
        )?;

        let liquidation = self.liquidation_estimate(&LiquidationInput {
            side: req.side,
            entry,
            qty,
            leverage: req.leverage,
            mode: req.margin_mode,
            reported: None,
        })?;

        let rr = req
            .target
            .map(|target| Self::reward_to_risk(req.side, entry, stop, target))
            .transpose()?;

        Ok(PositionSizing {
            entry,
            stop,
            qty_raw,
            qty,
            notional: qty * entry,
            margin,
            actual_risk_usd: Self::risk_at_stop(qty, entry, stop),
            stop_distance_pct,
            rr,
            liquidation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryLevel, TargetLevel};
    use crate::error::RiskonError;
    use rust_decimal_macros::dec;

    fn rules() -> InstrumentRules {
        InstrumentRules {
            symbol: "BTCUSDT".into(),
            qty_step: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.001),
            max_qty: dec!(100),
            min_notional: dec!(5),
            max_leverage: dec!(100),
        }
    }

    fn calc() -> RiskCalculator {
        RiskCalculator::new(RiskConfig::default())
    }

    fn intent() -> TradeIntent {
        TradeIntent {
            owner: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entries: vec![EntryLevel::limit(dec!(95000), Decimal::ONE)],
            stop: dec!(94300),
            risk_usd: dec!(10),
            leverage: dec!(5),
            take_profit: None,
            strategy_class: None,
        }
    }

    #[test]
    fn test_size_is_exact_before_quantization() {
        let qty_raw = calc().size(dec!(10), dec!(95000), dec!(94300)).unwrap();
        assert_eq!(qty_raw, dec!(10) / dec!(700));

        let qty = quantize_qty(qty_raw, dec!(0.001));
        assert_eq!(qty, dec!(0.014));
        assert!(qty * dec!(700) <= dec!(10));
    }

    #[test]
    fn test_size_rejects_zero_range() {
        let err = calc().size(dec!(10), dec!(95000), dec!(95000)).unwrap_err();
        assert!(matches!(
            err,
            RiskonError::Validation(ValidationError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_margin() {
        assert_eq!(calc().margin(dec!(0.014), dec!(95000), dec!(5)).unwrap(), dec!(266));
        assert!(calc().margin(dec!(0.014), dec!(95000), Decimal::ZERO).is_err());
    }

    #[test]
    fn test_size_never_exceeds_budget_after_floor() {
        let calc = calc();
        for (risk, entry, stop) in [
            (dec!(10), dec!(95000), dec!(94300)),
            (dec!(7.5), dec!(2650.37), dec!(2701.2)),
            (dec!(1), dec!(0.5321), dec!(0.5102)),
        ] {
            let qty = quantize_qty(calc.size(risk, entry, stop).unwrap(), dec!(0.001));
            assert!(RiskCalculator::risk_at_stop(qty, entry, stop) <= risk);
        }
    }

    #[test]
    fn test_first_violation_is_reported() {
        let check = OrderCheck {
            qty: dec!(0.0001),
            price: dec!(95000),
            stop: dec!(94300),
            leverage: dec!(50),
        };
        let all = calc().violations(&check, &rules());
        assert!(matches!(all[0], LimitViolation::BelowMinQty { .. }));
        assert!(all
            .iter()
            .any(|v| matches!(v, LimitViolation::LeverageExceeded { .. })));

        let err = calc().validate(&check, &rules()).unwrap_err();
        assert!(matches!(
            err,
            RiskonError::Validation(ValidationError::Limit(LimitViolation::BelowMinQty { .. }))
        ));
    }

    #[test]
    fn test_full_violation_set_in_order() {
        let mut rules = rules();
        rules.max_qty = dec!(1);
        rules.min_notional = dec!(1_000_000);
        let check = OrderCheck {
            qty: dec!(2),
            price: dec!(95000),
            stop: dec!(94000),
            leverage: dec!(20),
        };
        let all = calc().violations(&check, &rules);
        assert_eq!(all.len(), 5);
        assert!(matches!(all[0], LimitViolation::AboveMaxQty { .. }));
        assert!(matches!(all[1], LimitViolation::BelowMinNotional { .. }));
        assert!(matches!(all[2], LimitViolation::LeverageExceeded { .. }));
        assert!(matches!(all[3], LimitViolation::RiskExceeded { .. }));
        assert!(matches!(all[4], LimitViolation::MarginExceeded { .. }));
    }

    #[test]
    fn test_liquidation_prefers_exchange_value() {
        let input = LiquidationInput {
            side: Side::Long,
            entry: dec!(95000),
            qty: dec!(0.014),
            leverage: dec!(5),
            mode: MarginMode::Isolated,
            reported: Some(dec!(76500)),
        };
        let est = calc().liquidation_estimate(&input).unwrap();
        assert_eq!(est.price, dec!(76500));
        assert!(!est.approximate);

        let est = calc()
            .liquidation_estimate(&LiquidationInput {
                reported: None,
                ..input
            })
            .unwrap();
        // 95000 - 266 / 0.014
        assert_eq!(est.price, dec!(76000));
        assert!(est.approximate);
    }

    #[test]
    fn test_cross_liquidation_is_further_away() {
        let input = LiquidationInput {
            side: Side::Short,
            entry: dec!(100),
            qty: dec!(2),
            leverage: dec!(10),
            mode: MarginMode::Cross {
                collateral: dec!(30),
            },
            reported: None,
        };
        // margin 20, (20 + 30) / 2 = 25 above entry
        let est = calc().liquidation_estimate(&input).unwrap();
        assert_eq!(est.price, dec!(125));
        assert!(est.approximate);
    }

    #[test]
    fn test_validate_intent_accepts_sane_intent() {
        assert!(calc().validate_intent(&intent(), None).is_ok());
    }

    #[test]
    fn test_validate_intent_direction_and_noise_zone() {
        let mut bad = intent();
        bad.stop = dec!(95500);
        assert!(matches!(
            calc().validate_intent(&bad, None),
            Err(RiskonError::Validation(ValidationError::InvalidIntent(_)))
        ));

        let mut tight = intent();
        tight.stop = dec!(94950);
        assert!(matches!(
            calc().validate_intent(&tight, None),
            Err(RiskonError::Validation(ValidationError::StopTooTight { .. }))
        ));
    }

    #[test]
    fn test_validate_intent_market_needs_reference() {
        let mut market = intent();
        market.entries = vec![EntryLevel::market(Decimal::ONE)];
        assert!(matches!(
            calc().validate_intent(&market, None),
            Err(RiskonError::Validation(ValidationError::MissingReferencePrice { .. }))
        ));
        assert!(calc().validate_intent(&market, Some(dec!(95000))).is_ok());
    }

    #[test]
    fn test_validate_intent_limits() {
        let mut risky = intent();
        risky.risk_usd = dec!(25);
        assert!(matches!(
            calc().validate_intent(&risky, None),
            Err(RiskonError::Validation(ValidationError::Limit(LimitViolation::RiskExceeded { .. })))
        ));

        let mut levered = intent();
        levered.leverage = dec!(20);
        assert!(matches!(
            calc().validate_intent(&levered, None),
            Err(RiskonError::Validation(ValidationError::Limit(
                LimitViolation::LeverageExceeded { .. }
            )))
        ));
    }

    #[test]
    fn test_validate_intent_take_profit() {
        let mut wrong_side = intent();
        wrong_side.take_profit = Some(TakeProfit::Single(dec!(94000)));
        assert!(calc().validate_intent(&wrong_side, None).is_err());

        let mut over = intent();
        over.take_profit = Some(TakeProfit::Ladder(vec![
            TargetLevel {
                price: dec!(96000),
                close_pct: dec!(60),
            },
            TargetLevel {
                price: dec!(97000),
                close_pct: dec!(50),
            },
        ]));
        assert!(calc().validate_intent(&over, None).is_err());

        let mut rr = intent();
        rr.take_profit = Some(TakeProfit::RiskReward(dec!(2)));
        assert!(calc().validate_intent(&rr, None).is_ok());
    }

    #[test]
    fn test_size_position_summary() {
        let req = SizingRequest {
            side: Side::Long,
            entry: dec!(95000),
            stop: dec!(94300),
            risk_usd: dec!(10),
            leverage: dec!(5),
            target: Some(dec!(96400)),
            margin_mode: MarginMode::Isolated,
        };
        let calc = RiskCalculator::new(RiskConfig {
            max_margin_usd: dec!(500),
            ..RiskConfig::default()
        });
        let sizing = calc.size_position(&req, &rules()).unwrap();

        assert_eq!(sizing.qty, dec!(0.014));
        assert_eq!(sizing.margin, dec!(266));
        assert_eq!(sizing.actual_risk_usd, dec!(9.8));
        assert_eq!(sizing.rr, Some(dec!(2)));
        assert!(sizing.actual_risk_usd <= req.risk_usd);
        assert!(sizing.liquidation.approximate);

        // 266 margin breaches the default 150 limit
        assert!(matches!(
            RiskCalculator::new(RiskConfig::default()).size_position(&req, &rules()),
            Err(RiskonError::Validation(ValidationError::Limit(
                LimitViolation::MarginExceeded { .. }
            )))
        ));
    }

    #[test]
    fn test_reward_to_risk_is_direction_aware() {
        let rr = RiskCalculator::reward_to_risk(Side::Short, dec!(100), dec!(105), dec!(90)).unwrap();
        assert_eq!(rr, dec!(2));
        let rr = RiskCalculator::reward_to_risk(Side::Short, dec!(100), dec!(105), dec!(102)).unwrap();
        assert!(rr < Decimal::ZERO);
    }
}
