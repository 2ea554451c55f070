//! Per-owner locked execution of a planned ladder
//!
//! Validated -> LockAcquired -> Submitting -> AwaitingFill -> Protecting -> Completed,
//! with RolledBack / Failed exits once anything is live on the exchange.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gateway::{FillWait, OrderGateway};
use super::idempotency::order_key;
use super::protection::{self, ProtectionRequest};
use super::result::{ExecutionResult, OrderOutcome, OrderTerminal, ProtectionStatus, RollbackOutcome};
use super::state::{ExecutionPhase, ExecutionState};
use crate::config::ExecutionConfig;
use crate::coordination::{lock_key, LockGuard, LockStore};
use crate::domain::{
    InstrumentRules, OrderRole, OrderSpec, OrderType, Side, StrategyClass, TakeProfit,
};
use crate::error::{RejectReason, Result, RiskonError, ValidationError};
use crate::exchange::ExchangeClient;
use crate::planner::{Ladder, PlannedOrder, TargetOrder};
use crate::risk::RiskCalculator;

/// Everything the lifecycle monitor needs to supervise a new position
#[derive(Debug, Clone)]
pub struct PositionHandoff {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: Decimal,
    pub stop: Decimal,
    /// Realized entry; `None` while every entry is still resting
    pub avg_entry: Option<Decimal>,
    pub filled_qty: Decimal,
    pub planned_qty: Decimal,
    pub planned_avg_entry: Decimal,
    pub take_profit: Option<TakeProfit>,
    pub strategy_class: Option<StrategyClass>,
    pub rules: InstrumentRules,
    pub protection: ProtectionStatus,
    /// Live ladder target orders
    pub targets: Vec<(TargetOrder, String)>,
    pub resting_entries: Vec<String>,
}

/// Working state of one locked run
struct Run {
    ladder: Ladder,
    owner: String,
    state: ExecutionState,
    orders: Vec<OrderOutcome>,
    protection: ProtectionStatus,
    targets: Vec<TargetOrder>,
    rollback: Option<RollbackOutcome>,
    started_at: DateTime<Utc>,
}

impl Run {
    fn new(ladder: Ladder, owner: String, state: ExecutionState) -> Self {
        Self {
            ladder,
            owner,
            state,
            orders: Vec::new(),
            protection: ProtectionStatus::NotAttempted,
            targets: Vec::new(),
            rollback: None,
            started_at: Utc::now(),
        }
    }

    /// Filled entry quantity and its average price
    fn filled(&self) -> (Decimal, Option<Decimal>) {
        let mut qty = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for order in self.orders.iter().filter(|o| o.role.is_entry()) {
            if let Some(avg) = order.avg_price {
                qty += order.filled_qty;
                notional += order.filled_qty * avg;
            }
        }
        if qty.is_zero() {
            (qty, None)
        } else {
            (qty, Some(notional / qty))
        }
    }

    fn has_live_orders(&self) -> bool {
        self.orders.iter().any(|o| o.is_live() || o.status == OrderTerminal::Filled)
    }

    fn report(&self) -> ExecutionResult {
        let (filled_qty, avg_price) = self.filled();
        let stop = self.ladder.stop;
        let actual_risk_usd = avg_price
            .map(|avg| RiskCalculator::risk_at_stop(filled_qty, avg, stop))
            .unwrap_or_default();

        let target_price = self
            .targets
            .iter()
            .filter(|t| !t.qty.is_zero())
            .map(|t| (t.price * t.qty, t.qty))
            .fold((Decimal::ZERO, Decimal::ZERO), |acc, (n, q)| (acc.0 + n, acc.1 + q));
        let actual_rr = match (avg_price, target_price) {
            (Some(avg), (notional, qty)) if !qty.is_zero() => {
                RiskCalculator::reward_to_risk(self.ladder.side, avg, stop, notional / qty).ok()
            }
            _ => None,
        };

        let mut order_ids: Vec<String> = self.orders.iter().filter_map(|o| o.order_id.clone()).collect();
        if let Some(close_id) = self.rollback.as_ref().and_then(|r| r.close_order_id.clone()) {
            order_ids.push(close_id);
        }

        ExecutionResult {
            trade_id: self.ladder.trade_id,
            owner: self.owner.clone(),
            symbol: self.ladder.symbol.clone(),
            side: self.ladder.side,
            status: self.state.phase(),
            filled_qty,
            avg_price,
            actual_risk_usd,
            actual_rr,
            order_ids,
            orders: self.orders.clone(),
            protection_status: self.protection,
            stop_price: stop,
            targets: self.targets.clone(),
            rollback: self.rollback.clone(),
            transitions: self.state.transitions().to_vec(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn entry_spec(ladder: &Ladder, owner: &str, planned: &PlannedOrder) -> OrderSpec {
    let role = OrderRole::Entry {
        level: planned.level,
    };
    OrderSpec {
        owner: owner.to_string(),
        symbol: ladder.symbol.clone(),
        side: ladder.side.entry_order_side(),
        order_type: planned.order_type,
        qty: planned.qty,
        price: match planned.order_type {
            OrderType::Limit => Some(planned.price),
            OrderType::Market => None,
        },
        trigger_price: planned.activation_price,
        key: order_key(ladder.trade_id, role),
        role,
        reduce_only: false,
    }
}

/// Executes ladders under the per-owner lock
#[derive(Clone)]
pub struct ExecutionCoordinator {
    gateway: Arc<OrderGateway>,
    locks: Arc<dyn LockStore>,
    config: ExecutionConfig,
    handoff: Option<mpsc::UnboundedSender<PositionHandoff>>,
}

impl ExecutionCoordinator {
    pub fn new(exchange: Arc<dyn ExchangeClient>, locks: Arc<dyn LockStore>, config: ExecutionConfig) -> Self {
        Self {
            gateway: Arc::new(OrderGateway::new(exchange, config.clone())),
            locks,
            config,
            handoff: None,
        }
    }

    /// Send every completed execution's position to this channel
    pub fn with_handoff(mut self, handoff: mpsc::UnboundedSender<PositionHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn gateway(&self) -> &Arc<OrderGateway> {
        &self.gateway
    }

    pub async fn execute(&self, ladder: &Ladder, owner: &str) -> Result<ExecutionResult> {
        let (_never, cancel) = watch::channel(false);
        self.execute_cancellable(ladder, owner, cancel).await
    }

    /// Like [`execute`](Self::execute), honouring `cancel` until the first
    /// order is submitted. After that the run always reaches a terminal phase.
    pub async fn execute_cancellable(
        &self,
        ladder: &Ladder,
        owner: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionResult> {
        if ladder.owner != owner {
            return Err(ValidationError::InvalidIntent(format!(
                "ladder {} was planned for {}, not {}",
                ladder.trade_id, ladder.owner, owner
            ))
            .into());
        }
        if ladder.orders.is_empty() {
            return Err(ValidationError::InfeasiblePlan("ladder has no orders".into()).into());
        }
        if *cancel.borrow() {
            info!(trade_id = %ladder.trade_id, owner, "Cancelled before lock acquisition");
            return Err(RiskonError::Cancelled);
        }

        let mut state = ExecutionState::new(ladder.trade_id, owner, &ladder.symbol);
        let market_levels = ladder
            .orders
            .iter()
            .filter(|o| o.order_type == OrderType::Market)
            .count();
        let lease = self.config.lock_lease(market_levels);
        let guard = LockGuard::acquire(self.locks.clone(), lock_key(owner), lease, self.config.lock_wait()).await?;
        let Some(guard) = guard else {
            info!(trade_id = %ladder.trade_id, owner, "Execution already in progress");
            return Err(RiskonError::LockContention {
                owner: owner.to_string(),
            });
        };
        state.advance(
            ExecutionPhase::LockAcquired,
            format!("holding {} for {:?}", guard.key(), lease),
        )?;

        if *cancel.borrow() {
            state.advance(ExecutionPhase::Failed, "cancelled before submission")?;
            guard.release().await?;
            info!(trade_id = %ladder.trade_id, owner, "Cancelled after lock, nothing submitted");
            return Err(RiskonError::Cancelled);
        }

        // Once orders may go out, the run must finish even if the caller goes away
        let this = self.clone();
        let ladder = ladder.clone();
        let owner = owner.to_string();
        let task = tokio::spawn(async move {
            let trade_id = ladder.trade_id;
            let outcome = this.run_locked(ladder, owner, state).await;
            if let Err(e) = guard.release().await {
                warn!(trade_id = %trade_id, "Lock release failed: {}", e);
            }
            outcome
        });

        task.await
            .map_err(|e| RiskonError::Internal(format!("execution task ended abnormally: {}", e)))?
    }

    async fn run_locked(&self, ladder: Ladder, owner: String, state: ExecutionState) -> Result<ExecutionResult> {
        let mut run = Run::new(ladder, owner, state);
        info!(
            trade_id = %run.ladder.trade_id,
            owner = %run.owner,
            symbol = %run.ladder.symbol,
            "Executing {} {} x{} (risk {} of {})",
            run.ladder.side,
            run.ladder.total_qty,
            run.ladder.orders.len(),
            run.ladder.total_risk,
            run.ladder.risk_budget
        );

        // Submitting
        run.state.advance(
            ExecutionPhase::Submitting,
            format!("{} entry order(s)", run.ladder.orders.len()),
        )?;
        let planned_orders = run.ladder.orders.clone();
        for planned in &planned_orders {
            let spec = entry_spec(&run.ladder, &run.owner, planned);
            match self.gateway.submit(&spec).await {
                Ok(order_id) => {
                    run.state.attempted.push(order_id.clone());
                    run.orders
                        .push(OrderOutcome::new(&spec, Some(order_id), OrderTerminal::Resting, None));
                }
                Err(e) => {
                    run.orders
                        .push(OrderOutcome::new(&spec, None, OrderTerminal::Failed, Some(e.to_string())));
                    return self.abort(run, e).await;
                }
            }
        }

        // AwaitingFill
        run.state.advance(ExecutionPhase::AwaitingFill, "entries accepted")?;
        for i in 0..run.orders.len() {
            let Some(order_id) = run.orders[i].order_id.clone() else {
                continue;
            };
            if run.orders[i].order_type != OrderType::Market {
                // Limits rest; just pick up an immediate fill if there was one
                if let Ok(snapshot) = self.gateway.snapshot(&order_id).await {
                    run.orders[i].absorb(&snapshot);
                }
                continue;
            }

            match self.gateway.await_fill(&order_id).await {
                FillWait::Filled(snapshot) => run.orders[i].absorb(&snapshot),
                FillWait::Terminated(snapshot) => {
                    run.orders[i].absorb(&snapshot);
                    let cause = RiskonError::rejected(
                        RejectReason::Rejected,
                        format!("order {} ended {:?} before filling", order_id, snapshot.status),
                    );
                    return self.abort(run, cause).await;
                }
                FillWait::TimedOut { snapshot, elapsed_ms } => {
                    if let Some(snapshot) = snapshot {
                        run.orders[i].absorb(&snapshot);
                    }
                    if run.orders[i].status == OrderTerminal::Resting {
                        run.orders[i].status = OrderTerminal::Cancelled;
                    }
                    let rollback = self.unwind(&mut run).await;
                    self.finish_failed(&mut run, rollback, "fill timeout")?;
                    return Err(RiskonError::FillTimeout {
                        order_id,
                        elapsed_ms,
                        report: Box::new(run.report()),
                    });
                }
            }
        }

        // Protecting
        let (filled_qty, avg_entry) = run.filled();
        run.state.advance(ExecutionPhase::Protecting, format!("filled {}", filled_qty))?;
        let mut live_targets = Vec::new();

        match avg_entry {
            None => {
                run.protection = ProtectionStatus::Deferred;
                info!(trade_id = %run.ladder.trade_id, "No entry filled yet, protection deferred to monitor");
            }
            Some(avg) => {
                let request = ProtectionRequest {
                    trade_id: run.ladder.trade_id,
                    owner: &run.owner,
                    symbol: &run.ladder.symbol,
                    side: run.ladder.side,
                    stop: run.ladder.stop,
                    avg_entry: avg,
                    qty: filled_qty,
                    take_profit: run.ladder.take_profit.as_ref(),
                    rules: &run.ladder.rules,
                    revision: 0,
                };
                let report = protection::attach(&self.gateway, &request).await;
                live_targets = report.target_orders();
                run.protection = report.status;
                run.targets = report.targets;
                run.orders.extend(report.outcomes);

                if let Some(reason) = report.stop_error {
                    error!(
                        trade_id = %run.ladder.trade_id,
                        owner = %run.owner,
                        "Stop-loss could not be attached to {} filled, rolling back",
                        filled_qty
                    );
                    let rollback = self.unwind(&mut run).await;
                    self.finish_failed(&mut run, rollback.clone(), "protection failed")?;
                    return Err(RiskonError::ProtectionFailed {
                        reason,
                        rollback,
                        report: Box::new(run.report()),
                    });
                }
            }
        }

        run.state.advance(ExecutionPhase::Completed, format!("protection {:?}", run.protection))?;
        let result = run.report();
        info!(
            trade_id = %result.trade_id,
            owner = %result.owner,
            "Execution complete: filled {} @ {:?}, risk {}, rr {:?}",
            result.filled_qty,
            result.avg_price,
            result.actual_risk_usd,
            result.actual_rr
        );
        self.hand_off(&run, &result, live_targets);
        Ok(result)
    }

    /// Failure during submission: unwind whatever is live, or surface the
    /// cause untouched when nothing reached the exchange.
    async fn abort(&self, mut run: Run, cause: RiskonError) -> Result<ExecutionResult> {
        if !run.has_live_orders() {
            run.state.advance(ExecutionPhase::Failed, cause.to_string())?;
            warn!(trade_id = %run.ladder.trade_id, "Execution failed before any order was live: {}", cause);
            return Err(cause);
        }

        warn!(trade_id = %run.ladder.trade_id, "Execution failed with live orders, unwinding: {}", cause);
        let rollback = self.unwind(&mut run).await;
        self.finish_failed(&mut run, rollback, "unwound after failure")?;
        Err(RiskonError::ExecutionFailed {
            reason: cause.to_string(),
            report: Box::new(run.report()),
        })
    }

    fn finish_failed(&self, run: &mut Run, rollback: RollbackOutcome, reason: &str) -> Result<()> {
        let phase = if rollback.is_clean() {
            ExecutionPhase::RolledBack
        } else {
            ExecutionPhase::Failed
        };
        run.state.advance(phase, format!("{}: {}", reason, rollback))?;
        run.rollback = Some(rollback);
        Ok(())
    }

    /// Cancel everything resting, then market-close the filled quantity
    async fn unwind(&self, run: &mut Run) -> RollbackOutcome {
        let mut rollback = RollbackOutcome::default();
        let mut errors = Vec::new();

        for outcome in run.orders.iter_mut().filter(|o| o.is_live()) {
            let Some(order_id) = outcome.order_id.clone() else {
                continue;
            };
            match self.gateway.cancel(&order_id).await {
                Ok(cancelled) => {
                    if let Ok(snapshot) = self.gateway.snapshot(&order_id).await {
                        outcome.absorb(&snapshot);
                    }
                    if outcome.status == OrderTerminal::Resting {
                        outcome.status = OrderTerminal::Cancelled;
                    }
                    if cancelled {
                        rollback.cancelled.push(order_id);
                    }
                }
                Err(e) => {
                    warn!(trade_id = %run.ladder.trade_id, "Cancel of {} failed during unwind: {}", order_id, e);
                    errors.push(format!("cancel {}: {}", order_id, e));
                }
            }
        }

        let (filled_qty, _) = run.filled();
        if filled_qty > Decimal::ZERO {
            match self
                .gateway
                .panic_close(run.ladder.trade_id, &run.owner, &run.ladder.symbol, run.ladder.side, filled_qty)
                .await
            {
                Ok((close_id, closed)) => {
                    rollback.close_order_id = Some(close_id);
                    rollback.closed_qty = closed;
                    if closed < filled_qty {
                        errors.push(format!("closed {} of {}", closed, filled_qty));
                    }
                }
                Err(e) => {
                    error!(trade_id = %run.ladder.trade_id, owner = %run.owner, "Panic close failed: {}", e);
                    errors.push(format!("close: {}", e));
                }
            }
        }

        if !errors.is_empty() {
            rollback.error = Some(errors.join("; "));
        }
        info!(trade_id = %run.ladder.trade_id, "Unwind finished: {}", rollback);
        rollback
    }

    fn hand_off(&self, run: &Run, result: &ExecutionResult, targets: Vec<(TargetOrder, String)>) {
        let Some(handoff) = &self.handoff else {
            return;
        };
        let resting_entries = run
            .orders
            .iter()
            .filter(|o| o.role.is_entry() && o.is_live())
            .filter_map(|o| o.order_id.clone())
            .collect();

        let message = PositionHandoff {
            trade_id: run.ladder.trade_id,
            owner: run.owner.clone(),
            symbol: run.ladder.symbol.clone(),
            side: run.ladder.side,
            leverage: run.ladder.leverage,
            stop: run.ladder.stop,
            avg_entry: result.avg_price,
            filled_qty: result.filled_qty,
            planned_qty: run.ladder.total_qty,
            planned_avg_entry: run.ladder.avg_entry,
            take_profit: run.ladder.take_profit.clone(),
            strategy_class: run.ladder.strategy_class.clone(),
            rules: run.ladder.rules.clone(),
            protection: run.protection,
            targets,
            resting_entries,
        };
        if handoff.send(message).is_err() {
            warn!(trade_id = %run.ladder.trade_id, "Lifecycle monitor is gone, position not supervised");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlannerConfig, RiskConfig};
    use crate::coordination::{InMemoryLockStore, MockLockStore};
    use crate::domain::{EntryLevel, TargetLevel, TradeIntent};
    use crate::exchange::{ExchangeCall, PaperExchange};
    use crate::planner::LadderPlanner;
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

    fn paper() -> Arc<PaperExchange> {
        Arc::new(
            PaperExchange::new()
                .with_instrument(rules())
                .with_mark("BTCUSDT", dec!(95000)),
        )
    }

    fn ladder(entries: Vec<EntryLevel>, take_profit: Option<TakeProfit>) -> Ladder {
        let planner = LadderPlanner::new(
            RiskCalculator::new(RiskConfig {
                max_margin_usd: dec!(1000),
                ..RiskConfig::default()
            }),
            PlannerConfig::default(),
        );
        let intent = TradeIntent {
            owner: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entries,
            stop: dec!(94300),
            risk_usd: dec!(10),
            leverage: dec!(5),
            take_profit,
            strategy_class: None,
        };
        planner.plan(&intent, &rules(), Some(dec!(95000))).unwrap()
    }

    fn market_ladder() -> Ladder {
        ladder(vec![EntryLevel::market(Decimal::ONE)], Some(TakeProfit::RiskReward(dec!(2))))
    }

    fn released_once() -> MockLockStore {
        let mut mock = MockLockStore::new();
        mock.expect_try_acquire().times(1).returning(|_, _| Ok(true));
        mock.expect_release().times(1).returning(|_| Ok(()));
        mock
    }

    fn close_orders(calls: &[ExchangeCall]) -> Vec<Decimal> {
        calls
            .iter()
            .filter_map(|c| match c {
                ExchangeCall::PlaceOrder {
                    role: OrderRole::Close,
                    qty,
                    ..
                } => Some(*qty),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_entry_completes_with_protection() {
        let exchange = paper();
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default());

        let result = coordinator.execute(&market_ladder(), "u1").await.unwrap();

        assert_eq!(result.status, ExecutionPhase::Completed);
        assert_eq!(result.filled_qty, dec!(0.014));
        assert_eq!(result.avg_price, Some(dec!(95000)));
        assert_eq!(result.actual_risk_usd, dec!(9.8));
        assert_eq!(result.actual_rr, Some(dec!(2)));
        assert_eq!(result.protection_status, ProtectionStatus::Attached);
        assert_eq!(result.order_ids.len(), 1);

        let phases: Vec<_> = result.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                ExecutionPhase::LockAcquired,
                ExecutionPhase::Submitting,
                ExecutionPhase::AwaitingFill,
                ExecutionPhase::Protecting,
                ExecutionPhase::Completed,
            ]
        );

        let position = exchange.position("u1", "BTCUSDT").await.unwrap();
        assert_eq!(position.stop, Some(dec!(94300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_makes_no_exchange_calls() {
        let exchange = paper();
        let mut mock = MockLockStore::new();
        mock.expect_try_acquire().times(1).returning(|_, _| Ok(false));
        mock.expect_release().times(0);
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(mock), ExecutionConfig::default());

        let err = coordinator.execute(&market_ladder(), "u1").await.unwrap_err();
        assert!(matches!(err, RiskonError::LockContention { ref owner } if owner == "u1"));
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_protection_failure_panic_closes_once() {
        let exchange = paper();
        exchange.reject_protection(true).await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default());

        let err = coordinator.execute(&market_ladder(), "u1").await.unwrap_err();
        let RiskonError::ProtectionFailed { rollback, report, .. } = err else {
            panic!("expected ProtectionFailed, got {:?}", err);
        };

        assert!(rollback.is_clean());
        assert_eq!(rollback.closed_qty, dec!(0.014));
        assert_eq!(report.status, ExecutionPhase::RolledBack);
        assert_eq!(report.protection_status, ProtectionStatus::Failed);

        assert_eq!(close_orders(&exchange.calls().await), vec![dec!(0.014)]);
        assert!(exchange.position("u1", "BTCUSDT").await.is_none());
        assert!(exchange.open_orders("u1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_protection_failure_is_retried() {
        let exchange = paper();
        exchange.fail_protection(2).await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(InMemoryLockStore::new()), ExecutionConfig::default());

        let result = coordinator.execute(&market_ladder(), "u1").await.unwrap();
        assert_eq!(result.protection_status, ProtectionStatus::Attached);
        assert!(close_orders(&exchange.calls().await).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_timeout_cancels_and_reports() {
        let exchange = paper();
        exchange.hold_market_fills(true).await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default());

        let err = coordinator.execute(&market_ladder(), "u1").await.unwrap_err();
        let RiskonError::FillTimeout { order_id, elapsed_ms, report } = err else {
            panic!("expected FillTimeout, got {:?}", err);
        };

        assert!(elapsed_ms >= 20_000);
        assert_eq!(report.orders[0].status, OrderTerminal::Cancelled);
        assert_eq!(report.filled_qty, Decimal::ZERO);
        assert!(exchange
            .calls()
            .await
            .contains(&ExchangeCall::CancelOrder { order_id }));
        assert!(close_orders(&exchange.calls().await).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_second_level_unwinds_first() {
        let exchange = paper();
        exchange
            .reject_role(OrderRole::Entry { level: 1 }, RejectReason::InsufficientBalance, "balance")
            .await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default());
        let two_level = ladder(
            vec![
                EntryLevel::limit(dec!(94900), dec!(0.6)),
                EntryLevel::limit(dec!(94800), dec!(0.4)),
            ],
            None,
        );

        let err = coordinator.execute(&two_level, "u1").await.unwrap_err();
        let report = err.report().cloned().unwrap();

        assert_eq!(report.status, ExecutionPhase::RolledBack);
        assert_eq!(report.orders[0].status, OrderTerminal::Cancelled);
        assert_eq!(report.orders[1].status, OrderTerminal::Failed);
        assert!(exchange.open_orders("u1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_rejection_surfaces_verbatim() {
        let exchange = paper();
        exchange
            .reject_role(OrderRole::Entry { level: 0 }, RejectReason::InvalidParams, "qty precision")
            .await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default());

        let err = coordinator.execute(&market_ladder(), "u1").await.unwrap_err();
        assert!(matches!(
            err,
            RiskonError::ExchangeRejected {
                reason: RejectReason::InvalidParams,
                ref message,
            } if message == "qty precision"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resting_entries_defer_protection() {
        let exchange = paper();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(released_once()), ExecutionConfig::default())
            .with_handoff(tx);
        let resting = ladder(
            vec![
                EntryLevel::limit(dec!(94900), dec!(0.6)),
                EntryLevel::limit(dec!(94800), dec!(0.4)),
            ],
            Some(TakeProfit::Ladder(vec![TargetLevel {
                price: dec!(96000),
                close_pct: dec!(100),
            }])),
        );

        let result = coordinator.execute(&resting, "u1").await.unwrap();
        assert_eq!(result.protection_status, ProtectionStatus::Deferred);
        assert_eq!(result.filled_qty, Decimal::ZERO);
        assert_eq!(result.resting_qty(), resting.total_qty);

        let handoff = rx.recv().await.unwrap();
        assert_eq!(handoff.resting_entries.len(), 2);
        assert!(handoff.avg_entry.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ack_does_not_duplicate_entry() {
        let exchange = paper();
        exchange.fail_places_after_accept(1).await;
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(InMemoryLockStore::new()), ExecutionConfig::default());

        let result = coordinator.execute(&market_ladder(), "u1").await.unwrap();
        assert_eq!(result.filled_qty, dec!(0.014));
        let entries = exchange
            .orders()
            .await
            .into_iter()
            .filter(|(spec, _)| spec.role.is_entry())
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_lock_is_free() {
        let exchange = paper();
        let mut mock = MockLockStore::new();
        mock.expect_try_acquire().times(0);
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(mock), ExecutionConfig::default());

        let (_tx, rx) = watch::channel(true);
        let err = coordinator
            .execute_cancellable(&market_ladder(), "u1", rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskonError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_lock_releases_without_orders() {
        let exchange = paper();
        let (tx, rx) = watch::channel(false);
        let mut mock = MockLockStore::new();
        mock.expect_try_acquire().times(1).returning(move |_, _| {
            // Caller cancels while the lock is being taken
            let _ = tx.send(true);
            Ok(true)
        });
        mock.expect_release().times(1).returning(|_| Ok(()));
        let coordinator = ExecutionCoordinator::new(exchange.clone(), Arc::new(mock), ExecutionConfig::default());

        let err = coordinator
            .execute_cancellable(&market_ladder(), "u1", rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskonError::Cancelled));
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_ladder_is_refused() {
        let coordinator = ExecutionCoordinator::new(paper(), Arc::new(InMemoryLockStore::new()), ExecutionConfig::default());
        let err = coordinator.execute(&market_ladder(), "u2").await.unwrap_err();
        assert!(matches!(err, RiskonError::Validation(ValidationError::InvalidIntent(_))));
    }
}
