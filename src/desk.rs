//! Intent-to-position flow: validate, gate, plan, execute, supervise

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::coordination::LockStore;
use crate::domain::TradeIntent;
use crate::error::Result;
use crate::exchange::{ExchangeClient, InstrumentCache};
use crate::execution::{ExecutionCoordinator, ExecutionResult};
use crate::monitor::{EvGate, PositionLifecycleMonitor, PostStopRecord};
use crate::planner::{Ladder, LadderPlanner};
use crate::risk::RiskCalculator;

pub struct TradeDesk {
    exchange: Arc<dyn ExchangeClient>,
    planner: LadderPlanner,
    coordinator: ExecutionCoordinator,
    instruments: InstrumentCache,
    ev: EvGate,
}

impl TradeDesk {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        planner: LadderPlanner,
        coordinator: ExecutionCoordinator,
        ev: EvGate,
    ) -> Self {
        Self {
            exchange,
            planner,
            coordinator,
            instruments: InstrumentCache::new(),
            ev,
        }
    }

    pub fn ev(&self) -> &EvGate {
        &self.ev
    }

    pub fn instruments(&self) -> &InstrumentCache {
        &self.instruments
    }

    /// Validate and plan without placing anything
    pub async fn preview(&self, intent: &TradeIntent) -> Result<Ladder> {
        if let Some(class) = &intent.strategy_class {
            self.ev.check(class)?;
        }

        // Limit-only intents are fully checkable before touching the exchange
        let reference: Option<Decimal> = if intent.needs_reference_price() {
            let mark = self.exchange.get_mark_price(&intent.symbol).await?;
            debug!(symbol = %intent.symbol, "Reference price {}", mark);
            Some(mark)
        } else {
            None
        };
        self.planner.calculator().validate_intent(intent, reference)?;

        let rules = self.instruments.get(self.exchange.as_ref(), &intent.symbol).await?;
        self.planner.plan(intent, &rules, reference)
    }

    pub async fn submit(&self, intent: &TradeIntent) -> Result<ExecutionResult> {
        let (_never, cancel) = watch::channel(false);
        self.submit_cancellable(intent, cancel).await
    }

    pub async fn submit_cancellable(
        &self,
        intent: &TradeIntent,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionResult> {
        let ladder = self.preview(intent).await?;
        info!(
            trade_id = %ladder.trade_id,
            owner = %intent.owner,
            symbol = %intent.symbol,
            "Planned {} orders, {} @ {} risking {}",
            ladder.orders.len(),
            ladder.total_qty,
            ladder.avg_entry,
            ladder.total_risk
        );
        for downgrade in &ladder.downgrades {
            warn!(trade_id = %ladder.trade_id, "Ladder downgraded: {:?}", downgrade);
        }

        self.coordinator
            .execute_cancellable(&ladder, &intent.owner, cancel)
            .await
    }
}

/// A desk wired to its lifecycle monitor and EV tracker
pub struct DeskRuntime {
    pub desk: Arc<TradeDesk>,
    pub monitor: Arc<PositionLifecycleMonitor>,
    pub post_stop: mpsc::UnboundedReceiver<PostStopRecord>,
    shutdown: watch::Sender<bool>,
    monitor_task: Option<JoinHandle<()>>,
}

impl DeskRuntime {
    /// Must be called inside a tokio runtime
    pub fn start(config: &AppConfig, exchange: Arc<dyn ExchangeClient>, locks: Arc<dyn LockStore>) -> Self {
        let (ev, _ev_task) = EvGate::spawn(config.ev.clone());
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();

        let coordinator =
            ExecutionCoordinator::new(exchange.clone(), locks, config.execution.clone()).with_handoff(handoff_tx);
        let (monitor, post_stop) = PositionLifecycleMonitor::new(
            coordinator.gateway().clone(),
            RiskCalculator::new(config.risk.clone()),
            config.monitor.clone(),
            ev.sender(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let monitor_task = monitor.start(handoff_rx, shutdown_rx);

        let planner = LadderPlanner::new(RiskCalculator::new(config.risk.clone()), config.planner.clone());
        let desk = TradeDesk::new(exchange, planner, coordinator, ev);

        Self {
            desk: Arc::new(desk),
            monitor: Arc::new(monitor),
            post_stop,
            shutdown,
            monitor_task,
        }
    }

    /// Stop supervision. Exchange-side protection stays in place.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.monitor_task.take() {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvConfig;
    use crate::coordination::InMemoryLockStore;
    use crate::domain::{EntryLevel, InstrumentRules, Side, StrategyClass, TakeProfit};
    use crate::error::{RiskonError, ValidationError};
    use crate::exchange::PaperExchange;
    use crate::execution::{ExecutionPhase, ProtectionStatus};
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

    fn app_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.risk.max_margin_usd = dec!(1000);
        config
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
            take_profit: Some(TakeProfit::RiskReward(dec!(2))),
            strategy_class: Some(StrategyClass::new("breakout", "BTCUSDT")),
        }
    }

    fn paper() -> Arc<PaperExchange> {
        Arc::new(
            PaperExchange::new()
                .with_instrument(rules())
                .with_mark("BTCUSDT", dec!(95000)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_intent_end_to_end() {
        let exchange = paper();
        let runtime = DeskRuntime::start(&app_config(), exchange.clone(), Arc::new(InMemoryLockStore::new()));

        let result = runtime
            .desk
            .submit(&intent(vec![EntryLevel::market(dec!(1))]))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionPhase::Completed);
        assert_eq!(result.filled_qty, dec!(0.014));
        assert_eq!(result.protection_status, ProtectionStatus::Attached);

        let position = exchange.position("u1", "BTCUSDT").await.unwrap();
        assert_eq!(position.stop, Some(dec!(94300)));

        tokio::time::sleep(std::time::Duration::from_secs(16)).await;
        assert_eq!(runtime.monitor.tracked_count(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_limit_intent_makes_no_exchange_calls() {
        let exchange = paper();
        let runtime = DeskRuntime::start(&app_config(), exchange.clone(), Arc::new(InMemoryLockStore::new()));

        // Stop above a long entry
        let mut bad = intent(vec![EntryLevel::limit(dec!(94000), dec!(1))]);
        bad.take_profit = None;
        let err = runtime.desk.submit(&bad).await.unwrap_err();
        assert!(matches!(err, RiskonError::Validation(ValidationError::InvalidIntent(_))));
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_class_is_rejected_before_planning() {
        let exchange = paper();
        let mut config = app_config();
        config.ev = EvConfig {
            min_sample: 2,
            rolling_window: 2,
            ..EvConfig::default()
        };
        let runtime = DeskRuntime::start(&config, exchange.clone(), Arc::new(InMemoryLockStore::new()));

        let class = StrategyClass::new("breakout", "BTCUSDT");
        runtime.desk.ev().submit(class.clone(), dec!(-1));
        runtime.desk.ev().submit(class.clone(), dec!(-1));
        runtime.desk.ev().sync().await;

        let err = runtime
            .desk
            .submit(&intent(vec![EntryLevel::market(dec!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RiskonError::Validation(ValidationError::StrategyDisabled { .. })
        ));
        assert!(exchange.calls().await.is_empty());

        // Other classes are unaffected
        let mut other = intent(vec![EntryLevel::market(dec!(1))]);
        other.strategy_class = Some(StrategyClass::new("mean_reversion", "BTCUSDT"));
        assert!(runtime.desk.preview(&other).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_places_nothing() {
        let exchange = paper();
        let runtime = DeskRuntime::start(&app_config(), exchange.clone(), Arc::new(InMemoryLockStore::new()));

        let ladder = runtime
            .desk
            .preview(&intent(vec![
                EntryLevel::limit(dec!(95000), dec!(0.6)),
                EntryLevel::limit(dec!(94800), dec!(0.4)),
            ]))
            .await
            .unwrap();
        assert_eq!(ladder.orders.len(), 2);
        assert_eq!(ladder.avg_entry, dec!(94920));
        assert!(exchange.placements().await.is_empty());
        assert_eq!(runtime.desk.instruments().len(), 1);
    }
}
