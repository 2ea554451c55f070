//! Expected-value bookkeeping per strategy class and the gate built on it.
//!
//! A single tracker task owns the book. Position tasks send it closed-trade
//! R multiples over a channel; readers see a published copy through `watch`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EvConfig;
use crate::domain::StrategyClass;
use crate::error::{Result, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Fewer trades than the minimum sample
    NoData,
    Allowed,
    /// Expectancy below the warn threshold, still tradable
    Warn,
    /// Sticky until reset
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvRecord {
    pub class: StrategyClass,
    pub trade_count: u64,
    pub r_sum: Decimal,
    /// Most recent R multiples, oldest first
    pub rolling: VecDeque<Decimal>,
    pub status: GateStatus,
    pub disabled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EvRecord {
    fn new(class: StrategyClass) -> Self {
        Self {
            class,
            trade_count: 0,
            r_sum: Decimal::ZERO,
            rolling: VecDeque::new(),
            status: GateStatus::NoData,
            disabled_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Lifetime average R
    pub fn expectancy(&self) -> Option<Decimal> {
        if self.trade_count == 0 {
            return None;
        }
        Some(self.r_sum / Decimal::from(self.trade_count))
    }

    pub fn rolling_expectancy(&self) -> Option<Decimal> {
        if self.rolling.is_empty() {
            return None;
        }
        let sum: Decimal = self.rolling.iter().sum();
        Some(sum / Decimal::from(self.rolling.len() as u64))
    }
}

/// In-memory EV book
#[derive(Debug, Clone)]
pub struct EvBook {
    config: EvConfig,
    records: HashMap<StrategyClass, EvRecord>,
}

impl EvBook {
    pub fn new(config: EvConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub fn get(&self, class: &StrategyClass) -> Option<&EvRecord> {
        self.records.get(class)
    }

    pub fn status(&self, class: &StrategyClass) -> GateStatus {
        self.records
            .get(class)
            .map(|r| r.status)
            .unwrap_or(GateStatus::NoData)
    }

    pub fn records(&self) -> &HashMap<StrategyClass, EvRecord> {
        &self.records
    }

    pub fn record(&mut self, class: &StrategyClass, r_multiple: Decimal) -> GateStatus {
        let window = self.config.rolling_window.max(1);
        let record = self
            .records
            .entry(class.clone())
            .or_insert_with(|| EvRecord::new(class.clone()));

        record.trade_count += 1;
        record.r_sum += r_multiple;
        record.rolling.push_back(r_multiple);
        while record.rolling.len() > window {
            record.rolling.pop_front();
        }
        record.updated_at = Utc::now();

        let previous = record.status;
        let next = Self::evaluate(&self.config, record);
        record.status = next;
        if next == GateStatus::Disabled && previous != GateStatus::Disabled {
            record.disabled_at = Some(Utc::now());
            warn!(
                class = %class,
                "Strategy disabled: expectancy {:?} over {} trades, rolling {:?}",
                record.expectancy(),
                record.trade_count,
                record.rolling_expectancy()
            );
        } else if next != previous {
            info!(class = %class, "EV gate {:?} -> {:?}", previous, next);
        }
        next
    }

    fn evaluate(config: &EvConfig, record: &EvRecord) -> GateStatus {
        if record.status == GateStatus::Disabled {
            return GateStatus::Disabled;
        }
        if record.trade_count < config.min_sample {
            return GateStatus::NoData;
        }
        let lifetime = record.expectancy().unwrap_or_default();
        let rolling_full = record.rolling.len() >= config.rolling_window.max(1);
        let rolling = record.rolling_expectancy().unwrap_or_default();

        if lifetime <= config.disable_threshold && rolling_full && rolling <= config.rolling_disable_threshold {
            GateStatus::Disabled
        } else if lifetime < config.warn_threshold {
            GateStatus::Warn
        } else {
            GateStatus::Allowed
        }
    }

    /// Re-enable a class and clear its rolling window. Lifetime totals stay.
    pub fn reset(&mut self, class: &StrategyClass) {
        let Some(record) = self.records.get_mut(class) else {
            return;
        };
        record.rolling.clear();
        record.disabled_at = None;
        record.status = GateStatus::Allowed;
        record.status = Self::evaluate(&self.config, record);
        record.updated_at = Utc::now();
        info!(class = %class, "EV gate reset, now {:?}", record.status);
    }
}

pub enum EvCommand {
    Record { class: StrategyClass, r_multiple: Decimal },
    Reset { class: StrategyClass },
    /// Acknowledged once every earlier command is applied
    Barrier(oneshot::Sender<()>),
}

type EvView = HashMap<StrategyClass, EvRecord>;

/// Handle to the EV tracker task: submits updates, reads the published book
#[derive(Clone)]
pub struct EvGate {
    commands: mpsc::UnboundedSender<EvCommand>,
    view: watch::Receiver<EvView>,
}

impl EvGate {
    /// Start the tracker task. It runs until every gate clone is dropped.
    pub fn spawn(config: EvConfig) -> (EvGate, JoinHandle<()>) {
        let (commands, mut rx) = mpsc::unbounded_channel::<EvCommand>();
        let (publish, view) = watch::channel(EvView::new());
        let mut book = EvBook::new(config);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    EvCommand::Record { class, r_multiple } => {
                        debug!(class = %class, "Recording {}R", r_multiple);
                        book.record(&class, r_multiple);
                    }
                    EvCommand::Reset { class } => book.reset(&class),
                    EvCommand::Barrier(ack) => {
                        let _ = ack.send(());
                        continue;
                    }
                }
                publish.send_replace(book.records().clone());
            }
            debug!("EV tracker stopped");
        });

        (EvGate { commands, view }, handle)
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<EvCommand> {
        self.commands.clone()
    }

    pub fn status(&self, class: &StrategyClass) -> GateStatus {
        self.view
            .borrow()
            .get(class)
            .map(|r| r.status)
            .unwrap_or(GateStatus::NoData)
    }

    /// Reject intents of a disabled class
    pub fn check(&self, class: &StrategyClass) -> Result<()> {
        match self.status(class) {
            GateStatus::Disabled => Err(ValidationError::StrategyDisabled {
                class: class.to_string(),
            }
            .into()),
            GateStatus::Warn => {
                warn!(class = %class, "Strategy expectancy below warn threshold");
                Ok(())
            }
            GateStatus::NoData | GateStatus::Allowed => Ok(()),
        }
    }

    pub fn record(&self, class: &StrategyClass) -> Option<EvRecord> {
        self.view.borrow().get(class).cloned()
    }

    pub fn records(&self) -> Vec<EvRecord> {
        self.view.borrow().values().cloned().collect()
    }

    pub fn submit(&self, class: StrategyClass, r_multiple: Decimal) {
        let _ = self.commands.send(EvCommand::Record { class, r_multiple });
    }

    pub fn reset(&self, class: StrategyClass) {
        let _ = self.commands.send(EvCommand::Reset { class });
    }

    /// Wait until everything sent so far is applied and published
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(EvCommand::Barrier(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RiskonError;
    use rust_decimal_macros::dec;

    fn class() -> StrategyClass {
        StrategyClass::new("breakout", "BTCUSDT")
    }

    fn small_config() -> EvConfig {
        EvConfig {
            min_sample: 4,
            rolling_window: 2,
            ..EvConfig::default()
        }
    }

    #[test]
    fn test_no_data_until_min_sample() {
        let mut book = EvBook::new(small_config());
        for _ in 0..3 {
            assert_eq!(book.record(&class(), dec!(-1)), GateStatus::NoData);
        }
        assert_eq!(book.record(&class(), dec!(-1)), GateStatus::Disabled);
    }

    #[test]
    fn test_warn_then_allowed() {
        let mut book = EvBook::new(small_config());
        for r in [dec!(1), dec!(-1), dec!(0.5), dec!(-0.6)] {
            book.record(&class(), r);
        }
        // lifetime -0.025, rolling -0.05: negative but above both disable thresholds
        assert_eq!(book.status(&class()), GateStatus::Warn);

        book.record(&class(), dec!(2));
        assert_eq!(book.status(&class()), GateStatus::Allowed);
    }

    #[test]
    fn test_disabled_needs_both_expectancies() {
        let mut book = EvBook::new(small_config());
        for r in [dec!(-1), dec!(-1), dec!(0.5), dec!(0.5)] {
            book.record(&class(), r);
        }
        // lifetime -0.25 but the rolling window is +0.5
        assert_eq!(book.status(&class()), GateStatus::Warn);
    }

    #[test]
    fn test_disable_is_sticky_until_reset() {
        let mut book = EvBook::new(small_config());
        for _ in 0..4 {
            book.record(&class(), dec!(-1));
        }
        assert_eq!(book.status(&class()), GateStatus::Disabled);
        assert_eq!(book.record(&class(), dec!(3)), GateStatus::Disabled);

        book.reset(&class());
        let record = book.get(&class()).unwrap();
        assert!(record.rolling.is_empty());
        assert_eq!(record.trade_count, 5);
        assert_ne!(record.status, GateStatus::Disabled);
    }

    #[tokio::test]
    async fn test_gate_rejects_disabled_class() {
        let (gate, _task) = EvGate::spawn(small_config());
        for _ in 0..4 {
            gate.submit(class(), dec!(-1));
        }
        gate.sync().await;

        assert_eq!(gate.status(&class()), GateStatus::Disabled);
        assert!(matches!(
            gate.check(&class()),
            Err(RiskonError::Validation(ValidationError::StrategyDisabled { .. }))
        ));
        assert!(gate.check(&StrategyClass::new("breakout", "ETHUSDT")).is_ok());

        gate.reset(class());
        gate.sync().await;
        assert!(gate.check(&class()).is_ok());
        assert_eq!(gate.records().len(), 1);
    }
}
