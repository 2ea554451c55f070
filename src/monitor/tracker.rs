//! One task per supervised position

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::breakeven::{BreakevenInput, BreakevenRule};
use super::ev::EvCommand;
use super::outcome::{classify, r_multiple, ClosedTrade, ExitContext};
use super::post_stop::{self, PostStopRecord, StoppedTrade};
use super::within_cycle;
use crate::config::MonitorConfig;
use crate::domain::{ExitTrigger, LiquidationEstimate, MarginMode, OrderRole, OrderStatus, Position, Side};
use crate::execution::{
    attach, move_stop, order_key, OrderGateway, PositionHandoff, ProtectionRequest, ProtectionStatus,
};
use crate::planner::TargetOrder;
use crate::risk::{LiquidationInput, RiskCalculator};

/// Consistent copy of a supervised position for readers outside the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry: Option<Decimal>,
    pub stop: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub liquidation: Option<LiquidationEstimate>,
    pub targets_filled: Vec<usize>,
    pub breakeven_applied: bool,
    pub protected: bool,
    pub closed: bool,
    pub updated_at: DateTime<Utc>,
}

/// What the supervisor saw for this position on a cycle
#[derive(Debug, Clone)]
pub(crate) enum Observation {
    Open(Position),
    Flat,
}

/// Collaborators shared by every position task
pub(crate) struct TrackerContext {
    pub gateway: Arc<OrderGateway>,
    pub calculator: RiskCalculator,
    pub config: MonitorConfig,
    pub breakeven: BreakevenRule,
    pub ev: mpsc::UnboundedSender<EvCommand>,
    pub closed: broadcast::Sender<ClosedTrade>,
    pub snapshots: broadcast::Sender<PositionSnapshot>,
    pub post_stop: mpsc::UnboundedSender<PostStopRecord>,
}

#[derive(Debug, Clone)]
struct LiveTarget {
    target: TargetOrder,
    order_id: String,
    revision: u32,
    filled: Decimal,
}

impl LiveTarget {
    fn key(&self, trade_id: Uuid) -> String {
        order_key(
            trade_id,
            OrderRole::TakeProfit {
                index: self.target.index,
                revision: self.revision,
            },
        )
    }
}

pub(crate) struct PositionTracker {
    ctx: Arc<TrackerContext>,
    handoff: PositionHandoff,
    opened: bool,
    protected: bool,
    /// Panic-closed after deferred protection failed
    abandoned: bool,
    avg_entry: Option<Decimal>,
    size: Decimal,
    peak_size: Decimal,
    /// Size the live targets were placed for
    targeted_size: Decimal,
    stop: Option<Decimal>,
    position_target: Option<Decimal>,
    targets: Vec<LiveTarget>,
    revision: u32,
    resync_pending: bool,
    /// (qty, price) of every reducing fill seen so far
    fills: Vec<(Decimal, Decimal)>,
    targets_filled: Vec<usize>,
    breakeven_stop: Option<Decimal>,
    last_mark: Decimal,
    /// Exit already classified and recorded
    close_recorded: bool,
    /// Target orders still to cancel after the close
    stale_targets: Vec<String>,
    snapshot_tx: watch::Sender<PositionSnapshot>,
}

impl PositionTracker {
    pub fn new(ctx: Arc<TrackerContext>, handoff: PositionHandoff) -> (Self, watch::Receiver<PositionSnapshot>) {
        let protected = matches!(handoff.protection, ProtectionStatus::Attached | ProtectionStatus::StopOnly);
        let targets = handoff
            .targets
            .iter()
            .map(|(target, order_id)| LiveTarget {
                target: target.clone(),
                order_id: order_id.clone(),
                revision: 0,
                filled: Decimal::ZERO,
            })
            .collect();

        let initial = PositionSnapshot {
            trade_id: handoff.trade_id,
            owner: handoff.owner.clone(),
            symbol: handoff.symbol.clone(),
            side: handoff.side,
            size: handoff.filled_qty,
            avg_entry: handoff.avg_entry,
            stop: protected.then_some(handoff.stop),
            take_profit: None,
            mark_price: handoff.avg_entry.unwrap_or(handoff.planned_avg_entry),
            unrealized_pnl: Decimal::ZERO,
            liquidation: None,
            targets_filled: Vec::new(),
            breakeven_applied: false,
            protected,
            closed: false,
            updated_at: Utc::now(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let tracker = Self {
            ctx,
            opened: handoff.filled_qty > Decimal::ZERO,
            protected,
            abandoned: false,
            avg_entry: handoff.avg_entry,
            size: handoff.filled_qty,
            peak_size: handoff.filled_qty,
            targeted_size: handoff.filled_qty,
            stop: protected.then_some(handoff.stop),
            position_target: None,
            targets,
            revision: 0,
            resync_pending: false,
            fills: Vec::new(),
            targets_filled: Vec::new(),
            breakeven_stop: None,
            last_mark: handoff.avg_entry.unwrap_or(handoff.planned_avg_entry),
            close_recorded: false,
            stale_targets: Vec::new(),
            snapshot_tx,
            handoff,
        };
        (tracker, snapshot_rx)
    }

    pub async fn run(mut self, mut observations: mpsc::Receiver<Observation>) {
        debug!(trade_id = %self.handoff.trade_id, symbol = %self.handoff.symbol, "Position task started");
        while let Some(observation) = observations.recv().await {
            let finished = match observation {
                // Closed already; only leftover cleanup remains
                _ if self.close_recorded => self.cancel_stale_targets().await,
                Observation::Open(position) => {
                    self.on_open(position).await;
                    false
                }
                Observation::Flat => self.on_flat().await,
            };
            if finished {
                break;
            }
        }
        debug!(trade_id = %self.handoff.trade_id, "Position task ended");
    }

    async fn on_open(&mut self, position: Position) {
        let grew = position.size > self.size;
        self.opened = true;
        self.last_mark = position.mark_price;
        self.size = position.size;
        self.peak_size = self.peak_size.max(position.size);
        self.avg_entry = Some(position.avg_entry);
        if position.stop.is_some() {
            self.stop = position.stop;
        }
        if position.take_profit.is_some() {
            self.position_target = position.take_profit;
        }

        if self.abandoned {
            // Close already issued; wait for the flat observation
        } else if !self.protected {
            self.protect_deferred(&position).await;
        } else if (grew && position.size > self.targeted_size) || self.resync_pending {
            self.resync_targets(&position).await;
        }

        self.refresh_targets().await;
        self.apply_breakeven().await;
        self.publish(Some(&position), false);
    }

    /// First sight of a position whose entries were all resting at execution time
    async fn protect_deferred(&mut self, position: &Position) {
        let h = &self.handoff;
        info!(trade_id = %h.trade_id, symbol = %h.symbol, "Attaching deferred protection to {}", position.size);
        let request = ProtectionRequest {
            trade_id: h.trade_id,
            owner: &h.owner,
            symbol: &h.symbol,
            side: h.side,
            stop: h.stop,
            avg_entry: position.avg_entry,
            qty: position.size,
            take_profit: h.take_profit.as_ref(),
            rules: &h.rules,
            revision: self.revision,
        };
        let report = attach(&self.ctx.gateway, &request).await;

        if let Some(reason) = &report.stop_error {
            error!(trade_id = %h.trade_id, owner = %h.owner, "Deferred stop failed ({}), closing position", reason);
            let trade_id = h.trade_id;
            let owner = h.owner.clone();
            let symbol = h.symbol.clone();
            let side = h.side;
            self.abandoned = true;
            self.cancel_resting_entries().await;
            match self
                .ctx
                .gateway
                .panic_close(trade_id, &owner, &symbol, side, position.size)
                .await
            {
                Ok((order_id, closed)) => info!(trade_id = %trade_id, "Panic close {} filled {}", order_id, closed),
                Err(e) => error!(trade_id = %trade_id, owner = %owner, "Panic close failed: {}", e),
            }
            return;
        }

        self.protected = true;
        self.stop = Some(self.handoff.stop);
        self.position_target = report.targets.first().filter(|_| report.outcomes.is_empty()).map(|t| t.price);
        self.targets = self.live_targets(report.target_orders());
        self.targeted_size = position.size;
    }

    /// Position grew after another entry filled: re-place ladder targets for the new size
    async fn resync_targets(&mut self, position: &Position) {
        let trade_id = self.handoff.trade_id;
        if self.breakeven_stop.is_some() {
            debug!(trade_id = %trade_id, "Position grew after breakeven, targets left as placed");
            self.targeted_size = position.size;
            self.resync_pending = false;
            return;
        }

        for target in self.targets.iter().filter(|t| t.filled < t.target.qty) {
            if let Err(e) = self.ctx.gateway.cancel(&target.order_id).await {
                warn!(trade_id = %trade_id, "Cancel of target {} failed, resync retried next cycle: {}", target.order_id, e);
                self.resync_pending = true;
                return;
            }
        }

        self.revision += 1;
        let h = &self.handoff;
        let request = ProtectionRequest {
            trade_id,
            owner: &h.owner,
            symbol: &h.symbol,
            side: h.side,
            stop: self.stop.unwrap_or(h.stop),
            avg_entry: position.avg_entry,
            qty: position.size,
            take_profit: h.take_profit.as_ref(),
            rules: &h.rules,
            revision: self.revision,
        };
        let report = attach(&self.ctx.gateway, &request).await;
        if report.stop_attached() {
            info!(
                trade_id = %trade_id,
                "Targets resynced to {} (revision {})",
                position.size,
                self.revision
            );
            self.position_target = report.targets.first().filter(|_| report.outcomes.is_empty()).map(|t| t.price);
            self.targets = self.live_targets(report.target_orders());
            self.targeted_size = position.size;
            self.resync_pending = false;
        } else {
            warn!(trade_id = %trade_id, "Target resync failed, retrying next cycle");
            self.resync_pending = true;
        }
    }

    fn live_targets(&self, placed: Vec<(TargetOrder, String)>) -> Vec<LiveTarget> {
        placed
            .into_iter()
            .map(|(target, order_id)| LiveTarget {
                target,
                order_id,
                revision: self.revision,
                filled: Decimal::ZERO,
            })
            .collect()
    }

    /// Pick up take-profit fills
    async fn refresh_targets(&mut self) {
        let limit = self.ctx.config.interval();
        for target in self.targets.iter_mut() {
            if target.filled >= target.target.qty {
                continue;
            }
            let snapshot = match within_cycle(limit, self.ctx.gateway.exchange().get_order(&target.order_id)).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(trade_id = %self.handoff.trade_id, "Target {} status read failed: {}", target.order_id, e);
                    continue;
                }
            };
            if snapshot.filled_qty > target.filled {
                let price = if snapshot.avg_price > Decimal::ZERO {
                    snapshot.avg_price
                } else {
                    target.target.price
                };
                self.fills.push((snapshot.filled_qty - target.filled, price));
                target.filled = snapshot.filled_qty;
            }
            if snapshot.status == OrderStatus::Filled && !self.targets_filled.contains(&target.target.index) {
                self.targets_filled.push(target.target.index);
                info!(
                    trade_id = %self.handoff.trade_id,
                    "Target {} filled: {} @ {}",
                    target.target.index,
                    snapshot.filled_qty,
                    target.target.price
                );
            }
        }
    }

    async fn apply_breakeven(&mut self) {
        let Some(entry) = self.avg_entry else {
            return;
        };
        if !self.protected || self.abandoned {
            return;
        }
        let input = BreakevenInput {
            side: self.handoff.side,
            entry,
            current_stop: self.stop,
            peak_size: self.peak_size,
            size: self.size,
            targets_filled: &self.targets_filled,
            already_applied: self.breakeven_stop.is_some(),
            tick_size: self.handoff.rules.tick_size,
        };
        let Some(price) = self.ctx.breakeven.evaluate(&input) else {
            return;
        };

        let h = &self.handoff;
        let moved = tokio::time::timeout(
            self.ctx.config.interval(),
            move_stop(&self.ctx.gateway, h.trade_id, &h.owner, &h.symbol, price),
        )
        .await;
        match moved {
            Ok(report) if report.stop_attached() => {
                info!(trade_id = %h.trade_id, "Breakeven applied at {}", price);
                self.stop = Some(price);
                self.breakeven_stop = Some(price);
            }
            Ok(_) => warn!(trade_id = %h.trade_id, "Breakeven move failed, retrying next cycle"),
            Err(_) => warn!(trade_id = %h.trade_id, "Breakeven move timed out, retrying next cycle"),
        }
    }

    async fn cancel_resting_entries(&mut self) {
        for order_id in std::mem::take(&mut self.handoff.resting_entries) {
            if let Err(e) = self.ctx.gateway.cancel(&order_id).await {
                warn!(trade_id = %self.handoff.trade_id, "Cancel of resting entry {} failed: {}", order_id, e);
            }
        }
    }

    /// Returns true once the position is finished with
    async fn on_flat(&mut self) -> bool {
        if !self.opened {
            return self.entries_expired().await;
        }

        self.refresh_targets().await;
        let h = &self.handoff;
        let exit = match within_cycle(
            self.ctx.config.interval(),
            self.ctx.gateway.exchange().last_exit(&h.owner, &h.symbol),
        )
        .await
        {
            Ok(exit) => exit,
            Err(e) => {
                warn!(trade_id = %h.trade_id, "Exit fill lookup failed: {}", e);
                None
            }
        };

        self.cancel_resting_entries().await;
        self.stale_targets = self
            .targets
            .iter()
            .filter(|t| t.filled < t.target.qty)
            .map(|t| t.order_id.clone())
            .collect();
        let cleaned_up = self.cancel_stale_targets().await;

        let h = &self.handoff;
        let (trigger, exit_price, exit_key) = match &exit {
            Some(fill) => (fill.trigger, fill.price, fill.order_key.clone()),
            None => (ExitTrigger::Manual, self.last_mark, None),
        };
        let closing_target = exit_key
            .as_deref()
            .and_then(|key| self.targets.iter().find(|t| t.key(h.trade_id) == key))
            .map(|t| t.target.index)
            .or_else(|| self.targets_filled.iter().max().copied());

        let by_targets: Decimal = self.fills.iter().map(|(qty, _)| *qty).sum();
        let entered = self.peak_size.max(by_targets);
        let remaining = entered - by_targets;
        if remaining > Decimal::ZERO {
            self.fills.push((remaining, exit_price));
        }

        let entry = self.avg_entry.unwrap_or(h.planned_avg_entry);
        let r = r_multiple(h.side, entry, h.stop, entered, &self.fills);
        let outcome = classify(&ExitContext {
            side: h.side,
            entry,
            trigger,
            exit_price,
            closing_target,
            breakeven_stop: self.breakeven_stop,
        });
        info!(
            trade_id = %h.trade_id,
            owner = %h.owner,
            symbol = %h.symbol,
            "Position closed: {} ({}R) via {:?} @ {}",
            outcome,
            r,
            trigger,
            exit_price
        );

        if let Some(class) = &h.strategy_class {
            let record = EvCommand::Record {
                class: class.clone(),
                r_multiple: r,
            };
            if self.ctx.ev.send(record).is_err() {
                error!(trade_id = %h.trade_id, "EV tracker is gone, {}R for {} not recorded", r, class);
            }
        }

        if trigger == ExitTrigger::StopLoss {
            post_stop::spawn_watch(
                self.ctx.gateway.exchange().clone(),
                StoppedTrade {
                    trade_id: h.trade_id,
                    symbol: h.symbol.clone(),
                    side: h.side,
                    entry,
                    stop_price: exit_price,
                },
                std::time::Duration::from_secs(self.ctx.config.post_stop_short_secs),
                std::time::Duration::from_secs(self.ctx.config.post_stop_long_secs),
                self.ctx.post_stop.clone(),
            );
        }

        let closed = ClosedTrade {
            trade_id: h.trade_id,
            owner: h.owner.clone(),
            symbol: h.symbol.clone(),
            side: h.side,
            strategy_class: h.strategy_class.clone(),
            outcome,
            r_multiple: r,
            entry,
            exit_price,
            initial_stop: h.stop,
            entered_qty: entered,
            targets_filled: self.targets_filled.clone(),
            closed_at: Utc::now(),
        };
        let _ = self.ctx.closed.send(closed);

        self.size = Decimal::ZERO;
        self.last_mark = exit_price;
        self.close_recorded = true;
        self.publish(None, true);
        cleaned_up
    }

    /// Cancel take-profit orders left after the close. Returns true once none remain.
    async fn cancel_stale_targets(&mut self) -> bool {
        let limit = self.ctx.config.interval();
        let mut failed = Vec::new();
        for order_id in std::mem::take(&mut self.stale_targets) {
            if let Err(e) = within_cycle(limit, self.ctx.gateway.cancel(&order_id)).await {
                warn!(
                    trade_id = %self.handoff.trade_id,
                    "Cancel of leftover target {} failed, retrying next cycle: {}",
                    order_id,
                    e
                );
                failed.push(order_id);
            }
        }
        self.stale_targets = failed;
        self.stale_targets.is_empty()
    }

    /// Never filled: finished once every resting entry is gone
    async fn entries_expired(&mut self) -> bool {
        let limit = self.ctx.config.interval();
        let mut live = Vec::new();
        for order_id in &self.handoff.resting_entries {
            match within_cycle(limit, self.ctx.gateway.exchange().get_order(order_id)).await {
                Ok(snapshot) if snapshot.status.is_terminal() && snapshot.filled_qty.is_zero() => {}
                Ok(_) => live.push(order_id.clone()),
                Err(e) => {
                    warn!(trade_id = %self.handoff.trade_id, "Entry {} status read failed: {}", order_id, e);
                    live.push(order_id.clone());
                }
            }
        }
        self.handoff.resting_entries = live;
        if self.handoff.resting_entries.is_empty() {
            info!(trade_id = %self.handoff.trade_id, "All entries ended unfilled, nothing to supervise");
            self.publish(None, true);
            return true;
        }
        false
    }

    fn publish(&self, position: Option<&Position>, closed: bool) {
        let h = &self.handoff;
        let liquidation = match (self.avg_entry, position) {
            (Some(entry), Some(p)) if p.size > Decimal::ZERO => self
                .ctx
                .calculator
                .liquidation_estimate(&LiquidationInput {
                    side: h.side,
                    entry,
                    qty: p.size,
                    leverage: h.leverage,
                    mode: MarginMode::Isolated,
                    reported: p.liq_price,
                })
                .ok(),
            _ => None,
        };

        let snapshot = PositionSnapshot {
            trade_id: h.trade_id,
            owner: h.owner.clone(),
            symbol: h.symbol.clone(),
            side: h.side,
            size: self.size,
            avg_entry: self.avg_entry,
            stop: self.stop,
            take_profit: self.position_target,
            mark_price: self.last_mark,
            unrealized_pnl: position.map(|p| p.unrealized_pnl).unwrap_or_default(),
            liquidation,
            targets_filled: self.targets_filled.clone(),
            breakeven_applied: self.breakeven_stop.is_some(),
            protected: self.protected,
            closed,
            updated_at: Utc::now(),
        };
        self.snapshot_tx.send_replace(snapshot.clone());
        let _ = self.ctx.snapshots.send(snapshot);
    }
}
