//! Attaching stop-loss and take-profit to a filled position.
//!
//! Shared by the coordinator (right after entry fills) and the lifecycle
//! monitor (deferred protection, target resync, breakeven).

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::gateway::OrderGateway;
use super::idempotency::order_key;
use super::result::{OrderOutcome, OrderTerminal, ProtectionStatus};
use crate::domain::{InstrumentRules, OrderRole, OrderSpec, OrderType, ProtectionUpdate, Side, TakeProfit};
use crate::error::RiskonError;
use crate::planner::{resolve_targets, TargetOrder, TargetPlan};

pub struct ProtectionRequest<'a> {
    pub trade_id: Uuid,
    pub owner: &'a str,
    pub symbol: &'a str,
    pub side: Side,
    pub stop: Decimal,
    /// Realized average entry
    pub avg_entry: Decimal,
    /// Position size the targets must cover
    pub qty: Decimal,
    pub take_profit: Option<&'a TakeProfit>,
    pub rules: &'a InstrumentRules,
    /// Bumped each time ladder targets are re-placed
    pub revision: u32,
}

#[derive(Debug, Clone)]
pub struct ProtectionReport {
    pub status: ProtectionStatus,
    pub targets: Vec<TargetOrder>,
    /// One per ladder target order attempted
    pub outcomes: Vec<OrderOutcome>,
    pub stop_error: Option<String>,
}

impl ProtectionReport {
    fn stop_failed(e: &RiskonError) -> Self {
        Self {
            status: ProtectionStatus::Failed,
            targets: Vec::new(),
            outcomes: Vec::new(),
            stop_error: Some(e.to_string()),
        }
    }

    pub fn stop_attached(&self) -> bool {
        self.stop_error.is_none()
    }

    /// Live target order ids with their level
    pub fn target_orders(&self) -> Vec<(TargetOrder, String)> {
        self.targets
            .iter()
            .filter_map(|t| {
                self.outcomes
                    .iter()
                    .find(|o| {
                        matches!(o.role, OrderRole::TakeProfit { index, .. } if index == t.index)
                            && o.status == OrderTerminal::Resting
                    })
                    .and_then(|o| o.order_id.clone())
                    .map(|id| (t.clone(), id))
            })
            .collect()
    }
}

/// Stop (plus a single target) goes on the position; ladder targets become
/// reduce-only limit orders. A stop failure stops here and is left to the
/// caller to unwind.
pub async fn attach(gateway: &OrderGateway, req: &ProtectionRequest<'_>) -> ProtectionReport {
    let plan = resolve_targets(req.take_profit, req.side, req.avg_entry, req.stop, req.qty, req.rules);

    let update = ProtectionUpdate {
        owner: req.owner.to_string(),
        symbol: req.symbol.to_string(),
        stop: Some(req.stop),
        take_profit: plan.position_target(),
    };
    if let Err(e) = gateway.set_protection(&update).await {
        warn!(trade_id = %req.trade_id, owner = req.owner, symbol = req.symbol, "Stop attach failed: {}", e);
        return ProtectionReport::stop_failed(&e);
    }
    info!(trade_id = %req.trade_id, owner = req.owner, symbol = req.symbol, "Stop {} attached for {}", req.stop, req.qty);

    let mut status = ProtectionStatus::Attached;
    let mut outcomes = Vec::new();

    if let TargetPlan::Orders(levels) = &plan {
        if levels.is_empty() {
            warn!(trade_id = %req.trade_id, "No take-profit level is placeable for {}", req.qty);
            status = ProtectionStatus::StopOnly;
        }
        for target in levels {
            let outcome = place_target(gateway, req, target).await;
            if outcome.status == OrderTerminal::Failed {
                status = ProtectionStatus::StopOnly;
            }
            outcomes.push(outcome);
        }
    }

    ProtectionReport {
        status,
        targets: plan.orders(),
        outcomes,
        stop_error: None,
    }
}

/// Move the stop of an already protected position. The position-level
/// target and any target orders stay as they are.
pub async fn move_stop(
    gateway: &OrderGateway,
    trade_id: Uuid,
    owner: &str,
    symbol: &str,
    stop: Decimal,
) -> ProtectionReport {
    let update = ProtectionUpdate {
        owner: owner.to_string(),
        symbol: symbol.to_string(),
        stop: Some(stop),
        take_profit: None,
    };
    if let Err(e) = gateway.set_protection(&update).await {
        warn!(trade_id = %trade_id, owner, symbol, "Stop move to {} failed: {}", stop, e);
        return ProtectionReport::stop_failed(&e);
    }
    info!(trade_id = %trade_id, owner, symbol, "Stop moved to {}", stop);

    ProtectionReport {
        status: ProtectionStatus::Attached,
        targets: Vec::new(),
        outcomes: Vec::new(),
        stop_error: None,
    }
}

async fn place_target(gateway: &OrderGateway, req: &ProtectionRequest<'_>, target: &TargetOrder) -> OrderOutcome {
    let role = OrderRole::TakeProfit {
        index: target.index,
        revision: req.revision,
    };
    let spec = OrderSpec {
        owner: req.owner.to_string(),
        symbol: req.symbol.to_string(),
        side: req.side.exit_order_side(),
        order_type: OrderType::Limit,
        qty: target.qty,
        price: Some(target.price),
        trigger_price: None,
        key: order_key(req.trade_id, role),
        role,
        reduce_only: true,
    };

    let (order_id, status, error) = match gateway.submit(&spec).await {
        Ok(id) => (Some(id), OrderTerminal::Resting, None),
        Err(e) => {
            warn!(trade_id = %req.trade_id, key = %spec.key, "Take-profit {} failed: {}", target.index, e);
            (None, OrderTerminal::Failed, Some(e.to_string()))
        }
    };

    OrderOutcome {
        key: spec.key,
        role,
        order_id,
        side: spec.side,
        order_type: spec.order_type,
        qty: spec.qty,
        price: spec.price,
        status,
        filled_qty: Decimal::ZERO,
        avg_price: None,
        error,
    }
}
