use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::state::{ExecutionPhase, PhaseTransition};
use crate::domain::{OrderRole, OrderSide, OrderSnapshot, OrderSpec, OrderStatus, OrderType, Side};
use crate::planner::TargetOrder;

/// Terminal status of one intended order, as far as this execution knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTerminal {
    Filled,
    /// Accepted and live on the book (limit entries, ladder targets)
    Resting,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub key: String,
    pub role: OrderRole,
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderTerminal,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub error: Option<String>,
}

impl OrderOutcome {
    pub fn new(spec: &OrderSpec, order_id: Option<String>, status: OrderTerminal, error: Option<String>) -> Self {
        Self {
            key: spec.key.clone(),
            role: spec.role,
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

    /// Take fill progress and status from an exchange snapshot
    pub fn absorb(&mut self, snapshot: &OrderSnapshot) {
        self.filled_qty = snapshot.filled_qty;
        if snapshot.avg_price > Decimal::ZERO {
            self.avg_price = Some(snapshot.avg_price);
        }
        self.status = match snapshot.status {
            OrderStatus::Filled => OrderTerminal::Filled,
            OrderStatus::Cancelled => OrderTerminal::Cancelled,
            OrderStatus::Rejected => OrderTerminal::Failed,
            OrderStatus::Untriggered | OrderStatus::New | OrderStatus::PartiallyFilled => {
                OrderTerminal::Resting
            }
        };
    }

    pub fn is_live(&self) -> bool {
        self.status == OrderTerminal::Resting && self.order_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionStatus {
    NotAttempted,
    /// Stop and every requested target are live
    Attached,
    /// Stop live, some take-profit orders failed
    StopOnly,
    /// Nothing filled yet; the monitor attaches on first fill
    Deferred,
    Failed,
}

/// What a panic-close did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub close_order_id: Option<String>,
    pub closed_qty: Decimal,
    /// Order ids cancelled during the unwind
    pub cancelled: Vec<String>,
    pub error: Option<String>,
}

impl RollbackOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.close_order_id, &self.error) {
            (_, Some(err)) => write!(f, "close of {} failed: {}", self.closed_qty, err),
            (Some(id), None) => write!(
                f,
                "closed {} via {}, cancelled {} order(s)",
                self.closed_qty,
                id,
                self.cancelled.len()
            ),
            (None, None) => write!(f, "nothing to close, cancelled {} order(s)", self.cancelled.len()),
        }
    }
}

/// Report of one execution, produced on success and attached to every
/// post-side-effect failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: Side,
    pub status: ExecutionPhase,
    pub filled_qty: Decimal,
    /// Realized average over filled entries
    pub avg_price: Option<Decimal>,
    /// Loss at the stop for the filled quantity
    pub actual_risk_usd: Decimal,
    pub actual_rr: Option<Decimal>,
    pub order_ids: Vec<String>,
    pub orders: Vec<OrderOutcome>,
    pub protection_status: ProtectionStatus,
    pub stop_price: Decimal,
    pub targets: Vec<TargetOrder>,
    pub rollback: Option<RollbackOutcome>,
    pub transitions: Vec<PhaseTransition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn entries(&self) -> impl Iterator<Item = &OrderOutcome> {
        self.orders.iter().filter(|o| o.role.is_entry())
    }

    /// Entry quantity still resting on the book
    pub fn resting_qty(&self) -> Decimal {
        self.entries()
            .filter(|o| o.status == OrderTerminal::Resting)
            .map(|o| o.qty - o.filled_qty)
            .sum()
    }

    pub fn outcome(&self, role: OrderRole) -> Option<&OrderOutcome> {
        self.orders.iter().find(|o| o.role == role)
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionPhase::Completed
    }
}
