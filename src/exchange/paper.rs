//! In-memory exchange used for dry runs and deterministic replay in tests
//!
//! Market orders fill at the mark, limits rest until the mark crosses them,
//! position-level stops/targets trigger on mark updates. Failures can be
//! injected per call type and every call is recorded.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::ExchangeClient;
use crate::domain::{
    ExitFill, ExitTrigger, InstrumentRules, OrderRole, OrderSide, OrderSnapshot, OrderSpec,
    OrderStatus, OrderType, Position, ProtectionUpdate, Side,
};
use crate::error::{RejectReason, Result, RiskonError};

/// One recorded client call
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeCall {
    InstrumentRules {
        symbol: String,
    },
    PlaceOrder {
        key: String,
        role: OrderRole,
        side: OrderSide,
        order_type: OrderType,
        qty: Decimal,
        reduce_only: bool,
    },
    GetOrder {
        order_id: String,
    },
    FindOrder {
        key: String,
    },
    CancelOrder {
        order_id: String,
    },
    SetProtection {
        symbol: String,
        stop: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    GetPositions {
        owner: String,
    },
    MarkPrice {
        symbol: String,
    },
    LastExit {
        symbol: String,
    },
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// Placement fails before the order is accepted
    place_network: u32,
    /// Order is accepted but the response is lost
    place_network_after_accept: u32,
    rejections: HashMap<OrderRole, (RejectReason, String)>,
    protection_network: u32,
    reject_protection: bool,
    cancel_network: u32,
    position_read_network: u32,
    /// Filled market orders report a zero average price this many times
    zero_avg_polls: u32,
    hold_market_fills: bool,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    seq: u64,
    id: String,
    spec: OrderSpec,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_price: Decimal,
    zero_avg_polls: u32,
}

impl PaperOrder {
    fn snapshot(&self, hide_price: bool) -> OrderSnapshot {
        OrderSnapshot {
            order_id: self.id.clone(),
            key: self.spec.key.clone(),
            status: self.status,
            qty: self.spec.qty,
            filled_qty: self.filled_qty,
            avg_price: if hide_price { Decimal::ZERO } else { self.avg_price },
        }
    }
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: Decimal,
    avg_entry: Decimal,
    stop: Option<Decimal>,
    take_profit: Option<Decimal>,
}

type PositionKey = (String, String);

#[derive(Debug, Default)]
struct PaperBook {
    rules: HashMap<String, InstrumentRules>,
    marks: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
    keys: HashMap<PositionKey, String>,
    positions: HashMap<PositionKey, PaperPosition>,
    exits: HashMap<PositionKey, ExitFill>,
    calls: Vec<ExchangeCall>,
    failures: FailurePlan,
    next_seq: u64,
}

impl PaperBook {
    fn mark(&self, symbol: &str) -> Result<Decimal> {
        self.marks.get(symbol).copied().ok_or_else(|| {
            RiskonError::rejected(RejectReason::InvalidParams, format!("no mark price for {}", symbol))
        })
    }

    /// Apply a fill to the owner's position; returns the quantity actually executed
    fn apply_fill(
        &mut self,
        order: &OrderSpec,
        qty: Decimal,
        price: Decimal,
        trigger: ExitTrigger,
    ) -> Decimal {
        let pos_key = (order.owner.clone(), order.symbol.clone());
        let opening_side = match order.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };

        if !self.positions.contains_key(&pos_key) {
            if order.reduce_only {
                return Decimal::ZERO;
            }
            self.positions.insert(
                pos_key,
                PaperPosition {
                    side: opening_side,
                    size: qty,
                    avg_entry: price,
                    stop: None,
                    take_profit: None,
                },
            );
            return qty;
        }

        let (executed, flat) = match self.positions.get_mut(&pos_key) {
            Some(pos) if pos.side == opening_side && !order.reduce_only => {
                let new_size = pos.size + qty;
                pos.avg_entry = (pos.avg_entry * pos.size + price * qty) / new_size;
                pos.size = new_size;
                (qty, false)
            }
            Some(pos) if pos.side != opening_side => {
                // Opposite side reduces; never flips the position
                let closed = qty.min(pos.size);
                pos.size -= closed;
                (closed, pos.size.is_zero())
            }
            _ => (Decimal::ZERO, false),
        };
        if flat {
            self.close_position(&pos_key, price, executed, trigger, Some(order.key.clone()));
        }
        executed
    }

    fn close_position(
        &mut self,
        pos_key: &PositionKey,
        price: Decimal,
        qty: Decimal,
        trigger: ExitTrigger,
        order_key: Option<String>,
    ) {
        self.positions.remove(pos_key);
        self.exits.insert(
            pos_key.clone(),
            ExitFill {
                price,
                qty,
                trigger,
                order_key,
                at: Utc::now(),
            },
        );
        // Reduce-only orders die with the position
        for order in self.orders.values_mut() {
            if order.spec.reduce_only
                && order.status.is_active()
                && order.spec.owner == pos_key.0
                && order.spec.symbol == pos_key.1
            {
                order.status = OrderStatus::Cancelled;
            }
        }
        debug!(owner = %pos_key.0, symbol = %pos_key.1, "Paper position closed by {:?} @ {}", trigger, price);
    }

    fn fill_order(&mut self, id: &str, price: Decimal) {
        let Some(order) = self.orders.get(id).cloned() else {
            return;
        };
        let remaining = order.spec.qty - order.filled_qty;
        let trigger = match order.spec.role {
            OrderRole::TakeProfit { .. } => ExitTrigger::TakeProfit,
            OrderRole::Stop => ExitTrigger::StopLoss,
            _ => ExitTrigger::Manual,
        };
        let executed = self.apply_fill(&order.spec, remaining, price, trigger);
        let zero_avg_polls = if order.spec.order_type == OrderType::Market {
            self.failures.zero_avg_polls
        } else {
            0
        };

        if let Some(order) = self.orders.get_mut(id) {
            if executed.is_zero() {
                order.status = OrderStatus::Cancelled;
                return;
            }
            order.avg_price = (order.avg_price * order.filled_qty + price * executed)
                / (order.filled_qty + executed);
            order.filled_qty += executed;
            order.status = OrderStatus::Filled;
            order.zero_avg_polls = zero_avg_polls;
        }
    }

    /// Run triggers, resting limits and position protection against the mark
    fn match_symbol(&mut self, symbol: &str) {
        let Some(mark) = self.marks.get(symbol).copied() else {
            return;
        };

        let mut ids: Vec<(u64, String)> = self
            .orders
            .values()
            .filter(|o| o.spec.symbol == symbol && o.status.is_active())
            .map(|o| (o.seq, o.id.clone()))
            .collect();
        ids.sort();

        for (_, id) in ids {
            let Some(order) = self.orders.get(&id).cloned() else {
                continue;
            };
            if !order.status.is_active() {
                continue;
            }

            if order.status == OrderStatus::Untriggered {
                let triggered = match (order.spec.side, order.spec.trigger_price) {
                    (OrderSide::Buy, Some(t)) => mark <= t,
                    (OrderSide::Sell, Some(t)) => mark >= t,
                    (_, None) => true,
                };
                if !triggered {
                    continue;
                }
                if let Some(o) = self.orders.get_mut(&id) {
                    o.status = OrderStatus::New;
                }
            }

            if order.spec.order_type != OrderType::Limit {
                continue;
            }
            let Some(price) = order.spec.price else {
                continue;
            };
            let crosses = match order.spec.side {
                OrderSide::Buy => mark <= price,
                OrderSide::Sell => mark >= price,
            };
            if crosses {
                self.fill_order(&id, price);
            }
        }

        let hits: Vec<(PositionKey, Decimal, ExitTrigger, Decimal)> = self
            .positions
            .iter()
            .filter(|(k, _)| k.1 == symbol)
            .filter_map(|(k, p)| {
                let stop_hit = p.stop.filter(|s| match p.side {
                    Side::Long => mark <= *s,
                    Side::Short => mark >= *s,
                });
                let target_hit = p.take_profit.filter(|t| match p.side {
                    Side::Long => mark >= *t,
                    Side::Short => mark <= *t,
                });
                stop_hit
                    .map(|s| (k.clone(), s, ExitTrigger::StopLoss, p.size))
                    .or_else(|| target_hit.map(|t| (k.clone(), t, ExitTrigger::TakeProfit, p.size)))
            })
            .collect();

        for (pos_key, price, trigger, size) in hits {
            self.close_position(&pos_key, price, size, trigger, None);
        }
    }
}

/// In-memory `ExchangeClient`
#[derive(Debug, Default)]
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    latency_ms: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(mut self, rules: InstrumentRules) -> Self {
        self.book.get_mut().rules.insert(rules.symbol.clone(), rules);
        self
    }

    pub fn with_mark(mut self, symbol: &str, price: Decimal) -> Self {
        self.book.get_mut().marks.insert(symbol.to_string(), price);
        self
    }

    /// Delay applied to every call (respects paused tokio time)
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Move the mark and run matching for the symbol
    pub async fn set_mark(&self, symbol: &str, price: Decimal) {
        let mut book = self.book.lock().await;
        book.marks.insert(symbol.to_string(), price);
        book.match_symbol(symbol);
    }

    pub async fn calls(&self) -> Vec<ExchangeCall> {
        self.book.lock().await.calls.clone()
    }

    /// Placement calls only, in order
    pub async fn placements(&self) -> Vec<ExchangeCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, ExchangeCall::PlaceOrder { .. }))
            .collect()
    }

    /// Orders accepted by the book, in placement order
    pub async fn orders(&self) -> Vec<(OrderSpec, OrderSnapshot)> {
        let book = self.book.lock().await;
        let mut orders: Vec<&PaperOrder> = book.orders.values().collect();
        orders.sort_by_key(|o| o.seq);
        orders
            .into_iter()
            .map(|o| (o.spec.clone(), o.snapshot(false)))
            .collect()
    }

    pub async fn open_orders(&self, owner: &str) -> Vec<OrderSnapshot> {
        self.orders()
            .await
            .into_iter()
            .filter(|(spec, snap)| spec.owner == owner && snap.status.is_active())
            .map(|(_, snap)| snap)
            .collect()
    }

    pub async fn position(&self, owner: &str, symbol: &str) -> Option<Position> {
        let book = self.book.lock().await;
        let mark = book.marks.get(symbol).copied().unwrap_or_default();
        book.positions
            .get(&(owner.to_string(), symbol.to_string()))
            .map(|p| to_position(owner, symbol, p, mark))
    }

    /// Open a position directly, as if filled earlier
    pub async fn seed_position(&self, owner: &str, symbol: &str, side: Side, size: Decimal, avg_entry: Decimal) {
        let mut book = self.book.lock().await;
        book.positions.insert(
            (owner.to_string(), symbol.to_string()),
            PaperPosition {
                side,
                size,
                avg_entry,
                stop: None,
                take_profit: None,
            },
        );
    }

    // ---- failure injection -------------------------------------------------

    pub async fn fail_next_places(&self, n: u32) {
        self.book.lock().await.failures.place_network = n;
    }

    pub async fn fail_places_after_accept(&self, n: u32) {
        self.book.lock().await.failures.place_network_after_accept = n;
    }

    pub async fn reject_role(&self, role: OrderRole, reason: RejectReason, message: &str) {
        self.book
            .lock()
            .await
            .failures
            .rejections
            .insert(role, (reason, message.to_string()));
    }

    pub async fn fail_protection(&self, n: u32) {
        self.book.lock().await.failures.protection_network = n;
    }

    pub async fn fail_cancels(&self, n: u32) {
        self.book.lock().await.failures.cancel_network = n;
    }

    pub async fn reject_protection(&self, reject: bool) {
        self.book.lock().await.failures.reject_protection = reject;
    }

    pub async fn fail_position_reads(&self, n: u32) {
        self.book.lock().await.failures.position_read_network = n;
    }

    pub async fn report_zero_avg_price(&self, polls: u32) {
        self.book.lock().await.failures.zero_avg_polls = polls;
    }

    pub async fn hold_market_fills(&self, hold: bool) {
        self.book.lock().await.failures.hold_market_fills = hold;
    }
}

fn to_position(owner: &str, symbol: &str, p: &PaperPosition, mark: Decimal) -> Position {
    Position {
        owner: owner.to_string(),
        symbol: symbol.to_string(),
        side: p.side,
        size: p.size,
        avg_entry: p.avg_entry,
        stop: p.stop,
        take_profit: p.take_profit,
        unrealized_pnl: p.side.favorable_move(p.avg_entry, mark) * p.size,
        liq_price: None,
        mark_price: mark,
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::InstrumentRules {
            symbol: symbol.to_string(),
        });
        book.rules.get(symbol).cloned().ok_or_else(|| {
            RiskonError::rejected(RejectReason::InvalidParams, format!("unknown symbol {}", symbol))
        })
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<String> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::PlaceOrder {
            key: spec.key.clone(),
            role: spec.role,
            side: spec.side,
            order_type: spec.order_type,
            qty: spec.qty,
            reduce_only: spec.reduce_only,
        });

        if book.failures.place_network > 0 {
            book.failures.place_network -= 1;
            return Err(RiskonError::Network("connection reset before ack".into()));
        }
        if let Some((reason, message)) = book.failures.rejections.remove(&spec.role) {
            return Err(RiskonError::rejected(reason, message));
        }

        let key = (spec.owner.clone(), spec.key.clone());
        if book.keys.contains_key(&key) {
            return Err(RiskonError::rejected(
                RejectReason::DuplicateKey,
                format!("order key {} already used", spec.key),
            ));
        }
        if spec.qty <= Decimal::ZERO {
            return Err(RiskonError::rejected(RejectReason::InvalidParams, "qty must be positive"));
        }
        if !book.rules.contains_key(&spec.symbol) {
            return Err(RiskonError::rejected(
                RejectReason::InvalidParams,
                format!("unknown symbol {}", spec.symbol),
            ));
        }
        let mark = book.mark(&spec.symbol)?;
        if spec.order_type == OrderType::Limit && spec.price.is_none() {
            return Err(RiskonError::rejected(RejectReason::InvalidParams, "limit order without price"));
        }
        if spec.reduce_only && !book.positions.contains_key(&(spec.owner.clone(), spec.symbol.clone())) {
            return Err(RiskonError::rejected(
                RejectReason::InvalidParams,
                "reduce-only order without an open position",
            ));
        }

        book.next_seq += 1;
        let seq = book.next_seq;
        let id = format!("paper-{}", seq);
        let status = if spec.trigger_price.is_some() {
            OrderStatus::Untriggered
        } else {
            OrderStatus::New
        };
        book.orders.insert(
            id.clone(),
            PaperOrder {
                seq,
                id: id.clone(),
                spec: spec.clone(),
                status,
                filled_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                zero_avg_polls: 0,
            },
        );
        book.keys.insert(key, id.clone());

        match spec.order_type {
            OrderType::Market if !book.failures.hold_market_fills => book.fill_order(&id, mark),
            OrderType::Market => {}
            OrderType::Limit => book.match_symbol(&spec.symbol),
        }

        if book.failures.place_network_after_accept > 0 {
            book.failures.place_network_after_accept -= 1;
            return Err(RiskonError::Network("response lost after ack".into()));
        }
        Ok(id)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::GetOrder {
            order_id: order_id.to_string(),
        });
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| RiskonError::OrderNotFound(order_id.to_string()))?;

        let hide_price = order.status == OrderStatus::Filled && order.zero_avg_polls > 0;
        if hide_price {
            order.zero_avg_polls -= 1;
        }
        Ok(order.snapshot(hide_price))
    }

    async fn find_order_by_key(&self, owner: &str, key: &str) -> Result<Option<OrderSnapshot>> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::FindOrder {
            key: key.to_string(),
        });
        let found = book
            .keys
            .get(&(owner.to_string(), key.to_string()))
            .and_then(|id| book.orders.get(id))
            .map(|o| o.snapshot(false));
        Ok(found)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::CancelOrder {
            order_id: order_id.to_string(),
        });
        if book.failures.cancel_network > 0 {
            book.failures.cancel_network -= 1;
            return Err(RiskonError::Network("timeout cancelling order".into()));
        }
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| RiskonError::OrderNotFound(order_id.to_string()))?;
        if order.status.is_active() {
            order.status = OrderStatus::Cancelled;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_protection(&self, update: &ProtectionUpdate) -> Result<()> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::SetProtection {
            symbol: update.symbol.clone(),
            stop: update.stop,
            take_profit: update.take_profit,
        });

        if book.failures.protection_network > 0 {
            book.failures.protection_network -= 1;
            return Err(RiskonError::Network("timeout setting trading stop".into()));
        }
        if book.failures.reject_protection {
            return Err(RiskonError::rejected(RejectReason::Rejected, "trading stop rejected"));
        }

        let mark = book.mark(&update.symbol)?;
        let pos_key = (update.owner.clone(), update.symbol.clone());
        let Some(position) = book.positions.get_mut(&pos_key) else {
            return Err(RiskonError::rejected(RejectReason::InvalidParams, "no open position"));
        };

        if let Some(stop) = update.stop {
            if !position.side.stop_is_beyond(mark, stop) {
                return Err(RiskonError::rejected(
                    RejectReason::InvalidParams,
                    format!("stop {} already crossed by mark {}", stop, mark),
                ));
            }
            position.stop = Some(stop);
        }
        if let Some(target) = update.take_profit {
            position.take_profit = Some(target);
        }
        Ok(())
    }

    async fn get_positions(&self, owner: &str) -> Result<Vec<Position>> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::GetPositions {
            owner: owner.to_string(),
        });
        if book.failures.position_read_network > 0 {
            book.failures.position_read_network -= 1;
            return Err(RiskonError::Network("position endpoint unavailable".into()));
        }

        let symbols: HashSet<&String> = book
            .positions
            .keys()
            .filter(|(o, _)| o == owner)
            .map(|(_, s)| s)
            .collect();
        let mut positions: Vec<Position> = symbols
            .into_iter()
            .filter_map(|symbol| {
                let p = book.positions.get(&(owner.to_string(), symbol.clone()))?;
                let mark = book.marks.get(symbol).copied().unwrap_or(p.avg_entry);
                Some(to_position(owner, symbol, p, mark))
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::MarkPrice {
            symbol: symbol.to_string(),
        });
        book.mark(symbol)
    }

    async fn last_exit(&self, owner: &str, symbol: &str) -> Result<Option<ExitFill>> {
        let mut book = self.book.lock().await;
        book.calls.push(ExchangeCall::LastExit {
            symbol: symbol.to_string(),
        });
        Ok(book.exits.get(&(owner.to_string(), symbol.to_string())).cloned())
    }
}
