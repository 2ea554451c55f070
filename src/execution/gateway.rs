//! The one place that talks to the exchange's order endpoints.
//!
//! Every submission goes through [`OrderGateway::submit`], which owns the
//! retry budget and the duplicate-key recovery.

use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::idempotency::order_key;
use crate::config::ExecutionConfig;
use crate::domain::{OrderRole, OrderSnapshot, OrderSpec, OrderStatus, OrderType, ProtectionUpdate, Side};
use crate::error::{RejectReason, Result, RiskonError};
use crate::exchange::ExchangeClient;

/// How waiting on a market fill ended
#[derive(Debug, Clone, PartialEq)]
pub enum FillWait {
    Filled(OrderSnapshot),
    /// Exchange ended the order without a complete fill
    Terminated(OrderSnapshot),
    /// Timed out; a cancel was attempted. Carries the last known state.
    TimedOut {
        snapshot: Option<OrderSnapshot>,
        elapsed_ms: u64,
    },
}

pub struct OrderGateway {
    exchange: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
}

impl OrderGateway {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: ExecutionConfig) -> Self {
        Self { exchange, config }
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u8 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    attempt += 1;
                    warn!("{} attempt {} failed: {}. Retrying in {:?}", what, attempt, e, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Place an order. A retry that lands on an already-accepted key resolves
    /// to the existing order instead of failing.
    pub async fn submit(&self, spec: &OrderSpec) -> Result<String> {
        let result = self
            .with_retry("Order submit", || self.exchange.place_order(spec))
            .await;

        match result {
            Ok(order_id) => {
                debug!(key = %spec.key, owner = %spec.owner, "Order {} accepted: {} {} {}", order_id, spec.role, spec.side, spec.qty);
                Ok(order_id)
            }
            Err(RiskonError::ExchangeRejected {
                reason: RejectReason::DuplicateKey,
                message,
            }) => {
                let existing = self
                    .with_retry("Order lookup", || {
                        self.exchange.find_order_by_key(&spec.owner, &spec.key)
                    })
                    .await?;
                match existing {
                    Some(snapshot) => {
                        info!(key = %spec.key, "Duplicate key resolved to existing order {}", snapshot.order_id);
                        Ok(snapshot.order_id)
                    }
                    None => Err(RiskonError::rejected(RejectReason::DuplicateKey, message)),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn snapshot(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.with_retry("Order status", || self.exchange.get_order(order_id))
            .await
    }

    /// Poll until the order is completely filled with a real average price,
    /// bounded by the fill timeout. Timing out cancels the order.
    pub async fn await_fill(&self, order_id: &str) -> FillWait {
        let start = Instant::now();
        let fill_timeout = self.config.fill_timeout();

        match timeout(fill_timeout, self.poll_fill(order_id)).await {
            Ok(wait) => wait,
            Err(_) => {
                warn!("Order {} not filled within {:?}, cancelling", order_id, fill_timeout);
                if let Err(e) = self.cancel(order_id).await {
                    warn!("Cancel of timed-out order {} failed: {}", order_id, e);
                }
                let snapshot = self.exchange.get_order(order_id).await.ok();
                FillWait::TimedOut {
                    snapshot,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn poll_fill(&self, order_id: &str) -> FillWait {
        let poll_interval = self.config.poll_interval();
        loop {
            match self.exchange.get_order(order_id).await {
                Ok(snapshot) if snapshot.is_final_fill() => return FillWait::Filled(snapshot),
                Ok(snapshot)
                    if matches!(snapshot.status, OrderStatus::Cancelled | OrderStatus::Rejected) =>
                {
                    return FillWait::Terminated(snapshot)
                }
                Ok(snapshot) if snapshot.status == OrderStatus::Filled => {
                    debug!("Order {} filled but average price not yet reported", order_id);
                }
                Ok(_) => {}
                Err(e) => warn!("Status poll for {} failed: {}", order_id, e),
            }
            sleep(poll_interval).await;
        }
    }

    pub async fn cancel(&self, order_id: &str) -> Result<bool> {
        self.with_retry("Order cancel", || self.exchange.cancel_order(order_id))
            .await
    }

    pub async fn set_protection(&self, update: &ProtectionUpdate) -> Result<()> {
        self.with_retry("Protection update", || self.exchange.set_protection(update))
            .await
    }

    /// Market-close `qty` of a position. Returns the close order id and the
    /// quantity confirmed filled.
    pub async fn panic_close(
        &self,
        trade_id: Uuid,
        owner: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<(String, Decimal)> {
        warn!(trade_id = %trade_id, owner, symbol, "Panic-closing {} {}", qty, side);
        let spec = OrderSpec {
            owner: owner.to_string(),
            symbol: symbol.to_string(),
            side: side.exit_order_side(),
            order_type: OrderType::Market,
            qty,
            price: None,
            trigger_price: None,
            key: order_key(trade_id, OrderRole::Close),
            role: OrderRole::Close,
            reduce_only: true,
        };
        let order_id = self.submit(&spec).await?;

        match self.await_fill(&order_id).await {
            FillWait::Filled(snapshot) => Ok((order_id, snapshot.filled_qty)),
            FillWait::Terminated(snapshot) => Ok((order_id, snapshot.filled_qty)),
            FillWait::TimedOut { snapshot, .. } => {
                let closed = snapshot.map(|s| s.filled_qty).unwrap_or_default();
                Err(RiskonError::Internal(format!(
                    "close order {} confirmed only {} of {}",
                    order_id, closed, qty
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InstrumentRules, OrderSide};
    use crate::exchange::{ExchangeCall, PaperExchange};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn paper() -> Arc<PaperExchange> {
        Arc::new(
            PaperExchange::new()
                .with_instrument(InstrumentRules {
                    symbol: "BTCUSDT".into(),
                    qty_step: dec!(0.001),
                    tick_size: dec!(0.1),
                    min_qty: dec!(0.001),
                    max_qty: dec!(100),
                    min_notional: dec!(5),
                    max_leverage: dec!(100),
                })
                .with_mark("BTCUSDT", dec!(95000)),
        )
    }

    fn market_buy(key: &str) -> OrderSpec {
        OrderSpec {
            owner: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            qty: dec!(0.014),
            price: None,
            trigger_price: None,
            key: key.into(),
            role: OrderRole::Entry { level: 0 },
            reduce_only: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_response_resolves_to_existing_order() {
        let exchange = paper();
        exchange.fail_places_after_accept(1).await;
        let gateway = OrderGateway::new(exchange.clone(), ExecutionConfig::default());

        let order_id = gateway.submit(&market_buy("rk-1")).await.unwrap();

        assert_eq!(exchange.orders().await.len(), 1);
        assert_eq!(exchange.placements().await.len(), 2);
        assert_eq!(exchange.orders().await[0].1.order_id, order_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retries_are_bounded() {
        let exchange = paper();
        exchange.fail_next_places(10).await;
        let gateway = OrderGateway::new(exchange.clone(), ExecutionConfig::default());

        let err = gateway.submit(&market_buy("rk-1")).await.unwrap_err();
        assert!(err.is_retryable());
        // First try plus three retries
        assert_eq!(exchange.placements().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let exchange = paper();
        exchange
            .reject_role(OrderRole::Entry { level: 0 }, RejectReason::InsufficientBalance, "balance too low")
            .await;
        let gateway = OrderGateway::new(exchange.clone(), ExecutionConfig::default());

        let err = gateway.submit(&market_buy("rk-1")).await.unwrap_err();
        assert!(matches!(
            err,
            RiskonError::ExchangeRejected {
                reason: RejectReason::InsufficientBalance,
                ..
            }
        ));
        assert_eq!(exchange.placements().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_avg_price_keeps_polling() {
        let exchange = paper();
        exchange.report_zero_avg_price(3).await;
        let gateway = OrderGateway::new(exchange.clone(), ExecutionConfig::default());

        let order_id = gateway.submit(&market_buy("rk-1")).await.unwrap();
        match gateway.await_fill(&order_id).await {
            FillWait::Filled(snapshot) => assert_eq!(snapshot.avg_price, dec!(95000)),
            other => panic!("unexpected {:?}", other),
        }

        let polls = exchange
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, ExchangeCall::GetOrder { .. }))
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_order() {
        let exchange = paper();
        exchange.hold_market_fills(true).await;
        let config = ExecutionConfig {
            fill_timeout_ms: 2_000,
            ..ExecutionConfig::default()
        };
        let gateway = OrderGateway::new(exchange.clone(), config);

        let order_id = gateway.submit(&market_buy("rk-1")).await.unwrap();
        let start = Instant::now();
        match gateway.await_fill(&order_id).await {
            FillWait::TimedOut { snapshot, .. } => {
                assert_eq!(snapshot.unwrap().status, OrderStatus::Cancelled);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(exchange
            .calls()
            .await
            .contains(&ExchangeCall::CancelOrder { order_id }));
    }
}
