use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{ExitFill, InstrumentRules, OrderSnapshot, OrderSpec, Position, ProtectionUpdate};
use crate::error::Result;

/// Exchange collaborator consumed by execution and monitoring.
///
/// Failures surface as `RiskonError::ExchangeRejected` (verbatim exchange
/// reason) or `RiskonError::Network` (transient, retryable).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules>;

    /// Returns the exchange order id. A reused client key fails with
    /// `RejectReason::DuplicateKey`.
    async fn place_order(&self, spec: &OrderSpec) -> Result<String>;

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot>;

    async fn find_order_by_key(&self, owner: &str, key: &str) -> Result<Option<OrderSnapshot>>;

    /// `Ok(false)` when the order was already terminal
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    /// Replace position-level stop and/or target; `None` leaves a level unchanged
    async fn set_protection(&self, update: &ProtectionUpdate) -> Result<()>;

    async fn get_positions(&self, owner: &str) -> Result<Vec<Position>>;

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal>;

    /// Closing fill of the most recently closed position, when the venue reports it
    async fn last_exit(&self, _owner: &str, _symbol: &str) -> Result<Option<ExitFill>> {
        Ok(None)
    }
}
