use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::OrderRole;

/// Deterministic client order key for one order of one trade.
///
/// The same trade id and role always produce the same key, so a resubmission
/// after a lost response hits the exchange's duplicate check instead of
/// opening a second order. Exchanges commonly cap client ids at 36 chars.
pub fn order_key(trade_id: Uuid, role: OrderRole) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trade_id.as_bytes());
    hasher.update(role.tag().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("rk-{}", &digest[..32])
}
