//! What price did after a stop-loss fill. Observational only.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::Side;
use crate::exchange::ExchangeClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopVerdict {
    /// Price kept going through the stop
    Justified,
    /// Price came back to the entry; the stop was too tight
    PrematureRecovery,
    /// No usable samples, or price parked between stop and entry
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStopRecord {
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry: Decimal,
    pub stop_price: Decimal,
    pub price_short: Option<Decimal>,
    pub price_long: Option<Decimal>,
    pub verdict: StopVerdict,
    /// Largest move past the stop, % of stop
    pub adverse_move_pct: Decimal,
    /// Largest move back from the stop, % of stop
    pub favorable_move_pct: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Verdict plus adverse / favorable move percentages
pub fn analyze(side: Side, entry: Decimal, stop: Decimal, samples: &[Decimal]) -> (StopVerdict, Decimal, Decimal) {
    if samples.is_empty() || stop <= Decimal::ZERO {
        return (StopVerdict::Inconclusive, Decimal::ZERO, Decimal::ZERO);
    }

    let moves: Vec<Decimal> = samples.iter().map(|p| side.favorable_move(stop, *p)).collect();
    let pct = |v: Decimal| (v / stop * Decimal::ONE_HUNDRED).round_dp(4);
    let adverse = pct(moves.iter().map(|m| -*m).fold(Decimal::ZERO, Decimal::max));
    let favorable = pct(moves.iter().copied().fold(Decimal::ZERO, Decimal::max));

    let recovered = samples.iter().any(|p| side.favorable_move(entry, *p) >= Decimal::ZERO);
    let verdict = if recovered {
        StopVerdict::PrematureRecovery
    } else if moves.iter().any(|m| *m < Decimal::ZERO) {
        StopVerdict::Justified
    } else {
        StopVerdict::Inconclusive
    };
    (verdict, adverse, favorable)
}

pub struct StoppedTrade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry: Decimal,
    pub stop_price: Decimal,
}

/// Sample the mark at both horizons after a stop fill and emit one record
pub fn spawn_watch(
    exchange: Arc<dyn ExchangeClient>,
    trade: StoppedTrade,
    short: Duration,
    long: Duration,
    records: mpsc::UnboundedSender<PostStopRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(short).await;
        let price_short = sample(exchange.as_ref(), &trade.symbol).await;
        tokio::time::sleep(long.saturating_sub(short)).await;
        let price_long = sample(exchange.as_ref(), &trade.symbol).await;

        let samples: Vec<Decimal> = [price_short, price_long].into_iter().flatten().collect();
        let (verdict, adverse_move_pct, favorable_move_pct) =
            analyze(trade.side, trade.entry, trade.stop_price, &samples);

        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            "Post-stop verdict {:?} (adverse {}%, favorable {}%)",
            verdict,
            adverse_move_pct,
            favorable_move_pct
        );

        let record = PostStopRecord {
            trade_id: trade.trade_id,
            symbol: trade.symbol,
            side: trade.side,
            entry: trade.entry,
            stop_price: trade.stop_price,
            price_short,
            price_long,
            verdict,
            adverse_move_pct,
            favorable_move_pct,
            recorded_at: Utc::now(),
        };
        if records.send(record).is_err() {
            warn!("Post-stop record dropped, no receiver");
        }
    })
}

async fn sample(exchange: &dyn ExchangeClient, symbol: &str) -> Option<Decimal> {
    match exchange.get_mark_price(symbol).await {
        Ok(price) => Some(price),
        Err(e) => {
            warn!(symbol, "Post-stop sample failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_continued_adverse_is_justified() {
        let (verdict, adverse, favorable) =
            analyze(Side::Long, dec!(95000), dec!(94300), &[dec!(93800), dec!(93357)]);
        assert_eq!(verdict, StopVerdict::Justified);
        assert_eq!(adverse, dec!(1));
        assert_eq!(favorable, Decimal::ZERO);
    }

    #[test]
    fn test_recovery_to_entry_is_premature() {
        let (verdict, _, favorable) = analyze(Side::Long, dec!(95000), dec!(94300), &[dec!(94100), dec!(95100)]);
        assert_eq!(verdict, StopVerdict::PrematureRecovery);
        assert!(favorable > Decimal::ZERO);

        let (short, _, _) = analyze(Side::Short, dec!(100), dec!(101), &[dec!(99.5)]);
        assert_eq!(short, StopVerdict::PrematureRecovery);
    }

    #[test]
    fn test_inconclusive() {
        assert_eq!(analyze(Side::Long, dec!(95000), dec!(94300), &[]).0, StopVerdict::Inconclusive);
        assert_eq!(
            analyze(Side::Long, dec!(95000), dec!(94300), &[dec!(94500)]).0,
            StopVerdict::Inconclusive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_samples_both_horizons() {
        let exchange = Arc::new(PaperExchange::new().with_mark("BTCUSDT", dec!(94000)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_watch(
            exchange.clone(),
            StoppedTrade {
                trade_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                entry: dec!(95000),
                stop_price: dec!(94300),
            },
            Duration::from_secs(3_600),
            Duration::from_secs(14_400),
            tx,
        );

        tokio::time::sleep(Duration::from_secs(3_601)).await;
        exchange.set_mark("BTCUSDT", dec!(95200)).await;
        handle.await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.price_short, Some(dec!(94000)));
        assert_eq!(record.price_long, Some(dec!(95200)));
        assert_eq!(record.verdict, StopVerdict::PrematureRecovery);
    }
}
