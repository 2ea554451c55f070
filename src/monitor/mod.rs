//! Position lifecycle supervision
//!
//! A supervisor task samples each owner's positions on an interval and feeds
//! one task per position. Position tasks attach deferred protection, resync
//! ladder targets, move the stop to breakeven and classify the exit. Closed
//! trades feed the EV gate and, for stop exits, a post-stop analysis.

pub mod breakeven;
pub mod ev;
pub mod outcome;
pub mod post_stop;
mod tracker;

pub use breakeven::{BreakevenInput, BreakevenRule};
pub use ev::{EvBook, EvCommand, EvGate, EvRecord, GateStatus};
pub use outcome::{classify, r_multiple, ClosedTrade, ExitContext, TradeOutcome};
pub use post_stop::{PostStopRecord, StopVerdict};
pub use tracker::PositionSnapshot;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{Result, RiskonError};
use crate::exchange::ExchangeClient;
use crate::execution::{OrderGateway, PositionHandoff};
use crate::risk::RiskCalculator;
use tracker::{Observation, PositionTracker, TrackerContext};

/// Observations queued per position task before the supervisor skips one
const OBSERVATION_BUFFER: usize = 4;
const EVENT_BUFFER: usize = 256;

/// Supervisor statistics
#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub cycles: u64,
    pub positions_tracked: u64,
    pub positions_closed: u64,
    pub read_errors: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

struct TrackedTask {
    trade_id: Uuid,
    symbol: String,
    observations: mpsc::Sender<Observation>,
}

#[derive(Default)]
struct OwnerBook {
    failures: u32,
    skip: u32,
    tasks: Vec<TrackedTask>,
}

/// Exchange call bounded by one supervision interval. An overrun counts as
/// a failed call and is retried on a later cycle.
pub(crate) async fn within_cycle<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RiskonError::Network(format!("no answer within {:?}", limit))),
    }
}

/// Cycles to skip after `failures` consecutive read errors: 0, 1, 3, 7, ... capped
fn backoff_cycles(failures: u32, max: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    (1u32 << (failures - 1).min(16)).saturating_sub(1).min(max)
}

pub struct PositionLifecycleMonitor {
    ctx: Arc<TrackerContext>,
    config: MonitorConfig,
    registry: Arc<DashMap<Uuid, watch::Receiver<PositionSnapshot>>>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<MonitorStats>>,
}

impl PositionLifecycleMonitor {
    /// Returns the monitor and the stream of post-stop analyses
    pub fn new(
        gateway: Arc<OrderGateway>,
        calculator: RiskCalculator,
        config: MonitorConfig,
        ev: mpsc::UnboundedSender<EvCommand>,
    ) -> (Self, mpsc::UnboundedReceiver<PostStopRecord>) {
        let (post_stop, post_stop_rx) = mpsc::unbounded_channel();
        let (closed, _) = broadcast::channel(EVENT_BUFFER);
        let (snapshots, _) = broadcast::channel(EVENT_BUFFER);
        let ctx = Arc::new(TrackerContext {
            gateway,
            calculator,
            breakeven: BreakevenRule::new(config.breakeven.clone()),
            config: config.clone(),
            ev,
            closed,
            snapshots,
            post_stop,
        });

        let monitor = Self {
            ctx,
            config,
            registry: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(MonitorStats::default())),
        };
        (monitor, post_stop_rx)
    }

    pub fn subscribe_closed(&self) -> broadcast::Receiver<ClosedTrade> {
        self.ctx.closed.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<PositionSnapshot> {
        self.ctx.snapshots.subscribe()
    }

    pub fn snapshot(&self, trade_id: &Uuid) -> Option<PositionSnapshot> {
        self.registry.get(trade_id).map(|rx| rx.borrow().clone())
    }

    /// Latest snapshot of every supervised position
    pub fn snapshots(&self) -> Vec<PositionSnapshot> {
        let mut all: Vec<PositionSnapshot> = self.registry.iter().map(|rx| rx.borrow().clone()).collect();
        all.sort_by(|a, b| a.owner.cmp(&b.owner).then(a.symbol.cmp(&b.symbol)));
        all
    }

    pub fn tracked_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn stats(&self) -> MonitorStats {
        self.stats.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the supervisor loop. `None` if it is already running.
    pub fn start(
        &self,
        handoffs: mpsc::UnboundedReceiver<PositionHandoff>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Position monitor already running");
            return None;
        }

        info!(
            "Starting position monitor (interval: {}s, max backoff: {} cycles)",
            self.config.interval_secs, self.config.max_backoff_cycles
        );

        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();

        Some(tokio::spawn(Self::supervise(
            ctx, config, registry, running, stats, handoffs, shutdown,
        )))
    }

    /// Ask the loop to exit after the current cycle
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Position monitor stop requested");
    }

    async fn supervise(
        ctx: Arc<TrackerContext>,
        config: MonitorConfig,
        registry: Arc<DashMap<Uuid, watch::Receiver<PositionSnapshot>>>,
        running: Arc<AtomicBool>,
        stats: Arc<RwLock<MonitorStats>>,
        mut handoffs: mpsc::UnboundedReceiver<PositionHandoff>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut owners: HashMap<String, OwnerBook> = HashMap::new();
        let mut handoffs_open = true;

        loop {
            tokio::select! {
                handoff = handoffs.recv(), if handoffs_open => match handoff {
                    Some(handoff) => {
                        let owner = handoff.owner.clone();
                        let task = Self::spawn_tracker(&ctx, &registry, handoff);
                        owners.entry(owner).or_default().tasks.push(task);
                        stats.write().await.positions_tracked += 1;
                    }
                    None => {
                        debug!("Handoff channel closed");
                        handoffs_open = false;
                    }
                },
                _ = interval.tick() => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    Self::run_cycle(ctx.gateway.exchange().as_ref(), &config, &mut owners, &registry, &stats).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        running.store(false, Ordering::SeqCst);
        info!("Position monitor stopped ({} positions left unsupervised)", registry.len());
    }

    fn spawn_tracker(
        ctx: &Arc<TrackerContext>,
        registry: &DashMap<Uuid, watch::Receiver<PositionSnapshot>>,
        handoff: PositionHandoff,
    ) -> TrackedTask {
        let (observations, rx) = mpsc::channel(OBSERVATION_BUFFER);
        let trade_id = handoff.trade_id;
        let symbol = handoff.symbol.clone();
        info!(trade_id = %trade_id, owner = %handoff.owner, symbol = %symbol, "Supervising position");

        let (tracker, snapshot) = PositionTracker::new(ctx.clone(), handoff);
        registry.insert(trade_id, snapshot);
        tokio::spawn(tracker.run(rx));

        TrackedTask {
            trade_id,
            symbol,
            observations,
        }
    }

    async fn run_cycle(
        exchange: &dyn ExchangeClient,
        config: &MonitorConfig,
        owners: &mut HashMap<String, OwnerBook>,
        registry: &DashMap<Uuid, watch::Receiver<PositionSnapshot>>,
        stats: &RwLock<MonitorStats>,
    ) {
        let mut errors = 0u64;
        let mut closed = 0u64;

        for (owner, book) in owners.iter_mut() {
            if book.skip > 0 {
                book.skip -= 1;
                debug!(owner = %owner, "Backing off position read ({} cycles left)", book.skip);
                continue;
            }

            let positions = match within_cycle(config.interval(), exchange.get_positions(owner)).await {
                Ok(positions) => positions,
                Err(e) => {
                    errors += 1;
                    book.failures += 1;
                    book.skip = backoff_cycles(book.failures, config.max_backoff_cycles);
                    warn!(
                        owner = %owner,
                        "Position read failed ({} in a row, skipping {} cycles): {}",
                        book.failures,
                        book.skip,
                        e
                    );
                    continue;
                }
            };
            book.failures = 0;

            book.tasks.retain(|task| {
                let observation = positions
                    .iter()
                    .find(|p| p.symbol == task.symbol && p.is_open())
                    .cloned()
                    .map(Observation::Open)
                    .unwrap_or(Observation::Flat);

                match task.observations.try_send(observation) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!(trade_id = %task.trade_id, "Position task busy, observation skipped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        registry.remove(&task.trade_id);
                        closed += 1;
                        false
                    }
                }
            });
        }
        owners.retain(|_, book| !book.tasks.is_empty());

        let mut stats = stats.write().await;
        stats.cycles += 1;
        stats.read_errors += errors;
        stats.positions_closed += closed;
        stats.last_cycle = Some(Utc::now());
    }
}
