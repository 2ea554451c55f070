pub mod cli;
pub mod config;
pub mod coordination;
pub mod desk;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod logging;
pub mod monitor;
pub mod planner;
pub mod risk;

pub use config::AppConfig;
pub use coordination::{InMemoryLockStore, LockStore};
pub use desk::{DeskRuntime, TradeDesk};
pub use domain::{Side, TradeIntent};
pub use error::{Result, RiskonError, ValidationError};
pub use exchange::{ExchangeClient, PaperExchange};
pub use execution::{ExecutionCoordinator, ExecutionPhase, ExecutionResult, ProtectionStatus};
pub use monitor::{
    ClosedTrade, EvGate, EvRecord, GateStatus, PositionLifecycleMonitor, PositionSnapshot, PostStopRecord,
    TradeOutcome,
};
pub use planner::{Ladder, LadderPlanner};
pub use risk::RiskCalculator;
