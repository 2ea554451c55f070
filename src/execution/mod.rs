//! Order execution: locking, idempotent submission, fills, protection, rollback

mod coordinator;
mod gateway;
pub mod idempotency;
pub mod protection;
mod result;
mod state;

pub use coordinator::{ExecutionCoordinator, PositionHandoff};
pub use gateway::{FillWait, OrderGateway};
pub use idempotency::order_key;
pub use protection::{attach, move_stop, ProtectionReport, ProtectionRequest};
pub use result::{ExecutionResult, OrderOutcome, OrderTerminal, ProtectionStatus, RollbackOutcome};
pub use state::{ExecutionPhase, ExecutionState, PhaseTransition};
