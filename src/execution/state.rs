use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, RiskonError};

/// Per-trade execution phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionPhase {
    /// Ladder planned and validated, nothing touched yet
    Validated,
    /// Owner lock held
    LockAcquired,
    /// Entry orders being placed
    Submitting,
    /// Waiting on market fills
    AwaitingFill,
    /// Attaching stop-loss / take-profit
    Protecting,
    Completed,
    /// Live exposure was unwound after a failure
    RolledBack,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Validated => "VALIDATED",
            ExecutionPhase::LockAcquired => "LOCK_ACQUIRED",
            ExecutionPhase::Submitting => "SUBMITTING",
            ExecutionPhase::AwaitingFill => "AWAITING_FILL",
            ExecutionPhase::Protecting => "PROTECTING",
            ExecutionPhase::Completed => "COMPLETED",
            ExecutionPhase::RolledBack => "ROLLED_BACK",
            ExecutionPhase::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, target: ExecutionPhase) -> bool {
        use ExecutionPhase::*;

        match (self, target) {
            (Validated, LockAcquired) => true,
            (Validated, Failed) => true, // Contention or cancelled

            (LockAcquired, Submitting) => true,
            (LockAcquired, Failed) => true, // Cancelled before any order

            (Submitting, AwaitingFill) => true,
            (Submitting, RolledBack) => true,
            (Submitting, Failed) => true,

            (AwaitingFill, Protecting) => true,
            (AwaitingFill, RolledBack) => true,
            (AwaitingFill, Failed) => true,

            (Protecting, Completed) => true,
            (Protecting, RolledBack) => true,
            (Protecting, Failed) => true, // Rollback itself failed

            _ => false,
        }
    }

    pub fn valid_transitions(&self) -> Vec<ExecutionPhase> {
        use ExecutionPhase::*;

        match self {
            Validated => vec![LockAcquired, Failed],
            LockAcquired => vec![Submitting, Failed],
            Submitting => vec![AwaitingFill, RolledBack, Failed],
            AwaitingFill => vec![Protecting, RolledBack, Failed],
            Protecting => vec![Completed, RolledBack, Failed],
            Completed | RolledBack | Failed => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed | ExecutionPhase::RolledBack | ExecutionPhase::Failed
        )
    }

    /// Orders may be live on the exchange in this phase
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Submitting | ExecutionPhase::AwaitingFill | ExecutionPhase::Protecting
        )
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExecutionPhase {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "VALIDATED" => Ok(ExecutionPhase::Validated),
            "LOCK_ACQUIRED" => Ok(ExecutionPhase::LockAcquired),
            "SUBMITTING" => Ok(ExecutionPhase::Submitting),
            "AWAITING_FILL" => Ok(ExecutionPhase::AwaitingFill),
            "PROTECTING" => Ok(ExecutionPhase::Protecting),
            "COMPLETED" => Ok(ExecutionPhase::Completed),
            "ROLLED_BACK" => Ok(ExecutionPhase::RolledBack),
            "FAILED" => Ok(ExecutionPhase::Failed),
            _ => Err(format!("Unknown execution phase: {}", s)),
        }
    }
}

/// Recorded phase change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: ExecutionPhase,
    pub to: ExecutionPhase,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl PhaseTransition {
    pub fn new(from: ExecutionPhase, to: ExecutionPhase, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// State machine instance owned by the execution processing one trade id
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    phase: ExecutionPhase,
    /// Exchange ids of every order placed, in order
    pub attempted: Vec<String>,
    transitions: Vec<PhaseTransition>,
}

impl ExecutionState {
    pub fn new(trade_id: Uuid, owner: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            trade_id,
            owner: owner.into(),
            symbol: symbol.into(),
            phase: ExecutionPhase::Validated,
            attempted: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn advance(&mut self, to: ExecutionPhase, reason: impl Into<String>) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(RiskonError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        let transition = PhaseTransition::new(self.phase, to, reason);
        tracing::debug!(
            trade_id = %self.trade_id,
            owner = %self.owner,
            "{} -> {} ({})",
            transition.from,
            transition.to,
            transition.reason
        );
        self.phase = to;
        self.transitions.push(transition);
        Ok(())
    }
}
