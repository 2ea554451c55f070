pub mod ladder;
pub mod take_profit;

pub use ladder::{Downgrade, Ladder, LadderPlanner, PlannedOrder};
pub use take_profit::{resolve_targets, TargetOrder, TargetPlan};
