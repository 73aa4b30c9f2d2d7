//! Rewards accrual: checkpoint rates, cluster lifecycle, upkeep

pub mod checkpoint;
pub mod engine;

pub use checkpoint::Checkpoint;
pub use engine::{
    Cluster, ClusterExitDue, ClusterMember, ClusterState, ExitReport, RewardsEngine, RewardsError,
    RewardsSnapshot, UpkeepPlan, UpkeepReport, UpkeepSkip, VaultAccrual,
};
