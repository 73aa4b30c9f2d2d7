//! # Tidepool Economic Core
//!
//! The auction, escrow, and reward-accrual engines behind the Tidepool
//! liquid-restaking platform.
//!
//! ## Core Features
//! - Sealed-bid slot auction over a score-ordered ledger
//! - Duration- and discount-sensitive pricing against a yield benchmark
//! - Escrowed collateral with capability-gated release and refund
//! - Checkpoint-based reward accrual with day-granular settlement
//! - Externally scheduled maintenance with interval and idempotence guards
//! - Whole-platform snapshots for persistence
//!
//! ## Flow
//! 1. Operators lock collateral behind priced, scored bids
//! 2. A vault requests a cluster; the top bids win and their collateral
//!    funds the reward pool
//! 3. Activated clusters accrue at the checkpoint rate until their credits
//!    run out; upkeep retires them and refunds unconsumed value

pub mod core;
pub mod escrow;
pub mod auction;
pub mod rewards;
pub mod platform;

// Re-exports
pub use crate::core::*;
pub use escrow::{
    Escrow, EscrowAuthority, EscrowError, EscrowSnapshot, OperatorPayout, PoolAuthority,
    VaultPayout,
};

// Auction Engine
pub use auction::{
    AuctionEngine, AuctionError, AuctionSnapshot, AuctionStats, Bid, BidLedger, BidQuote,
    BidState, OperatorProfile, ReputationWeightedScore, ScorePolicy, SelectedMember,
    SelectionReceipt, SubmitReceipt, UpdateReceipt, WithdrawReceipt,
};

// Rewards Accrual
pub use rewards::{
    Checkpoint, Cluster, ClusterExitDue, ClusterMember, ClusterState, ExitReport, RewardsEngine,
    RewardsError, RewardsSnapshot, UpkeepPlan, UpkeepReport, UpkeepSkip, VaultAccrual,
};

// Platform Facade
pub use platform::{
    ClusterGrant, Platform, PlatformConfig, PlatformError, PlatformSnapshot,
};

// =============================================================================
// PLATFORM CONFIGURATION
// =============================================================================

/// Tidepool core version
pub const TIDEPOOL_VERSION: &str = "0.4.0";

/// Default operators per cluster
pub const DEFAULT_CLUSTER_SIZE: usize = 4;

// =============================================================================
// CLUSTER LIMITS
// =============================================================================

/// Minimum operators for a viable cluster
pub const MIN_CLUSTER_SIZE: usize = 1;

/// Maximum operators per cluster
pub const MAX_CLUSTER_OPERATORS: usize = 16;
