//! Platform facade wiring the auction engine, escrow, and rewards engine
//!
//! Construction mints the escrow's two authority tokens and hands each to
//! its engine, so the auction engine is the only path that can move locked
//! collateral and the rewards engine the only path that can spend the pool.
//! The facade adds the vault-layer flow (selection feeding registration)
//! and the serializable whole-platform snapshot.

use crate::auction::{
    AuctionEngine, AuctionError, AuctionSnapshot, SelectedMember, SubmitReceipt, UpdateReceipt,
    WithdrawReceipt,
};
use crate::core::{AuctionConfig, ClusterId, OperatorId, RewardsConfig, Score, UnixTime, VaultId};
use crate::escrow::{Escrow, EscrowSnapshot, VaultPayout};
use crate::rewards::{
    ClusterMember, ExitReport, RewardsEngine, RewardsError, RewardsSnapshot, UpkeepPlan,
    UpkeepReport,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Full platform configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub auction: AuctionConfig,
    pub rewards: RewardsConfig,
}

/// Outcome of a vault's cluster request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterGrant {
    pub cluster: ClusterId,
    /// Winning slots in selection order
    pub members: Vec<SelectedMember>,
    /// Collateral moved into the reward pool
    pub released_total: u64,
}

/// The assembled economic core
pub struct Platform {
    escrow: Escrow,
    auction: AuctionEngine,
    rewards: RewardsEngine,
}

impl Platform {
    pub fn new(config: PlatformConfig, genesis_time: UnixTime) -> Self {
        let (escrow, escrow_auth, pool_auth) = Escrow::new();
        let auction = AuctionEngine::new(config.auction, escrow_auth);
        let rewards = RewardsEngine::new(config.rewards, pool_auth, genesis_time);
        info!("platform initialized at {}", genesis_time);
        Self {
            escrow,
            auction,
            rewards,
        }
    }

    pub fn escrow(&self) -> &Escrow {
        &self.escrow
    }

    pub fn auction(&self) -> &AuctionEngine {
        &self.auction
    }

    pub fn rewards(&self) -> &RewardsEngine {
        &self.rewards
    }

    /// Submit a bid for a cluster slot
    pub fn submit_bid(
        &self,
        operator: OperatorId,
        discount_bps: u16,
        duration_days: u64,
        payment: u64,
        now: UnixTime,
    ) -> Result<SubmitReceipt, AuctionError> {
        self.auction
            .submit_bid(&self.escrow, operator, discount_bps, duration_days, payment, now)
    }

    /// Reprice the caller's most recent bid at `old_score`
    pub fn update_bid(
        &self,
        operator: OperatorId,
        old_score: Score,
        discount_bps: u16,
        duration_days: u64,
        payment: u64,
        now: UnixTime,
    ) -> Result<UpdateReceipt, AuctionError> {
        self.auction.update_bid(
            &self.escrow,
            operator,
            old_score,
            discount_bps,
            duration_days,
            payment,
            now,
        )
    }

    /// Withdraw the caller's most recent bid at `score`
    pub fn withdraw_bid(
        &self,
        operator: OperatorId,
        score: Score,
    ) -> Result<WithdrawReceipt, AuctionError> {
        self.auction.withdraw_bid(&self.escrow, operator, score)
    }

    /// Vault-layer flow: select the top `n` bids, release their collateral
    /// into the reward pool, and register the pending cluster
    pub fn request_cluster(
        &self,
        vault: VaultId,
        n: usize,
        now: UnixTime,
    ) -> Result<ClusterGrant, PlatformError> {
        let receipt = self.auction.select_cluster(&self.escrow, n)?;
        let members: Vec<ClusterMember> = receipt
            .members
            .iter()
            .map(|member| ClusterMember {
                operator: member.operator,
                credits: member.credits,
            })
            .collect();
        let cluster = self
            .rewards
            .register_cluster(&self.escrow, vault, members, now)?;
        Ok(ClusterGrant {
            cluster,
            members: receipt.members,
            released_total: receipt.released_total,
        })
    }

    /// Activate a registered cluster
    pub fn activate_cluster(&self, cluster: ClusterId, now: UnixTime) -> Result<(), RewardsError> {
        self.rewards.activate_cluster(cluster, now)
    }

    /// Pay a vault its accrued rewards
    pub fn claim(&self, vault: VaultId, now: UnixTime) -> Result<VaultPayout, RewardsError> {
        self.rewards.claim(&self.escrow, vault, now)
    }

    /// Check whether maintenance should run
    pub fn check_upkeep(&self, now: UnixTime) -> Result<UpkeepPlan, RewardsError> {
        self.rewards.check_upkeep(now)
    }

    /// Run maintenance
    pub fn perform_upkeep(&self, now: UnixTime) -> Result<UpkeepReport, RewardsError> {
        self.rewards.perform_upkeep(&self.escrow, now)
    }

    /// Retire a cluster ahead of its runway
    pub fn force_exit(&self, cluster: ClusterId, now: UnixTime) -> Result<ExitReport, RewardsError> {
        self.rewards.force_exit(&self.escrow, cluster, now)
    }

    /// Capture the whole platform state
    pub fn snapshot(&self) -> PlatformSnapshot {
        PlatformSnapshot {
            escrow: self.escrow.snapshot(),
            auction: self.auction.snapshot(),
            rewards: self.rewards.snapshot(),
        }
    }

    /// Rebuild a platform from a snapshot, minting fresh authority tokens
    pub fn restore(config: PlatformConfig, snapshot: PlatformSnapshot) -> Self {
        let (escrow, escrow_auth, pool_auth) = Escrow::restore(snapshot.escrow);
        let auction = AuctionEngine::restore(config.auction, escrow_auth, snapshot.auction);
        let rewards = RewardsEngine::restore(config.rewards, pool_auth, snapshot.rewards);
        Self {
            escrow,
            auction,
            rewards,
        }
    }
}

/// Serializable whole-platform state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub escrow: EscrowSnapshot,
    pub auction: AuctionSnapshot,
    pub rewards: RewardsSnapshot,
}

impl PlatformSnapshot {
    /// Serialize for persistence
    pub fn pack(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Deserialize from persisted bytes
    pub fn unpack(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// Errors surfaced by the platform facade
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error(transparent)]
    Auction(#[from] AuctionError),

    #[error(transparent)]
    Rewards(#[from] RewardsError),
}
