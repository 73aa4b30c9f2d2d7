//! Rewards accrual engine: cluster lifecycle, settlement, claims, upkeep
//!
//! Every activated cluster accrues value at the checkpoint's daily rate
//! until its smallest member balance runs out. Settlement never replays
//! history: each cluster tracks the days already charged against the pool,
//! and every rate change banks the elapsed window at the rate that was in
//! effect before the new rate takes over. Payouts are capped by what the
//! pool can actually cover; the uncovered remainder stays on the books as
//! vault `owed` until the pool can pay it.

use crate::core::{days_between, ClusterId, OperatorId, RewardsConfig, UnixTime, VaultId};
use crate::escrow::{Escrow, EscrowError, PoolAuthority, VaultPayout};
use crate::rewards::checkpoint::Checkpoint;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    /// Registered, not yet accruing
    Pending,
    /// Accruing rewards daily
    Activated,
    /// Retired; members refunded, accrual stopped
    Exited,
}

/// One operator slot inside a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub operator: OperatorId,
    /// Remaining prepaid member-days
    pub credits: u64,
}

/// A cluster of operators serving one vault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub vault: VaultId,
    pub members: Vec<ClusterMember>,
    pub state: ClusterState,
    pub created_at: UnixTime,
    pub activated_at: Option<UnixTime>,
    /// Days of consumption already charged against the pool
    pub charged_days: u64,
    /// Smallest member balance at activation; total sustainable days
    pub runway_days: u64,
}

impl Cluster {
    /// Sum of remaining member credits
    pub fn credit_total(&self) -> u64 {
        self.members
            .iter()
            .fold(0u64, |acc, member| acc.saturating_add(member.credits))
    }

    /// Smallest member balance
    pub fn min_credits(&self) -> u64 {
        self.members
            .iter()
            .map(|member| member.credits)
            .min()
            .unwrap_or(0)
    }

    /// When the cluster exhausts its runway (activated clusters only)
    pub fn exit_time(&self) -> Option<UnixTime> {
        self.activated_at.map(|start| {
            start.saturating_add(self.runway_days.saturating_mul(crate::core::SECONDS_PER_DAY))
        })
    }

    /// Credits not yet charged, across all members
    pub fn unconsumed_credits(&self) -> u64 {
        self.members.iter().fold(0u64, |acc, member| {
            acc.saturating_add(member.credits.saturating_sub(self.charged_days))
        })
    }

    /// Whole days chargeable at `now`: elapsed days since activation, capped
    /// at the runway, minus what was already charged
    fn chargeable_days(&self, now: UnixTime) -> u64 {
        match (self.state, self.activated_at) {
            (ClusterState::Activated, Some(start)) => days_between(start, now)
                .min(self.runway_days)
                .saturating_sub(self.charged_days),
            _ => 0,
        }
    }
}

/// Per-vault accrual bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultAccrual {
    pub vault: VaultId,
    pub last_update: UnixTime,
    /// Activated clusters currently serving this vault
    pub active_clusters: u64,
    /// Rewards earned but not yet paid out
    pub owed: u64,
}

/// Why maintenance was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpkeepSkip {
    IntervalNotElapsed,
    NoActiveClusters,
    NothingDue,
}

impl fmt::Display for UpkeepSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UpkeepSkip::IntervalNotElapsed => "interval not elapsed",
            UpkeepSkip::NoActiveClusters => "no activated clusters",
            UpkeepSkip::NothingDue => "nothing due",
        };
        write!(f, "{}", reason)
    }
}

/// A cluster due for retirement, as reported by [`RewardsEngine::check_upkeep`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterExitDue {
    pub cluster: ClusterId,
    pub vault: VaultId,
    pub exit_time: UnixTime,
    pub credit_total: u64,
    /// Credits that will remain unconsumed at retirement
    pub leftover_credits: u64,
}

/// Work identified by a maintenance check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpkeepPlan {
    pub checked_at: UnixTime,
    pub due: Vec<ClusterExitDue>,
}

/// Outcome of a completed maintenance run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpkeepReport {
    pub performed_at: UnixTime,
    pub retired: Vec<ClusterId>,
    /// Unconsumed credit value returned to member escrow accounts
    pub refunded_value: u64,
    /// Reward value banked to vaults during the run
    pub settled_rewards: u64,
    pub active_clusters: u64,
    pub daily_rate: u64,
}

/// Outcome of a forced cluster exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitReport {
    pub cluster: ClusterId,
    pub refunded_value: u64,
    pub settled_rewards: u64,
}

/// Serializable rewards state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsSnapshot {
    pub clusters: Vec<Cluster>,
    pub vaults: Vec<VaultAccrual>,
    pub checkpoint: Checkpoint,
    pub outstanding_credits: u64,
    pub undistributed_owed: u64,
    pub active_clusters: u64,
    pub last_upkeep: UnixTime,
    pub next_cluster_id: u64,
}

/// Interior state, guarded by one lock
#[derive(Debug)]
struct RewardsState {
    clusters: BTreeMap<ClusterId, Cluster>,
    vaults: HashMap<VaultId, VaultAccrual>,
    checkpoint: Checkpoint,
    /// Credits sold but not yet consumed or refunded
    outstanding_credits: u64,
    /// Sum of all vault `owed` balances
    undistributed_owed: u64,
    active_clusters: u64,
    last_upkeep: UnixTime,
    next_cluster_id: u64,
}

/// The rewards accrual engine
pub struct RewardsEngine {
    config: RewardsConfig,
    authority: PoolAuthority,
    state: RwLock<RewardsState>,
    /// Serializes claims end to end
    claim_guard: Mutex<()>,
}

impl RewardsEngine {
    pub fn new(config: RewardsConfig, authority: PoolAuthority, genesis_time: UnixTime) -> Self {
        Self {
            config,
            authority,
            state: RwLock::new(RewardsState {
                clusters: BTreeMap::new(),
                vaults: HashMap::new(),
                checkpoint: Checkpoint::new(genesis_time),
                outstanding_credits: 0,
                undistributed_owed: 0,
                active_clusters: 0,
                last_upkeep: genesis_time,
                next_cluster_id: 1,
            }),
            claim_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RewardsConfig {
        &self.config
    }

    /// Register a pending cluster from selected members.
    ///
    /// Settles running accrual at the old rate, books the members' credits
    /// as outstanding, and recomputes the checkpoint for the new book. The
    /// cluster accrues nothing until activated.
    pub fn register_cluster(
        &self,
        escrow: &Escrow,
        vault: VaultId,
        members: Vec<ClusterMember>,
        now: UnixTime,
    ) -> Result<ClusterId, RewardsError> {
        if members.is_empty() {
            return Err(RewardsError::EmptyCluster);
        }
        if let Some(member) = members.iter().find(|member| member.credits == 0) {
            return Err(RewardsError::ZeroCreditMember {
                operator: member.operator,
            });
        }

        let mut state = self.state.write();
        if state.active_clusters > 0 {
            Self::settle_all(&mut state, now);
        }

        let credit_total: u64 = members
            .iter()
            .fold(0u64, |acc, member| acc.saturating_add(member.credits));
        let cluster_size = members.len() as u64;
        let id = state.next_cluster_id;
        state.next_cluster_id += 1;
        state.clusters.insert(
            id,
            Cluster {
                id,
                vault,
                members,
                state: ClusterState::Pending,
                created_at: now,
                activated_at: None,
                charged_days: 0,
                runway_days: 0,
            },
        );
        state.outstanding_credits = state.outstanding_credits.saturating_add(credit_total);
        state.checkpoint.cluster_size = cluster_size;
        let allocatable = Self::allocatable(&state, escrow);
        let outstanding = state.outstanding_credits;
        // outstanding just grew by a non-empty cluster; this cannot fail
        let rate = state.checkpoint.recompute(allocatable, outstanding, now)?;
        debug!(
            "cluster {} registered for vault {}: {} credits, rate now {}/day",
            id, vault, credit_total, rate
        );
        Ok(id)
    }

    /// Activate a pending cluster, fixing its runway at the smallest member
    /// balance and opening vault accrual. Any clusters already running for
    /// the vault settle first, so the accrual clock resets with nothing
    /// pending.
    pub fn activate_cluster(&self, id: ClusterId, now: UnixTime) -> Result<(), RewardsError> {
        let mut state = self.state.write();
        let vault = {
            let cluster = state
                .clusters
                .get(&id)
                .ok_or(RewardsError::ClusterNotFound { id })?;
            if cluster.state != ClusterState::Pending {
                return Err(RewardsError::InvalidClusterState {
                    cluster: id,
                    state: cluster.state,
                });
            }
            cluster.vault
        };
        Self::settle_vault(&mut state, &vault, now);

        let runway = {
            let cluster = state
                .clusters
                .get_mut(&id)
                .ok_or(RewardsError::ClusterNotFound { id })?;
            cluster.state = ClusterState::Activated;
            cluster.activated_at = Some(now);
            cluster.runway_days = cluster.min_credits();
            cluster.runway_days
        };

        let accrual = state.vaults.entry(vault).or_insert_with(|| VaultAccrual {
            vault,
            last_update: now,
            active_clusters: 0,
            owed: 0,
        });
        accrual.active_clusters += 1;
        accrual.last_update = now;
        state.active_clusters += 1;
        info!("cluster {} activated: runway {} days", id, runway);
        Ok(())
    }

    /// Pay a vault what it is owed, capped by what the pool can cover
    /// without touching other vaults' owed balances. Unpaid remainder stays
    /// on the books.
    pub fn claim(
        &self,
        escrow: &Escrow,
        vault: VaultId,
        now: UnixTime,
    ) -> Result<VaultPayout, RewardsError> {
        let _guard = self.claim_guard.lock();
        let mut state = self.state.write();
        if !state.vaults.contains_key(&vault) {
            return Err(RewardsError::VaultNotFound { vault });
        }
        Self::settle_vault(&mut state, &vault, now);

        let owed = state
            .vaults
            .get(&vault)
            .map(|accrual| accrual.owed)
            .unwrap_or(0);
        let others_owed = state.undistributed_owed.saturating_sub(owed);
        let allocatable = escrow.pool_balance().saturating_sub(others_owed);
        let amount = owed.min(allocatable);
        if amount == 0 {
            return Ok(VaultPayout { vault, amount: 0 });
        }

        if let Some(accrual) = state.vaults.get_mut(&vault) {
            accrual.owed -= amount;
            accrual.last_update = now;
        }
        state.undistributed_owed = state.undistributed_owed.saturating_sub(amount);
        match escrow.pay_from_pool(&self.authority, vault, amount) {
            Ok(payout) => {
                debug!("vault {} claimed {} drops", vault, amount);
                Ok(payout)
            }
            Err(err) => {
                if let Some(accrual) = state.vaults.get_mut(&vault) {
                    accrual.owed = accrual.owed.saturating_add(amount);
                }
                state.undistributed_owed = state.undistributed_owed.saturating_add(amount);
                Err(err.into())
            }
        }
    }

    /// Report whether maintenance should run and which clusters it would
    /// retire. Read-only.
    pub fn check_upkeep(&self, now: UnixTime) -> Result<UpkeepPlan, RewardsError> {
        let state = self.state.read();
        Self::upkeep_plan(&state, &self.config, now)
    }

    /// Run maintenance: settle accrual at the current rate, retire every
    /// cluster past its runway, refund unconsumed credit value, and
    /// recompute the rate for the surviving book.
    ///
    /// Re-validates the plan; a second run in the same interval fails with
    /// [`RewardsError::UpkeepNotNeeded`] and changes nothing.
    pub fn perform_upkeep(
        &self,
        escrow: &Escrow,
        now: UnixTime,
    ) -> Result<UpkeepReport, RewardsError> {
        let mut state = self.state.write();
        let plan = Self::upkeep_plan(&state, &self.config, now)?;

        let fee = self.config.credit_fee;
        let refund_total = plan.due.iter().fold(0u64, |acc, due| {
            acc.saturating_add(Self::credit_value(due.leftover_credits, fee))
        });
        let pool = escrow.pool_balance();
        if pool < refund_total {
            return Err(RewardsError::Escrow(EscrowError::InsufficientEscrowBalance {
                required: refund_total,
                available: pool,
            }));
        }

        let settled_rewards = Self::settle_all(&mut state, now);
        let mut refunded_value = 0u64;
        let mut retired = Vec::with_capacity(plan.due.len());
        for due in &plan.due {
            let refunded =
                Self::retire_cluster(&mut state, escrow, &self.authority, due.cluster, fee, now)?;
            refunded_value = refunded_value.saturating_add(refunded);
            retired.push(due.cluster);
        }

        let allocatable = Self::allocatable(&state, escrow);
        let outstanding = state.outstanding_credits;
        if outstanding > 0 {
            state.checkpoint.recompute(allocatable, outstanding, now)?;
        }
        state.last_upkeep = now;
        info!(
            "upkeep at {}: retired {} clusters, refunded {} drops, settled {} drops",
            now,
            retired.len(),
            refunded_value,
            settled_rewards
        );
        Ok(UpkeepReport {
            performed_at: now,
            retired,
            refunded_value,
            settled_rewards,
            active_clusters: state.active_clusters,
            daily_rate: state.checkpoint.daily_rate,
        })
    }

    /// Retire a cluster before its runway ends: settle everyone at the
    /// current rate, refund the cluster's unconsumed credit value, and
    /// recompute the rate for the remaining book.
    ///
    /// A pool short of the projected refund fails with
    /// [`RewardsError::Escrow`] before any settlement is applied.
    pub fn force_exit(
        &self,
        escrow: &Escrow,
        id: ClusterId,
        now: UnixTime,
    ) -> Result<ExitReport, RewardsError> {
        let mut state = self.state.write();
        let planned_credits = {
            let cluster = state
                .clusters
                .get(&id)
                .ok_or(RewardsError::ClusterNotFound { id })?;
            if cluster.state == ClusterState::Exited {
                return Err(RewardsError::InvalidClusterState {
                    cluster: id,
                    state: cluster.state,
                });
            }
            // leftover as it will stand once settled through `now`
            let exhausted = cluster
                .charged_days
                .saturating_add(cluster.chargeable_days(now));
            cluster.members.iter().fold(0u64, |acc, member| {
                acc.saturating_add(member.credits.saturating_sub(exhausted))
            })
        };
        let fee = self.config.credit_fee;
        let planned = Self::credit_value(planned_credits, fee);
        let pool = escrow.pool_balance();
        if pool < planned {
            return Err(RewardsError::Escrow(EscrowError::InsufficientEscrowBalance {
                required: planned,
                available: pool,
            }));
        }

        let settled_rewards = Self::settle_all(&mut state, now);
        let refunded_value =
            Self::retire_cluster(&mut state, escrow, &self.authority, id, fee, now)?;
        let allocatable = Self::allocatable(&state, escrow);
        let outstanding = state.outstanding_credits;
        if outstanding > 0 {
            state.checkpoint.recompute(allocatable, outstanding, now)?;
        }
        warn!(
            "cluster {} force-exited: refunded {} drops to members",
            id, refunded_value
        );
        Ok(ExitReport {
            cluster: id,
            refunded_value,
            settled_rewards,
        })
    }

    /// Settle running accrual and recompute the checkpoint rate against the
    /// current pool and book
    pub fn recompute_rate(&self, escrow: &Escrow, now: UnixTime) -> Result<u64, RewardsError> {
        let mut state = self.state.write();
        if state.active_clusters > 0 {
            Self::settle_all(&mut state, now);
        }
        let allocatable = Self::allocatable(&state, escrow);
        let outstanding = state.outstanding_credits;
        state.checkpoint.recompute(allocatable, outstanding, now)
    }

    /// A cluster by id, if known
    pub fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.state.read().clusters.get(&id).cloned()
    }

    /// All clusters in registration order
    pub fn clusters(&self) -> Vec<Cluster> {
        self.state.read().clusters.values().cloned().collect()
    }

    /// A vault's accrual record, if it ever activated a cluster
    pub fn vault_accrual(&self, vault: &VaultId) -> Option<VaultAccrual> {
        self.state.read().vaults.get(vault).cloned()
    }

    /// The active checkpoint
    pub fn checkpoint(&self) -> Checkpoint {
        self.state.read().checkpoint
    }

    /// Credits sold but not yet consumed or refunded
    pub fn outstanding_credits(&self) -> u64 {
        self.state.read().outstanding_credits
    }

    /// Rewards banked to vaults but not yet paid out
    pub fn undistributed_owed(&self) -> u64 {
        self.state.read().undistributed_owed
    }

    /// Pool value not yet spoken for by banked rewards
    pub fn allocatable_pool(&self, escrow: &Escrow) -> u64 {
        Self::allocatable(&self.state.read(), escrow)
    }

    pub fn active_cluster_count(&self) -> u64 {
        self.state.read().active_clusters
    }

    pub fn last_upkeep(&self) -> UnixTime {
        self.state.read().last_upkeep
    }

    /// Capture the full accrual state
    pub fn snapshot(&self) -> RewardsSnapshot {
        let state = self.state.read();
        let mut vaults: Vec<VaultAccrual> = state.vaults.values().cloned().collect();
        vaults.sort_by_key(|accrual| accrual.vault);
        RewardsSnapshot {
            clusters: state.clusters.values().cloned().collect(),
            vaults,
            checkpoint: state.checkpoint,
            outstanding_credits: state.outstanding_credits,
            undistributed_owed: state.undistributed_owed,
            active_clusters: state.active_clusters,
            last_upkeep: state.last_upkeep,
            next_cluster_id: state.next_cluster_id,
        }
    }

    /// Rebuild an engine from a snapshot
    pub fn restore(
        config: RewardsConfig,
        authority: PoolAuthority,
        snapshot: RewardsSnapshot,
    ) -> Self {
        let engine = Self::new(config, authority, snapshot.checkpoint.start_time);
        {
            let mut state = engine.state.write();
            state.clusters = snapshot
                .clusters
                .into_iter()
                .map(|cluster| (cluster.id, cluster))
                .collect();
            state.vaults = snapshot
                .vaults
                .into_iter()
                .map(|accrual| (accrual.vault, accrual))
                .collect();
            state.checkpoint = snapshot.checkpoint;
            state.outstanding_credits = snapshot.outstanding_credits;
            state.undistributed_owed = snapshot.undistributed_owed;
            state.active_clusters = snapshot.active_clusters;
            state.last_upkeep = snapshot.last_upkeep;
            state.next_cluster_id = snapshot.next_cluster_id;
        }
        engine
    }

    fn allocatable(state: &RewardsState, escrow: &Escrow) -> u64 {
        escrow
            .pool_balance()
            .saturating_sub(state.undistributed_owed)
    }

    fn credit_value(credits: u64, fee: u64) -> u64 {
        (credits as u128 * fee as u128).min(u64::MAX as u128) as u64
    }

    /// Bank chargeable days for every activated cluster at the current rate
    fn settle_all(state: &mut RewardsState, now: UnixTime) -> u64 {
        let rate = state.checkpoint.daily_rate;
        let mut vault_deltas: HashMap<VaultId, u64> = HashMap::new();
        let mut burned = 0u64;
        let mut settled_total = 0u64;
        for cluster in state.clusters.values_mut() {
            if cluster.state != ClusterState::Activated {
                continue;
            }
            let days = cluster.chargeable_days(now);
            if days == 0 {
                continue;
            }
            let value = (days as u128 * rate as u128).min(u64::MAX as u128) as u64;
            cluster.charged_days += days;
            burned = burned.saturating_add(days.saturating_mul(cluster.members.len() as u64));
            let delta = vault_deltas.entry(cluster.vault).or_insert(0);
            *delta = delta.saturating_add(value);
            settled_total = settled_total.saturating_add(value);
        }
        state.outstanding_credits = state.outstanding_credits.saturating_sub(burned);
        for (vault, delta) in vault_deltas {
            if let Some(accrual) = state.vaults.get_mut(&vault) {
                accrual.owed = accrual.owed.saturating_add(delta);
                accrual.last_update = now;
            }
        }
        state.undistributed_owed = state.undistributed_owed.saturating_add(settled_total);
        settled_total
    }

    /// Bank chargeable days for one vault's activated clusters
    fn settle_vault(state: &mut RewardsState, vault: &VaultId, now: UnixTime) -> u64 {
        let rate = state.checkpoint.daily_rate;
        let mut burned = 0u64;
        let mut delta = 0u64;
        for cluster in state.clusters.values_mut() {
            if cluster.vault != *vault || cluster.state != ClusterState::Activated {
                continue;
            }
            let days = cluster.chargeable_days(now);
            if days == 0 {
                continue;
            }
            let value = (days as u128 * rate as u128).min(u64::MAX as u128) as u64;
            cluster.charged_days += days;
            burned = burned.saturating_add(days.saturating_mul(cluster.members.len() as u64));
            delta = delta.saturating_add(value);
        }
        state.outstanding_credits = state.outstanding_credits.saturating_sub(burned);
        if delta > 0 {
            if let Some(accrual) = state.vaults.get_mut(vault) {
                accrual.owed = accrual.owed.saturating_add(delta);
                accrual.last_update = now;
            }
            state.undistributed_owed = state.undistributed_owed.saturating_add(delta);
        }
        delta
    }

    /// Exit a settled cluster: charge member balances for the consumed days,
    /// refund the unconsumed value to member escrow accounts, and drop the
    /// leftover credits from the book
    fn retire_cluster(
        state: &mut RewardsState,
        escrow: &Escrow,
        authority: &PoolAuthority,
        id: ClusterId,
        fee: u64,
        now: UnixTime,
    ) -> Result<u64, RewardsError> {
        let (vault, was_activated, leftover_credits, refunds) = {
            let cluster = state
                .clusters
                .get_mut(&id)
                .ok_or(RewardsError::ClusterNotFound { id })?;
            if cluster.state == ClusterState::Exited {
                return Err(RewardsError::InvalidClusterState {
                    cluster: id,
                    state: cluster.state,
                });
            }
            let was_activated = cluster.state == ClusterState::Activated;
            let exhausted = cluster.charged_days;
            let mut leftover_credits = 0u64;
            let mut refunds: Vec<(OperatorId, u64)> = Vec::new();
            for member in &mut cluster.members {
                member.credits = member.credits.saturating_sub(exhausted);
                if member.credits > 0 {
                    leftover_credits = leftover_credits.saturating_add(member.credits);
                    refunds.push((member.operator, Self::credit_value(member.credits, fee)));
                }
            }
            cluster.state = ClusterState::Exited;
            (cluster.vault, was_activated, leftover_credits, refunds)
        };

        let mut refunded = 0u64;
        for (operator, value) in refunds {
            escrow.return_to_account(authority, operator, value)?;
            refunded = refunded.saturating_add(value);
        }
        state.outstanding_credits = state.outstanding_credits.saturating_sub(leftover_credits);
        if was_activated {
            state.active_clusters = state.active_clusters.saturating_sub(1);
            if let Some(accrual) = state.vaults.get_mut(&vault) {
                accrual.active_clusters = accrual.active_clusters.saturating_sub(1);
                accrual.last_update = now;
            }
        }
        debug!("cluster {} retired: {} drops refunded", id, refunded);
        Ok(refunded)
    }

    fn upkeep_plan(
        state: &RewardsState,
        config: &RewardsConfig,
        now: UnixTime,
    ) -> Result<UpkeepPlan, RewardsError> {
        if now < state.last_upkeep.saturating_add(config.upkeep_interval) {
            return Err(RewardsError::UpkeepNotNeeded(UpkeepSkip::IntervalNotElapsed));
        }
        if state.active_clusters == 0 {
            return Err(RewardsError::UpkeepNotNeeded(UpkeepSkip::NoActiveClusters));
        }
        let mut due = Vec::new();
        for cluster in state.clusters.values() {
            if cluster.state != ClusterState::Activated {
                continue;
            }
            let Some(exit_time) = cluster.exit_time() else {
                continue;
            };
            if exit_time <= now {
                let leftover_credits = cluster.members.iter().fold(0u64, |acc, member| {
                    acc.saturating_add(member.credits.saturating_sub(cluster.runway_days))
                });
                due.push(ClusterExitDue {
                    cluster: cluster.id,
                    vault: cluster.vault,
                    exit_time,
                    credit_total: cluster.credit_total(),
                    leftover_credits,
                });
            }
        }
        if due.is_empty() {
            return Err(RewardsError::UpkeepNotNeeded(UpkeepSkip::NothingDue));
        }
        Ok(UpkeepPlan {
            checked_at: now,
            due,
        })
    }
}

/// Rewards errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewardsError {
    #[error("Cluster has no members")]
    EmptyCluster,

    #[error("Member {operator} carries zero credits")]
    ZeroCreditMember { operator: OperatorId },

    #[error("Cluster {id} not found")]
    ClusterNotFound { id: ClusterId },

    #[error("Invalid state {state:?} for cluster {cluster}")]
    InvalidClusterState {
        cluster: ClusterId,
        state: ClusterState,
    },

    #[error("Vault {vault} has no accrual record")]
    VaultNotFound { vault: VaultId },

    #[error("No outstanding credits to distribute against")]
    NoActiveCredits,

    #[error("Upkeep not needed: {0}")]
    UpkeepNotNeeded(UpkeepSkip),

    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SECONDS_PER_DAY;
    use crate::escrow::EscrowAuthority;

    const T0: UnixTime = 1_700_000_000;

    fn config() -> RewardsConfig {
        RewardsConfig {
            upkeep_interval: SECONDS_PER_DAY,
            credit_fee: 1_000,
        }
    }

    fn setup(pool: u64) -> (Escrow, EscrowAuthority, RewardsEngine) {
        let (escrow, auction_auth, pool_auth) = Escrow::new();
        if pool > 0 {
            let funder = OperatorId::derive(b"funder");
            escrow.deposit(&auction_auth, funder, pool).unwrap();
            escrow.release(&auction_auth, funder, pool).unwrap();
        }
        let engine = RewardsEngine::new(config(), pool_auth, T0);
        (escrow, auction_auth, engine)
    }

    fn op(n: u8) -> OperatorId {
        OperatorId::derive(&[n])
    }

    fn members(credits: &[u64]) -> Vec<ClusterMember> {
        credits
            .iter()
            .enumerate()
            .map(|(i, &credits)| ClusterMember {
                operator: op(i as u8 + 1),
                credits,
            })
            .collect()
    }

    fn day(n: u64) -> UnixTime {
        T0 + n * SECONDS_PER_DAY
    }

    #[test]
    fn test_register_computes_rate() {
        let (escrow, _auth, engine) = setup(42_000);
        let id = engine
            .register_cluster(&escrow, VaultId::derive(b"v"), members(&[10, 10, 10, 12]), T0)
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(engine.outstanding_credits(), 42);

        let checkpoint = engine.checkpoint();
        // 42000 / 42 = 1000 per credit, times cluster size 4
        assert_eq!(checkpoint.daily_rate, 4_000);
        assert_eq!(checkpoint.cluster_size, 4);
        assert_eq!(checkpoint.start_time, T0);

        let cluster = engine.cluster(id).unwrap();
        assert_eq!(cluster.state, ClusterState::Pending);
        assert_eq!(cluster.credit_total(), 42);
    }

    #[test]
    fn test_register_rejects_bad_members() {
        let (escrow, _auth, engine) = setup(10_000);
        let vault = VaultId::derive(b"v");
        assert!(matches!(
            engine.register_cluster(&escrow, vault, vec![], T0).unwrap_err(),
            RewardsError::EmptyCluster
        ));
        assert!(matches!(
            engine
                .register_cluster(&escrow, vault, members(&[5, 0]), T0)
                .unwrap_err(),
            RewardsError::ZeroCreditMember { .. }
        ));
        assert_eq!(engine.outstanding_credits(), 0);
    }

    #[test]
    fn test_activate_fixes_runway_and_opens_accrual() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();

        let cluster = engine.cluster(id).unwrap();
        assert_eq!(cluster.state, ClusterState::Activated);
        assert_eq!(cluster.runway_days, 10);
        assert_eq!(cluster.exit_time(), Some(day(10)));
        assert_eq!(engine.active_cluster_count(), 1);

        let accrual = engine.vault_accrual(&vault).unwrap();
        assert_eq!(accrual.active_clusters, 1);
        assert_eq!(accrual.owed, 0);

        // double activation is rejected
        assert!(matches!(
            engine.activate_cluster(id, T0).unwrap_err(),
            RewardsError::InvalidClusterState { .. }
        ));
    }

    #[test]
    fn test_pending_cluster_accrues_nothing() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();

        // no accrual record before activation
        assert!(matches!(
            engine.claim(&escrow, vault, day(5)).unwrap_err(),
            RewardsError::VaultNotFound { .. }
        ));

        // activation at day 5 starts the clock there
        engine.activate_cluster(id, day(5)).unwrap();
        let payout = engine.claim(&escrow, vault, day(7)).unwrap();
        assert_eq!(payout.amount, 2 * 4_000);
    }

    #[test]
    fn test_activate_settles_vaults_running_clusters() {
        let (escrow, _auth, engine) = setup(12_000);
        let vault = VaultId::derive(b"v");
        let first = engine
            .register_cluster(&escrow, vault, members(&[5]), T0)
            .unwrap();
        engine.activate_cluster(first, T0).unwrap();
        let second = engine
            .register_cluster(&escrow, vault, members(&[5]), T0)
            .unwrap();

        // the first cluster's two running days are banked at activation,
        // before the accrual clock resets
        engine.activate_cluster(second, day(2)).unwrap();
        let accrual = engine.vault_accrual(&vault).unwrap();
        assert_eq!(accrual.owed, 2 * 1_200);
        assert_eq!(accrual.last_update, day(2));
        assert_eq!(accrual.active_clusters, 2);
        assert_eq!(engine.undistributed_owed(), 2_400);
        assert_eq!(engine.outstanding_credits(), 8);
        assert_eq!(engine.cluster(first).unwrap().charged_days, 2);

        // an immediate claim pays exactly the banked amount, nothing twice
        assert_eq!(engine.claim(&escrow, vault, day(2)).unwrap().amount, 2_400);
    }

    #[test]
    fn test_claim_pays_accrued_and_stops_at_runway() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();

        let payout = engine.claim(&escrow, vault, day(3)).unwrap();
        assert_eq!(payout.amount, 12_000);
        assert_eq!(engine.outstanding_credits(), 42 - 12);
        assert_eq!(escrow.pool_balance(), 30_000);

        // second claim the same day pays nothing
        let payout = engine.claim(&escrow, vault, day(3)).unwrap();
        assert_eq!(payout.amount, 0);

        // far past the runway: only the remaining 7 chargeable days pay
        let payout = engine.claim(&escrow, vault, day(25)).unwrap();
        assert_eq!(payout.amount, 7 * 4_000);
        assert_eq!(engine.outstanding_credits(), 42 - 40);
    }

    #[test]
    fn test_full_lifecycle_with_leftover_refund() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();

        // day 10: the runway is exhausted and upkeep is due
        let plan = engine.check_upkeep(day(10)).unwrap();
        assert_eq!(plan.due.len(), 1);
        assert_eq!(plan.due[0].cluster, id);
        assert_eq!(plan.due[0].exit_time, day(10));
        assert_eq!(plan.due[0].leftover_credits, 2);

        let report = engine.perform_upkeep(&escrow, day(10)).unwrap();
        assert_eq!(report.retired, vec![id]);
        assert_eq!(report.settled_rewards, 40_000);
        assert_eq!(report.refunded_value, 2_000);
        assert_eq!(report.active_clusters, 0);

        // the 12-credit member got the 2-credit leftover back
        assert_eq!(escrow.balance_of(&op(4)), 2_000);
        assert_eq!(engine.outstanding_credits(), 0);
        assert_eq!(engine.active_cluster_count(), 0);

        let cluster = engine.cluster(id).unwrap();
        assert_eq!(cluster.state, ClusterState::Exited);
        assert_eq!(cluster.unconsumed_credits(), 0);

        // pool exactly covers the banked rewards
        assert_eq!(escrow.pool_balance(), 40_000);
        assert_eq!(engine.undistributed_owed(), 40_000);
        let payout = engine.claim(&escrow, vault, day(10)).unwrap();
        assert_eq!(payout.amount, 40_000);
        assert_eq!(escrow.pool_balance(), 0);
        assert_eq!(engine.undistributed_owed(), 0);
    }

    #[test]
    fn test_upkeep_interval_guard() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");

        // before the interval, regardless of state
        assert!(matches!(
            engine.check_upkeep(T0 + 10).unwrap_err(),
            RewardsError::UpkeepNotNeeded(UpkeepSkip::IntervalNotElapsed)
        ));

        // interval elapsed, nothing activated
        assert!(matches!(
            engine.check_upkeep(day(2)).unwrap_err(),
            RewardsError::UpkeepNotNeeded(UpkeepSkip::NoActiveClusters)
        ));

        // interval elapsed, active but not exhausted
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();
        assert!(matches!(
            engine.check_upkeep(day(2)).unwrap_err(),
            RewardsError::UpkeepNotNeeded(UpkeepSkip::NothingDue)
        ));
    }

    #[test]
    fn test_perform_upkeep_idempotent_within_interval() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();

        engine.perform_upkeep(&escrow, day(10)).unwrap();
        let locked_before = escrow.total_locked();
        let pool_before = escrow.pool_balance();

        // immediate re-run is refused and changes nothing
        assert!(matches!(
            engine.perform_upkeep(&escrow, day(10)).unwrap_err(),
            RewardsError::UpkeepNotNeeded(UpkeepSkip::IntervalNotElapsed)
        ));
        assert_eq!(escrow.total_locked(), locked_before);
        assert_eq!(escrow.pool_balance(), pool_before);
        assert_eq!(engine.last_upkeep(), day(10));
    }

    #[test]
    fn test_failed_upkeep_leaves_last_upkeep() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();

        // due date is day 10; a day-2 attempt fails and must not advance
        // the upkeep clock
        assert!(engine.perform_upkeep(&escrow, day(2)).is_err());
        assert_eq!(engine.last_upkeep(), T0);

        let report = engine.perform_upkeep(&escrow, day(10)).unwrap();
        assert_eq!(report.retired, vec![id]);
        assert_eq!(engine.last_upkeep(), day(10));
    }

    #[test]
    fn test_late_upkeep_never_charges_past_runway() {
        let (escrow, _auth, engine) = setup(10_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[5, 5]), T0)
            .unwrap();
        // rate: 10000 / 10 * 2 = 2000
        engine.activate_cluster(id, T0).unwrap();

        // upkeep arrives four days late
        let report = engine.perform_upkeep(&escrow, day(9)).unwrap();
        assert_eq!(report.settled_rewards, 5 * 2_000);
        assert_eq!(report.refunded_value, 0);
        assert_eq!(engine.outstanding_credits(), 0);
        // pool exactly covers what the vault is owed
        assert_eq!(escrow.pool_balance(), engine.undistributed_owed());
    }

    #[test]
    fn test_rate_transition_values_windows_at_their_rates() {
        let (escrow, _auth, engine) = setup(40_000);
        let vault_a = VaultId::derive(b"a");
        let vault_b = VaultId::derive(b"b");

        let a = engine
            .register_cluster(&escrow, vault_a, members(&[10, 10]), T0)
            .unwrap();
        // rate: 40000 / 20 * 2 = 4000
        engine.activate_cluster(a, T0).unwrap();
        assert_eq!(engine.checkpoint().daily_rate, 4_000);

        // day 5: a second cluster registers; the first 5 days settle at the
        // old rate before the rate drops
        let _b = engine
            .register_cluster(&escrow, vault_b, members(&[20, 20]), day(5))
            .unwrap();
        // settled: 5 days * 4000 = 20000 owed; allocatable 40000 - 20000;
        // outstanding 10 + 40; rate: 20000 / 50 * 2 = 800
        assert_eq!(engine.checkpoint().daily_rate, 800);
        assert_eq!(engine.undistributed_owed(), 20_000);
        assert_eq!(engine.outstanding_credits(), 50);

        // day 7 claim: 5 days at 4000 plus 2 days at 800
        let payout = engine.claim(&escrow, vault_a, day(7)).unwrap();
        assert_eq!(payout.amount, 20_000 + 1_600);
    }

    #[test]
    fn test_claim_caps_at_allocatable_and_keeps_shortfall() {
        let (escrow, _auth, engine) = setup(12_000);
        let vault_a = VaultId::derive(b"a");
        let vault_b = VaultId::derive(b"b");

        let a = engine
            .register_cluster(&escrow, vault_a, members(&[6]), T0)
            .unwrap();
        let b = engine
            .register_cluster(&escrow, vault_b, members(&[3, 3]), T0)
            .unwrap();
        // rate after both registrations: 12000 / 12 * 2 = 2000
        engine.activate_cluster(a, T0).unwrap();
        engine.activate_cluster(b, T0).unwrap();

        // upkeep only arrives at day 6: both clusters accrued at 2000/day
        // (A for 6 days, B for its 3-day runway), overcommitting the pool
        let report = engine.perform_upkeep(&escrow, day(6)).unwrap();
        assert_eq!(report.settled_rewards, 6 * 2_000 + 3 * 2_000);
        assert_eq!(engine.undistributed_owed(), 18_000);
        assert_eq!(escrow.pool_balance(), 12_000);

        // vault A is owed 12000 but B's 6000 is spoken for
        let payout = engine.claim(&escrow, vault_a, day(6)).unwrap();
        assert_eq!(payout.amount, 6_000);
        let accrual = engine.vault_accrual(&vault_a).unwrap();
        assert_eq!(accrual.owed, 6_000); // shortfall stays on the books

        // vault B in turn is capped by A's remaining claim
        let payout = engine.claim(&escrow, vault_b, day(6)).unwrap();
        assert_eq!(payout.amount, 0);
        assert_eq!(engine.vault_accrual(&vault_b).unwrap().owed, 6_000);
    }

    #[test]
    fn test_force_exit_refunds_unconsumed_value() {
        let (escrow, _auth, engine) = setup(20_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10]), T0)
            .unwrap();
        // rate: 20000 / 20 * 2 = 2000
        engine.activate_cluster(id, T0).unwrap();

        let report = engine.force_exit(&escrow, id, day(4)).unwrap();
        assert_eq!(report.settled_rewards, 4 * 2_000);
        assert_eq!(report.refunded_value, 12_000);
        assert_eq!(escrow.balance_of(&op(1)), 6_000);
        assert_eq!(escrow.balance_of(&op(2)), 6_000);
        assert_eq!(engine.outstanding_credits(), 0);
        assert_eq!(engine.active_cluster_count(), 0);

        // pool exactly covers the owed remainder
        assert_eq!(escrow.pool_balance(), 8_000);
        let payout = engine.claim(&escrow, vault, day(4)).unwrap();
        assert_eq!(payout.amount, 8_000);
        assert_eq!(escrow.pool_balance(), 0);

        // a second exit is rejected
        assert!(matches!(
            engine.force_exit(&escrow, id, day(5)).unwrap_err(),
            RewardsError::InvalidClusterState { .. }
        ));
    }

    #[test]
    fn test_force_exit_pending_refunds_everything() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();

        let report = engine.force_exit(&escrow, id, day(1)).unwrap();
        assert_eq!(report.settled_rewards, 0);
        assert_eq!(report.refunded_value, 42_000);
        assert_eq!(engine.outstanding_credits(), 0);
        assert_eq!(escrow.pool_balance(), 0);
        assert_eq!(escrow.balance_of(&op(4)), 12_000);
    }

    #[test]
    fn test_force_exit_pool_shortfall_leaves_books_untouched() {
        let (escrow, auth, engine) = setup(12_000);
        let vault_a = VaultId::derive(b"a");
        let vault_b = VaultId::derive(b"b");
        let id_a = engine
            .register_cluster(&escrow, vault_a, members(&[6]), T0)
            .unwrap();
        let id_b = engine
            .register_cluster(&escrow, vault_b, members(&[3, 3]), T0)
            .unwrap();
        engine.activate_cluster(id_a, T0).unwrap();
        engine.activate_cluster(id_b, T0).unwrap();

        // both vaults drain the pool dry at day 3
        assert_eq!(engine.claim(&escrow, vault_a, day(3)).unwrap().amount, 6_000);
        assert_eq!(engine.claim(&escrow, vault_b, day(3)).unwrap().amount, 6_000);
        assert_eq!(escrow.pool_balance(), 0);
        assert_eq!(engine.outstanding_credits(), 3);

        // the 2-credit leftover cannot be refunded; nothing settles across
        // the rejection
        let err = engine.force_exit(&escrow, id_a, day(4)).unwrap_err();
        assert_eq!(
            err,
            RewardsError::Escrow(EscrowError::InsufficientEscrowBalance {
                required: 2_000,
                available: 0
            })
        );
        assert_eq!(engine.undistributed_owed(), 0);
        assert_eq!(engine.outstanding_credits(), 3);
        assert_eq!(engine.vault_accrual(&vault_a).unwrap().owed, 0);
        assert_eq!(engine.active_cluster_count(), 2);
        assert_eq!(engine.checkpoint().daily_rate, 2_000);
        let cluster = engine.cluster(id_a).unwrap();
        assert_eq!(cluster.charged_days, 3);
        assert_eq!(cluster.state, ClusterState::Activated);

        // a refilled pool lets the same exit go through
        let funder = OperatorId::derive(b"refill");
        escrow.deposit(&auth, funder, 4_000).unwrap();
        escrow.release(&auth, funder, 4_000).unwrap();
        let report = engine.force_exit(&escrow, id_a, day(4)).unwrap();
        assert_eq!(report.settled_rewards, 2_000);
        assert_eq!(report.refunded_value, 2_000);
        assert_eq!(escrow.balance_of(&op(1)), 2_000);
        assert_eq!(engine.active_cluster_count(), 1);
    }

    #[test]
    fn test_recompute_rate_zero_credits_keeps_rate() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");

        // nothing on the book at all
        assert!(matches!(
            engine.recompute_rate(&escrow, T0).unwrap_err(),
            RewardsError::NoActiveCredits
        ));

        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();
        engine.perform_upkeep(&escrow, day(10)).unwrap();

        // book is empty again; the rate from the last live book survives
        assert!(matches!(
            engine.recompute_rate(&escrow, day(11)).unwrap_err(),
            RewardsError::NoActiveCredits
        ));
        assert_eq!(engine.checkpoint().daily_rate, 4_000);
    }

    #[test]
    fn test_claim_unknown_vault() {
        let (escrow, _auth, engine) = setup(1_000);
        let vault = VaultId::derive(b"nobody");
        let err = engine.claim(&escrow, vault, T0).unwrap_err();
        assert!(matches!(err, RewardsError::VaultNotFound { .. }));
        assert_eq!(
            err.to_string(),
            format!("Vault {} has no accrual record", vault)
        );
    }

    #[test]
    fn test_snapshot_roundtrip_mid_lifecycle() {
        let (escrow, _auth, engine) = setup(42_000);
        let vault = VaultId::derive(b"v");
        let id = engine
            .register_cluster(&escrow, vault, members(&[10, 10, 10, 12]), T0)
            .unwrap();
        engine.activate_cluster(id, T0).unwrap();
        engine.claim(&escrow, vault, day(3)).unwrap();

        let snapshot = engine.snapshot();
        let (escrow2, _auth2, pool_auth2) = Escrow::restore(escrow.snapshot());
        let restored = RewardsEngine::restore(config(), pool_auth2, snapshot);

        assert_eq!(restored.outstanding_credits(), 30);
        assert_eq!(restored.checkpoint().daily_rate, 4_000);
        assert_eq!(restored.active_cluster_count(), 1);
        assert_eq!(restored.cluster(id).unwrap().charged_days, 3);

        // the restored engine continues the timeline seamlessly
        let payout = restored.claim(&escrow2, vault, day(5)).unwrap();
        assert_eq!(payout.amount, 2 * 4_000);
    }
}
