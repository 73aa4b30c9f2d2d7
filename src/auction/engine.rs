//! Auction engine: bid intake, ledger upkeep, and cluster selection
//!
//! Operators lock their full quoted price in escrow on submission and the
//! ledger holds the bid in score order until selection or withdrawal.
//! Selection extracts the top bids all or nothing and moves their combined
//! collateral into the reward pool through the engine's escrow authority.
//! Every operation either completes fully or leaves ledger and escrow
//! exactly as they were.

use crate::auction::ledger::{Bid, BidLedger, BidState};
use crate::auction::pricing::{quote, BidQuote, ReputationWeightedScore, ScorePolicy};
use crate::core::{
    AuctionConfig, BidId, OperatorId, Score, UnixTime, NEUTRAL_REPUTATION_BPS,
};
use crate::escrow::{Escrow, EscrowAuthority, EscrowError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Per-operator standing maintained across bids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorProfile {
    pub operator: OperatorId,
    /// Reputation multiplier applied by the scoring policy (10000 = neutral)
    pub reputation_bps: u32,
    /// Whitelisted operators skip the participation bond
    pub whitelisted: bool,
    pub bids_submitted: u64,
    pub bids_assigned: u64,
    pub bids_withdrawn: u64,
    pub registered_at: UnixTime,
}

impl OperatorProfile {
    fn new(operator: OperatorId, now: UnixTime) -> Self {
        Self {
            operator,
            reputation_bps: NEUTRAL_REPUTATION_BPS,
            whitelisted: false,
            bids_submitted: 0,
            bids_assigned: 0,
            bids_withdrawn: 0,
            registered_at: now,
        }
    }
}

/// Receipt for an accepted bid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub bid_id: BidId,
    pub score: Score,
    /// Total collateral locked in escrow
    pub price: u64,
    pub credits: u64,
    /// Overpayment returned to the operator
    pub change: u64,
}

/// Receipt for a repriced bid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReceipt {
    pub bid_id: BidId,
    pub old_score: Score,
    pub new_score: Score,
    pub old_price: u64,
    pub new_price: u64,
    /// Additional collateral taken from the payment
    pub deposited: u64,
    /// Collateral refunded on a price decrease
    pub refunded: u64,
    /// Unused payment returned
    pub change: u64,
}

/// Receipt for a withdrawn bid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawReceipt {
    pub bid_id: BidId,
    pub refunded: u64,
}

/// One winning slot in a selected cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedMember {
    pub operator: OperatorId,
    pub bid_id: BidId,
    pub credits: u64,
    pub price: u64,
}

/// Receipt for a completed selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionReceipt {
    /// Winners in extraction order (best score first)
    pub members: Vec<SelectedMember>,
    /// Combined collateral moved into the reward pool
    pub released_total: u64,
}

#[derive(Debug, Default)]
struct AuctionCounters {
    bids_submitted: AtomicU64,
    bids_updated: AtomicU64,
    bids_withdrawn: AtomicU64,
    clusters_selected: AtomicU64,
}

/// Point-in-time auction statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionStats {
    pub queued_bids: usize,
    /// Sum of queued bid prices (the ledger's escrow claim)
    pub queued_value: u64,
    pub bids_submitted: u64,
    pub bids_updated: u64,
    pub bids_withdrawn: u64,
    pub clusters_selected: u64,
}

/// Serializable auction state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    /// Queued bids in ledger order
    pub bids: Vec<Bid>,
    pub profiles: Vec<OperatorProfile>,
    pub next_bid_id: u64,
}

/// The auction engine
pub struct AuctionEngine {
    config: AuctionConfig,
    policy: Box<dyn ScorePolicy>,
    authority: EscrowAuthority,
    ledger: RwLock<BidLedger>,
    profiles: RwLock<HashMap<OperatorId, OperatorProfile>>,
    next_bid_id: AtomicU64,
    counters: AuctionCounters,
}

impl AuctionEngine {
    /// Create an engine with the default reputation-weighted scoring policy
    pub fn new(config: AuctionConfig, authority: EscrowAuthority) -> Self {
        Self::with_policy(config, authority, Box::new(ReputationWeightedScore))
    }

    pub fn with_policy(
        config: AuctionConfig,
        authority: EscrowAuthority,
        policy: Box<dyn ScorePolicy>,
    ) -> Self {
        Self {
            config,
            policy,
            authority,
            ledger: RwLock::new(BidLedger::new()),
            profiles: RwLock::new(HashMap::new()),
            next_bid_id: AtomicU64::new(1),
            counters: AuctionCounters::default(),
        }
    }

    pub fn config(&self) -> &AuctionConfig {
        &self.config
    }

    /// Price the terms an operator would get right now, without bidding
    pub fn quote_for(
        &self,
        operator: &OperatorId,
        discount_bps: u16,
        duration_days: u64,
    ) -> Result<BidQuote, AuctionError> {
        let (reputation_bps, whitelisted) = self.profile_terms(operator);
        quote(
            &self.config,
            self.policy.as_ref(),
            discount_bps,
            duration_days,
            reputation_bps,
            whitelisted,
        )
    }

    /// Submit a new bid, locking its full price in escrow.
    ///
    /// `payment` must cover the quoted total price; the excess is returned
    /// as change in the receipt. Rejected bids leave no trace.
    pub fn submit_bid(
        &self,
        escrow: &Escrow,
        operator: OperatorId,
        discount_bps: u16,
        duration_days: u64,
        payment: u64,
        now: UnixTime,
    ) -> Result<SubmitReceipt, AuctionError> {
        let quote = self.quote_for(&operator, discount_bps, duration_days)?;
        if payment < quote.total_price {
            return Err(AuctionError::InsufficientFunds {
                required: quote.total_price,
                provided: payment,
            });
        }
        let change = payment - quote.total_price;

        escrow.deposit(&self.authority, operator, quote.total_price)?;
        let bid_id = self.next_bid_id.fetch_add(1, Ordering::SeqCst);
        let bid = Bid {
            id: bid_id,
            operator,
            discount_bps,
            duration_days,
            credits: quote.credits,
            price: quote.total_price,
            score: quote.score,
            state: BidState::Queued,
            submitted_at: now,
        };
        self.ledger.write().insert(bid);
        {
            let mut profiles = self.profiles.write();
            let profile = profiles
                .entry(operator)
                .or_insert_with(|| OperatorProfile::new(operator, now));
            profile.bids_submitted += 1;
        }
        self.counters.bids_submitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            "bid {} submitted by {}: price {}, {} credits, score {}",
            bid_id, operator, quote.total_price, quote.credits, quote.score
        );

        Ok(SubmitReceipt {
            bid_id,
            score: quote.score,
            price: quote.total_price,
            credits: quote.credits,
            change,
        })
    }

    /// Reprice the caller's most recent bid at `old_score` with new terms.
    ///
    /// The bid is removed, requoted under the operator's current standing,
    /// and reinserted as the newest entry at its new score. A price increase
    /// draws the difference from `payment`; a decrease refunds it. On any
    /// failure the original bid returns to its exact ledger position.
    pub fn update_bid(
        &self,
        escrow: &Escrow,
        operator: OperatorId,
        old_score: Score,
        discount_bps: u16,
        duration_days: u64,
        payment: u64,
        now: UnixTime,
    ) -> Result<UpdateReceipt, AuctionError> {
        let quote = self.quote_for(&operator, discount_bps, duration_days)?;

        let mut ledger = self.ledger.write();
        let (mut bid, slot) = ledger
            .remove_newest_of(old_score, &operator)
            .ok_or(AuctionError::BidNotFound { score: old_score })?;
        let old_price = bid.price;

        let (deposited, refunded, change) = if quote.total_price > old_price {
            let delta = quote.total_price - old_price;
            if payment < delta {
                ledger.restore(bid, slot);
                return Err(AuctionError::InsufficientFunds {
                    required: delta,
                    provided: payment,
                });
            }
            if let Err(err) = escrow.deposit(&self.authority, operator, delta) {
                ledger.restore(bid, slot);
                return Err(err.into());
            }
            (delta, 0, payment - delta)
        } else {
            let delta = old_price - quote.total_price;
            if delta > 0 {
                match escrow.refund(&self.authority, operator, delta) {
                    Ok(payout) => (0, payout.amount, payment),
                    Err(err) => {
                        ledger.restore(bid, slot);
                        return Err(err.into());
                    }
                }
            } else {
                (0, 0, payment)
            }
        };

        let bid_id = bid.id;
        bid.discount_bps = discount_bps;
        bid.duration_days = duration_days;
        bid.credits = quote.credits;
        bid.price = quote.total_price;
        bid.score = quote.score;
        bid.submitted_at = now;
        ledger.insert(bid);
        drop(ledger);

        self.counters.bids_updated.fetch_add(1, Ordering::Relaxed);
        debug!(
            "bid {} updated by {}: score {} -> {}, price {} -> {}",
            bid_id, operator, old_score, quote.score, old_price, quote.total_price
        );

        Ok(UpdateReceipt {
            bid_id,
            old_score,
            new_score: quote.score,
            old_price,
            new_price: quote.total_price,
            deposited,
            refunded,
            change,
        })
    }

    /// Withdraw the caller's most recent bid at `score`, refunding its full
    /// locked price
    pub fn withdraw_bid(
        &self,
        escrow: &Escrow,
        operator: OperatorId,
        score: Score,
    ) -> Result<WithdrawReceipt, AuctionError> {
        let mut ledger = self.ledger.write();
        let (bid, slot) = ledger
            .remove_newest_of(score, &operator)
            .ok_or(AuctionError::BidNotFound { score })?;

        let payout = match escrow.refund(&self.authority, operator, bid.price) {
            Ok(payout) => payout,
            Err(err) => {
                ledger.restore(bid, slot);
                return Err(err.into());
            }
        };
        drop(ledger);

        {
            let mut profiles = self.profiles.write();
            if let Some(profile) = profiles.get_mut(&operator) {
                profile.bids_withdrawn += 1;
            }
        }
        self.counters.bids_withdrawn.fetch_add(1, Ordering::Relaxed);
        debug!(
            "bid {} withdrawn by {}: refunded {}",
            bid.id, operator, payout.amount
        );

        Ok(WithdrawReceipt {
            bid_id: bid.id,
            refunded: payout.amount,
        })
    }

    /// Select the top `n` bids into a cluster, releasing their combined
    /// collateral into the reward pool.
    ///
    /// Fails without side effects when fewer than `n` bids are queued.
    pub fn select_cluster(
        &self,
        escrow: &Escrow,
        n: usize,
    ) -> Result<SelectionReceipt, AuctionError> {
        if n == 0 || n > self.config.max_cluster_size {
            return Err(AuctionError::InvalidClusterSize {
                requested: n,
                max: self.config.max_cluster_size,
            });
        }

        let mut ledger = self.ledger.write();
        let queued = ledger.len();
        let Some(winners) = ledger.take_top(n) else {
            return Err(AuctionError::InsufficientOperators {
                requested: n,
                queued,
            });
        };

        let releases: Vec<(OperatorId, u64)> =
            winners.iter().map(|bid| (bid.operator, bid.price)).collect();
        let released_total = match escrow.release_batch(&self.authority, &releases) {
            Ok(total) => total,
            Err(err) => {
                for bid in winners.into_iter().rev() {
                    ledger.restore_front(bid);
                }
                return Err(err.into());
            }
        };
        drop(ledger);

        {
            let mut profiles = self.profiles.write();
            for bid in &winners {
                if let Some(profile) = profiles.get_mut(&bid.operator) {
                    profile.bids_assigned += 1;
                }
            }
        }

        let members: Vec<SelectedMember> = winners
            .into_iter()
            .map(|mut bid| {
                bid.state = BidState::Assigned;
                SelectedMember {
                    operator: bid.operator,
                    bid_id: bid.id,
                    credits: bid.credits,
                    price: bid.price,
                }
            })
            .collect();
        self.counters
            .clusters_selected
            .fetch_add(1, Ordering::Relaxed);
        info!(
            "cluster selected: {} members, {} drops released to pool",
            members.len(),
            released_total
        );

        Ok(SelectionReceipt {
            members,
            released_total,
        })
    }

    /// Mark an operator as whitelisted (bond-exempt) or not
    pub fn set_whitelisted(&self, operator: OperatorId, whitelisted: bool, now: UnixTime) {
        let mut profiles = self.profiles.write();
        let profile = profiles
            .entry(operator)
            .or_insert_with(|| OperatorProfile::new(operator, now));
        profile.whitelisted = whitelisted;
        info!("operator {} whitelisted = {}", operator, whitelisted);
    }

    /// Set an operator's reputation multiplier in basis points
    pub fn set_reputation(&self, operator: OperatorId, reputation_bps: u32, now: UnixTime) {
        let mut profiles = self.profiles.write();
        let profile = profiles
            .entry(operator)
            .or_insert_with(|| OperatorProfile::new(operator, now));
        profile.reputation_bps = reputation_bps;
        info!("operator {} reputation = {} bps", operator, reputation_bps);
    }

    /// An operator's profile, if one exists
    pub fn profile(&self, operator: &OperatorId) -> Option<OperatorProfile> {
        self.profiles.read().get(operator).cloned()
    }

    /// Number of queued bids
    pub fn queued_bids(&self) -> usize {
        self.ledger.read().len()
    }

    /// Sum of queued bid prices (what the ledger claims against escrow)
    pub fn queued_value(&self) -> u64 {
        self.ledger.read().total_price()
    }

    /// Clone out the queued book in ledger order
    pub fn bids(&self) -> Vec<Bid> {
        self.ledger.read().bids()
    }

    pub fn stats(&self) -> AuctionStats {
        let ledger = self.ledger.read();
        AuctionStats {
            queued_bids: ledger.len(),
            queued_value: ledger.total_price(),
            bids_submitted: self.counters.bids_submitted.load(Ordering::Relaxed),
            bids_updated: self.counters.bids_updated.load(Ordering::Relaxed),
            bids_withdrawn: self.counters.bids_withdrawn.load(Ordering::Relaxed),
            clusters_selected: self.counters.clusters_selected.load(Ordering::Relaxed),
        }
    }

    /// Capture ledger and profiles for persistence
    pub fn snapshot(&self) -> AuctionSnapshot {
        let mut profiles: Vec<OperatorProfile> =
            self.profiles.read().values().cloned().collect();
        profiles.sort_by_key(|profile| profile.operator);
        AuctionSnapshot {
            bids: self.ledger.read().bids(),
            profiles,
            next_bid_id: self.next_bid_id.load(Ordering::SeqCst),
        }
    }

    /// Rebuild an engine from a snapshot.
    ///
    /// The scoring policy is not part of the snapshot; restored engines use
    /// the default policy unless reconstructed via [`with_policy`].
    ///
    /// [`with_policy`]: AuctionEngine::with_policy
    pub fn restore(
        config: AuctionConfig,
        authority: EscrowAuthority,
        snapshot: AuctionSnapshot,
    ) -> Self {
        let engine = Self::new(config, authority);
        *engine.ledger.write() = BidLedger::from_bids(snapshot.bids);
        {
            let mut profiles = engine.profiles.write();
            for profile in snapshot.profiles {
                profiles.insert(profile.operator, profile);
            }
        }
        engine
            .next_bid_id
            .store(snapshot.next_bid_id, Ordering::SeqCst);
        engine
    }

    fn profile_terms(&self, operator: &OperatorId) -> (u32, bool) {
        self.profiles
            .read()
            .get(operator)
            .map(|profile| (profile.reputation_bps, profile.whitelisted))
            .unwrap_or((NEUTRAL_REPUTATION_BPS, false))
    }
}

/// Auction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuctionError {
    #[error("Duration {days} days outside allowed range {min}..={max}")]
    DurationOutOfRange { days: u64, min: u64, max: u64 },

    #[error("Discount {offered} bps exceeds maximum {max} bps")]
    DiscountTooHigh { offered: u16, max: u16 },

    #[error("Bid price {price} funds no credits at fee {fee}")]
    PriceBelowFee { price: u64, fee: u64 },

    #[error("Amount overflow in price computation")]
    AmountOverflow,

    #[error("Insufficient funds: required {required}, provided {provided}")]
    InsufficientFunds { required: u64, provided: u64 },

    #[error("No bid owned by caller at score {score}")]
    BidNotFound { score: Score },

    #[error("Cluster size {requested} outside allowed range 1..={max}")]
    InvalidClusterSize { requested: usize, max: usize },

    #[error("Insufficient operators: requested {requested}, queued {queued}")]
    InsufficientOperators { requested: usize, queued: usize },

    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuctionConfig {
        AuctionConfig {
            expected_daily_yield: 2_000,
            credit_fee: 1_000,
            min_duration_days: 1,
            max_duration_days: 365,
            max_discount_bps: 5_000,
            participation_bond: 10_000,
            max_cluster_size: 16,
        }
    }

    fn setup() -> (Escrow, AuctionEngine) {
        let (escrow, auth, _pool_auth) = Escrow::new();
        let engine = AuctionEngine::new(config(), auth);
        (escrow, engine)
    }

    fn op(n: u8) -> OperatorId {
        OperatorId::derive(&[n])
    }

    #[test]
    fn test_submit_locks_full_price() {
        let (escrow, engine) = setup();
        let receipt = engine
            .submit_bid(&escrow, op(1), 0, 10, 50_000, 1_000)
            .unwrap();
        // 2000 * 10 = 20000 base + 10000 bond
        assert_eq!(receipt.price, 30_000);
        assert_eq!(receipt.credits, 20);
        assert_eq!(receipt.change, 20_000);
        assert_eq!(escrow.balance_of(&op(1)), 30_000);
        assert_eq!(engine.queued_bids(), 1);
    }

    #[test]
    fn test_submit_rejects_short_payment_without_trace() {
        let (escrow, engine) = setup();
        let err = engine
            .submit_bid(&escrow, op(1), 0, 10, 29_999, 1_000)
            .unwrap_err();
        assert!(matches!(
            err,
            AuctionError::InsufficientFunds {
                required: 30_000,
                provided: 29_999
            }
        ));
        assert_eq!(
            err.to_string(),
            "Insufficient funds: required 30000, provided 29999"
        );
        assert_eq!(escrow.balance_of(&op(1)), 0);
        assert_eq!(engine.queued_bids(), 0);
    }

    #[test]
    fn test_whitelist_skips_bond() {
        let (escrow, engine) = setup();
        engine.set_whitelisted(op(1), true, 1_000);
        let receipt = engine
            .submit_bid(&escrow, op(1), 0, 10, 20_000, 1_000)
            .unwrap();
        assert_eq!(receipt.price, 20_000);
        assert_eq!(receipt.credits, 20);
    }

    #[test]
    fn test_four_bids_extract_in_score_order() {
        let (escrow, engine) = setup();
        // distinct discounts give s1 > s2 > s3 > s4
        let r1 = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        let r2 = engine
            .submit_bid(&escrow, op(2), 1_000, 10, 50_000, 2)
            .unwrap();
        let r3 = engine
            .submit_bid(&escrow, op(3), 2_000, 10, 50_000, 3)
            .unwrap();
        let r4 = engine
            .submit_bid(&escrow, op(4), 3_000, 10, 50_000, 4)
            .unwrap();
        assert!(r1.score > r2.score && r2.score > r3.score && r3.score > r4.score);

        let receipt = engine.select_cluster(&escrow, 3).unwrap();
        let selected: Vec<OperatorId> =
            receipt.members.iter().map(|m| m.operator).collect();
        assert_eq!(selected, vec![op(1), op(2), op(3)]);
        // the lowest-scored bid stays queued
        assert_eq!(engine.queued_bids(), 1);
        assert_eq!(engine.bids()[0].id, r4.bid_id);
    }

    #[test]
    fn test_tied_scores_select_oldest_first() {
        let (escrow, engine) = setup();
        engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        engine.submit_bid(&escrow, op(2), 0, 10, 50_000, 2).unwrap();
        engine.submit_bid(&escrow, op(3), 0, 10, 50_000, 3).unwrap();

        let receipt = engine.select_cluster(&escrow, 2).unwrap();
        let selected: Vec<OperatorId> =
            receipt.members.iter().map(|m| m.operator).collect();
        assert_eq!(selected, vec![op(1), op(2)]);
    }

    #[test]
    fn test_selection_releases_collateral_to_pool() {
        let (escrow, engine) = setup();
        engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        engine.submit_bid(&escrow, op(2), 0, 10, 50_000, 2).unwrap();

        let receipt = engine.select_cluster(&escrow, 2).unwrap();
        assert_eq!(receipt.released_total, 60_000);
        assert_eq!(escrow.pool_balance(), 60_000);
        assert_eq!(escrow.total_locked(), 0);
        assert_eq!(escrow.balance_of(&op(1)), 0);
    }

    #[test]
    fn test_selection_insufficient_operators_no_side_effects() {
        let (escrow, engine) = setup();
        engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();

        let err = engine.select_cluster(&escrow, 2).unwrap_err();
        assert!(matches!(
            err,
            AuctionError::InsufficientOperators {
                requested: 2,
                queued: 1
            }
        ));
        assert_eq!(engine.queued_bids(), 1);
        assert_eq!(escrow.pool_balance(), 0);
        assert_eq!(escrow.balance_of(&op(1)), 30_000);
    }

    #[test]
    fn test_selection_size_bounds() {
        let (escrow, engine) = setup();
        assert!(matches!(
            engine.select_cluster(&escrow, 0).unwrap_err(),
            AuctionError::InvalidClusterSize { .. }
        ));
        assert!(matches!(
            engine.select_cluster(&escrow, 17).unwrap_err(),
            AuctionError::InvalidClusterSize { .. }
        ));
    }

    #[test]
    fn test_withdraw_refunds_full_price() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();

        let withdraw = engine.withdraw_bid(&escrow, op(1), receipt.score).unwrap();
        assert_eq!(withdraw.refunded, 30_000);
        assert_eq!(engine.queued_bids(), 0);
        assert_eq!(escrow.balance_of(&op(1)), 0);
        assert_eq!(escrow.total_locked(), 0);
    }

    #[test]
    fn test_withdraw_rejects_non_owner() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();

        let err = engine.withdraw_bid(&escrow, op(2), receipt.score).unwrap_err();
        assert!(matches!(err, AuctionError::BidNotFound { .. }));
        assert_eq!(engine.queued_bids(), 1);
    }

    #[test]
    fn test_withdraw_targets_callers_newest_in_bucket() {
        let (escrow, engine) = setup();
        let first = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        let second = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 2).unwrap();
        assert_eq!(first.score, second.score);

        engine.withdraw_bid(&escrow, op(1), first.score).unwrap();
        // the newer bid is gone, the older remains
        let remaining = engine.bids();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.bid_id);
    }

    #[test]
    fn test_update_price_increase_draws_delta() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 10, 30_000, 1).unwrap();
        assert_eq!(receipt.price, 30_000);

        // extend 10 -> 20 days: base 20000 -> 40000, delta 20000
        let update = engine
            .update_bid(&escrow, op(1), receipt.score, 0, 20, 25_000, 2)
            .unwrap();
        assert_eq!(update.deposited, 20_000);
        assert_eq!(update.refunded, 0);
        assert_eq!(update.change, 5_000);
        assert_eq!(update.new_price, 50_000);
        assert!(update.new_score > update.old_score);
        assert_eq!(escrow.balance_of(&op(1)), 50_000);
        assert_eq!(engine.queued_bids(), 1);
    }

    #[test]
    fn test_update_price_decrease_refunds_delta() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 20, 50_000, 1).unwrap();
        assert_eq!(receipt.price, 50_000);

        let update = engine
            .update_bid(&escrow, op(1), receipt.score, 2_000, 20, 0, 2)
            .unwrap();
        // base 40000 -> 32000, price 50000 -> 42000
        assert_eq!(update.deposited, 0);
        assert_eq!(update.refunded, 8_000);
        assert_eq!(update.new_price, 42_000);
        assert!(update.new_score < update.old_score);
        assert_eq!(escrow.balance_of(&op(1)), 42_000);
    }

    #[test]
    fn test_update_shortfall_restores_bid() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 10, 30_000, 1).unwrap();

        let err = engine
            .update_bid(&escrow, op(1), receipt.score, 0, 20, 100, 2)
            .unwrap_err();
        assert!(matches!(err, AuctionError::InsufficientFunds { .. }));
        // original terms intact at the original position
        let bids = engine.bids();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].duration_days, 10);
        assert_eq!(bids[0].price, 30_000);
        assert_eq!(escrow.balance_of(&op(1)), 30_000);
    }

    #[test]
    fn test_update_requotes_under_current_standing() {
        let (escrow, engine) = setup();
        let receipt = engine.submit_bid(&escrow, op(1), 0, 10, 30_000, 1).unwrap();
        assert_eq!(receipt.price, 30_000); // bond included

        // operator is whitelisted after submitting
        engine.set_whitelisted(op(1), true, 2);
        let update = engine
            .update_bid(&escrow, op(1), receipt.score, 0, 10, 0, 3)
            .unwrap();
        // same terms, bond now waived: price drops by the bond
        assert_eq!(update.new_price, 20_000);
        assert_eq!(update.refunded, 10_000);
    }

    #[test]
    fn test_update_reinserts_as_newest_at_new_score() {
        let (escrow, engine) = setup();
        let target = engine.submit_bid(&escrow, op(1), 1_000, 10, 50_000, 1).unwrap();
        let peer = engine.submit_bid(&escrow, op(2), 0, 10, 50_000, 2).unwrap();

        // reprice op(1) to discount 0: same score bucket as op(2)'s bid
        let update = engine
            .update_bid(&escrow, op(1), target.score, 0, 10, 50_000, 3)
            .unwrap();
        assert_eq!(update.new_score, peer.score);

        let receipt = engine.select_cluster(&escrow, 2).unwrap();
        // op(2) entered the tied bucket earlier, so it extracts first
        assert_eq!(receipt.members[0].operator, op(2));
        assert_eq!(receipt.members[1].operator, op(1));
    }

    #[test]
    fn test_reputation_reorders_equal_prices() {
        let (escrow, engine) = setup();
        engine.set_reputation(op(2), 12_000, 0);
        let plain = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        let boosted = engine.submit_bid(&escrow, op(2), 0, 10, 50_000, 2).unwrap();
        assert!(boosted.score > plain.score);

        let receipt = engine.select_cluster(&escrow, 1).unwrap();
        assert_eq!(receipt.members[0].operator, op(2));
    }

    #[test]
    fn test_profile_counters_track_lifecycle() {
        let (escrow, engine) = setup();
        let r1 = engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 2).unwrap();
        engine.withdraw_bid(&escrow, op(1), r1.score).unwrap();
        engine.select_cluster(&escrow, 1).unwrap();

        let profile = engine.profile(&op(1)).unwrap();
        assert_eq!(profile.bids_submitted, 2);
        assert_eq!(profile.bids_withdrawn, 1);
        assert_eq!(profile.bids_assigned, 1);

        let stats = engine.stats();
        assert_eq!(stats.bids_submitted, 2);
        assert_eq!(stats.bids_withdrawn, 1);
        assert_eq!(stats.clusters_selected, 1);
        assert_eq!(stats.queued_bids, 0);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_book() {
        let (escrow, engine) = setup();
        engine.set_whitelisted(op(2), true, 0);
        engine.submit_bid(&escrow, op(1), 0, 10, 50_000, 1).unwrap();
        engine.submit_bid(&escrow, op(2), 500, 15, 50_000, 2).unwrap();

        let snapshot = engine.snapshot();
        let (escrow2, auth2, _pool2) = Escrow::restore(escrow.snapshot());
        let restored = AuctionEngine::restore(config(), auth2, snapshot);

        assert_eq!(restored.queued_bids(), 2);
        assert_eq!(restored.queued_value(), engine.queued_value());
        assert!(restored.profile(&op(2)).unwrap().whitelisted);

        // next submission continues the id sequence
        let receipt = restored
            .submit_bid(&escrow2, op(3), 0, 10, 50_000, 3)
            .unwrap();
        assert_eq!(receipt.bid_id, 3);
    }
}
