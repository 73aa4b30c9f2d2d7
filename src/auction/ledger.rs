//! Score-ordered bid ledger
//!
//! Bids are keyed by score with an insertion-ordered bucket per score.
//! Selection drains from the top score down, oldest entry first within a
//! bucket; owner-addressed removal (withdraw, update) takes the owner's
//! most recent entry in a bucket. Extracting more bids than the ledger
//! holds fails without touching it.

use crate::core::{BidId, OperatorId, Score, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Lifecycle state of a bid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidState {
    /// Priced but not held in the ledger
    Idle,
    /// In the ledger awaiting selection
    Queued,
    /// Selected into a cluster and removed from the ledger
    Assigned,
}

/// A priced, scored request for a cluster slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub operator: OperatorId,
    /// Offered discount against the yield benchmark, in basis points
    pub discount_bps: u16,
    /// Committed participation duration in days
    pub duration_days: u64,
    /// Prepaid member-days funded by this bid
    pub credits: u64,
    /// Total collateral locked in escrow (base price plus bond)
    pub price: u64,
    pub score: Score,
    pub state: BidState,
    pub submitted_at: UnixTime,
}

/// Position a bid was removed from, for exact restoration on rollback
#[derive(Debug, Clone, Copy)]
pub struct LedgerSlot {
    pub score: Score,
    pub index: usize,
}

/// Score-keyed book of queued bids
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BidLedger {
    buckets: BTreeMap<Score, VecDeque<Bid>>,
    len: usize,
}

impl BidLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert as the most recent entry of its score bucket
    pub fn insert(&mut self, bid: Bid) {
        self.buckets.entry(bid.score).or_default().push_back(bid);
        self.len += 1;
    }

    /// Remove the operator's most recent bid at `score`, reporting where it
    /// sat so a failed downstream step can put it back
    pub fn remove_newest_of(
        &mut self,
        score: Score,
        operator: &OperatorId,
    ) -> Option<(Bid, LedgerSlot)> {
        let (bid, index, now_empty) = {
            let bucket = self.buckets.get_mut(&score)?;
            let index = bucket.iter().rposition(|bid| bid.operator == *operator)?;
            let bid = bucket.remove(index)?;
            (bid, index, bucket.is_empty())
        };
        if now_empty {
            self.buckets.remove(&score);
        }
        self.len -= 1;
        Some((bid, LedgerSlot { score, index }))
    }

    /// Reinstate a bid at the position it was removed from
    pub fn restore(&mut self, bid: Bid, slot: LedgerSlot) {
        let bucket = self.buckets.entry(slot.score).or_default();
        let index = slot.index.min(bucket.len());
        bucket.insert(index, bid);
        self.len += 1;
    }

    /// Reinstate a bid at the front of its score bucket (rollback of a
    /// top-of-book extraction)
    pub fn restore_front(&mut self, bid: Bid) {
        self.buckets.entry(bid.score).or_default().push_front(bid);
        self.len += 1;
    }

    /// Extract the top `k` bids, highest score first and oldest first within
    /// a score. Returns `None` with the ledger untouched if fewer than `k`
    /// bids are queued.
    pub fn take_top(&mut self, k: usize) -> Option<Vec<Bid>> {
        if self.len < k {
            return None;
        }
        let mut out = Vec::with_capacity(k);
        while out.len() < k {
            let Some(mut entry) = self.buckets.last_entry() else {
                break;
            };
            let bid = match entry.get_mut().pop_front() {
                Some(bid) => bid,
                None => {
                    entry.remove();
                    continue;
                }
            };
            self.len -= 1;
            out.push(bid);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        Some(out)
    }

    /// Iterate all queued bids, highest score first, oldest first within a
    /// score
    pub fn iter_desc(&self) -> impl Iterator<Item = &Bid> {
        self.buckets.values().rev().flat_map(|bucket| bucket.iter())
    }

    /// Sum of all queued bid prices
    pub fn total_price(&self) -> u64 {
        self.iter_desc()
            .fold(0u64, |acc, bid| acc.saturating_add(bid.price))
    }

    /// Clone out every queued bid in ledger order
    pub fn bids(&self) -> Vec<Bid> {
        self.iter_desc().cloned().collect()
    }

    /// Rebuild a ledger from bids in ledger order (as produced by [`bids`])
    ///
    /// [`bids`]: BidLedger::bids
    pub fn from_bids(bids: Vec<Bid>) -> Self {
        let mut ledger = Self::new();
        for bid in bids {
            ledger.insert(bid);
        }
        ledger
    }
}
