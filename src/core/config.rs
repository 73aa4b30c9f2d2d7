//! Economic configuration for the auction and rewards engines

use crate::core::types::{DROPS_PER_TIDE, SECONDS_PER_DAY};
use serde::{Deserialize, Serialize};

/// Auction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionConfig {
    /// Expected gross yield per cluster slot per day, in drops; the
    /// pricing benchmark every bid is discounted against
    pub expected_daily_yield: u64,
    /// Price of one resource credit in drops (one credit funds one member-day)
    pub credit_fee: u64,
    /// Minimum bid duration in days
    pub min_duration_days: u64,
    /// Maximum bid duration in days
    pub max_duration_days: u64,
    /// Maximum discount an operator may offer, in basis points
    pub max_discount_bps: u16,
    /// Participation bond added to the price for non-whitelisted operators
    pub participation_bond: u64,
    /// Largest cluster a single selection may form
    pub max_cluster_size: usize,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            expected_daily_yield: 2 * DROPS_PER_TIDE, // 2 TIDE per slot-day
            credit_fee: DROPS_PER_TIDE,               // 1 TIDE per member-day
            min_duration_days: 1,
            max_duration_days: 365,                   // one year commitment cap
            max_discount_bps: 5_000,                  // 50%
            participation_bond: 10 * DROPS_PER_TIDE,  // 10 TIDE
            max_cluster_size: 16,
        }
    }
}

/// Rewards accrual engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    /// Minimum seconds between successful upkeep runs
    pub upkeep_interval: u64,
    /// Price of one resource credit in drops; must match the auction fee
    pub credit_fee: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            upkeep_interval: SECONDS_PER_DAY, // daily maintenance
            credit_fee: DROPS_PER_TIDE,       // 1 TIDE per member-day
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let auction = AuctionConfig::default();
        let rewards = RewardsConfig::default();
        assert_eq!(auction.credit_fee, rewards.credit_fee);
        assert!(auction.min_duration_days <= auction.max_duration_days);
        // the cheapest allowed bid must still fund at least one credit
        let floor_price = auction.expected_daily_yield * auction.min_duration_days
            * (10_000 - auction.max_discount_bps as u64)
            / 10_000;
        assert!(floor_price >= auction.credit_fee);
    }
}
