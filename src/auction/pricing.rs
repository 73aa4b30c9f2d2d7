//! Bid pricing and scoring
//!
//! A bid's price grows with the committed duration and shrinks with the
//! offered discount, anchored to the platform's expected per-slot daily
//! yield. Resource credits (one prepaid member-day each) derive from the
//! pre-bond base price at the configured per-day fee; the participation
//! bond is pure collateral and funds no credits.

use crate::auction::engine::AuctionError;
use crate::core::{AuctionConfig, Score, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};

/// Priced terms for a bid before it enters the ledger
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BidQuote {
    /// Price excluding the participation bond
    pub base_price: u64,
    /// Participation bond (zero for whitelisted operators)
    pub bond: u64,
    /// Total collateral the operator must lock
    pub total_price: u64,
    /// Resource credits funded by the base price
    pub credits: u64,
    /// Ledger rank under the active scoring policy
    pub score: Score,
}

/// Scoring policy mapping a priced bid to its ledger rank.
///
/// Implementations must be monotonically non-decreasing in `base_price`
/// and in `reputation_bps`; everything else is policy.
pub trait ScorePolicy: Send + Sync {
    fn score(&self, base_price: u64, credits: u64, reputation_bps: u32) -> Score;
}

/// Default policy: base price weighted by the operator's reputation
/// multiplier in basis points
#[derive(Debug, Clone, Copy, Default)]
pub struct ReputationWeightedScore;

impl ScorePolicy for ReputationWeightedScore {
    fn score(&self, base_price: u64, _credits: u64, reputation_bps: u32) -> Score {
        base_price as u128 * reputation_bps as u128 / BPS_DENOMINATOR as u128
    }
}

/// Price a bid's terms and compute its score
pub fn quote(
    config: &AuctionConfig,
    policy: &dyn ScorePolicy,
    discount_bps: u16,
    duration_days: u64,
    reputation_bps: u32,
    whitelisted: bool,
) -> Result<BidQuote, AuctionError> {
    if duration_days < config.min_duration_days || duration_days > config.max_duration_days {
        return Err(AuctionError::DurationOutOfRange {
            days: duration_days,
            min: config.min_duration_days,
            max: config.max_duration_days,
        });
    }
    // the enforced cap never exceeds the denominator
    let discount_cap = config.max_discount_bps.min(BPS_DENOMINATOR as u16);
    if discount_bps > discount_cap {
        return Err(AuctionError::DiscountTooHigh {
            offered: discount_bps,
            max: discount_cap,
        });
    }

    let gross = config.expected_daily_yield as u128 * duration_days as u128;
    let discounted = gross * (BPS_DENOMINATOR - discount_bps as u64) as u128 / BPS_DENOMINATOR as u128;
    let base_price = u64::try_from(discounted).map_err(|_| AuctionError::AmountOverflow)?;

    if config.credit_fee == 0 {
        return Err(AuctionError::AmountOverflow);
    }
    let credits = base_price / config.credit_fee;
    if credits == 0 {
        return Err(AuctionError::PriceBelowFee {
            price: base_price,
            fee: config.credit_fee,
        });
    }

    let bond = if whitelisted {
        0
    } else {
        config.participation_bond
    };
    let total_price = base_price
        .checked_add(bond)
        .ok_or(AuctionError::AmountOverflow)?;
    let score = policy.score(base_price, credits, reputation_bps);

    Ok(BidQuote {
        base_price,
        bond,
        total_price,
        credits,
        score,
    })
}
