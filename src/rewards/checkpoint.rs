//! Reward-rate checkpoint
//!
//! The checkpoint carries the daily reward rate paid to each activated
//! cluster. It is recomputed at every point where outstanding credits or
//! the allocatable pool change; accrual windows are always valued at the
//! rate that was in effect while they elapsed.

use crate::core::UnixTime;
use crate::rewards::engine::RewardsError;
use serde::{Deserialize, Serialize};

/// The active reward rate and when it took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// When the current rate took effect
    pub start_time: UnixTime,
    /// Drops accrued per activated cluster per day
    pub daily_rate: u64,
    /// Members per cluster in effect for rate computation
    pub cluster_size: u64,
}

impl Checkpoint {
    pub fn new(now: UnixTime) -> Self {
        Self {
            start_time: now,
            daily_rate: 0,
            cluster_size: 0,
        }
    }

    /// Recompute the daily rate as `allocatable / outstanding * cluster_size`
    /// with flooring division, left to right.
    ///
    /// Zero outstanding credits is an error; the prior rate and start time
    /// stay untouched.
    pub fn recompute(
        &mut self,
        allocatable: u64,
        outstanding_credits: u64,
        now: UnixTime,
    ) -> Result<u64, RewardsError> {
        if outstanding_credits == 0 {
            return Err(RewardsError::NoActiveCredits);
        }
        let per_credit = allocatable / outstanding_credits;
        let rate = (per_credit as u128 * self.cluster_size as u128).min(u64::MAX as u128) as u64;
        self.daily_rate = rate;
        self.start_time = now;
        Ok(rate)
    }
}
