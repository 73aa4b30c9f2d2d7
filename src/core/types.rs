//! Identity and unit types for the Tidepool economic core
//!
//! Monetary amounts are denominated in drops (1 TIDE = 10^9 drops) and
//! carried as plain `u64`. Time is unix seconds; credit accounting is
//! day-granular, so elapsed spans floor to whole days.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Drops per TIDE (1 TIDE = 10^9 drops)
pub const DROPS_PER_TIDE: u64 = 1_000_000_000;

/// Seconds per day (resource credits are day-granular)
pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Basis-point denominator (10000 = 100%)
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Neutral reputation multiplier (no boost, no penalty)
pub const NEUTRAL_REPUTATION_BPS: u32 = 10_000;

/// Unix timestamp in seconds
pub type UnixTime = u64;

/// Auction score assigned by the active scoring policy
pub type Score = u128;

/// Bid identifier, sequence-assigned at submission
pub type BidId = u64;

/// Cluster identifier, sequence-assigned at registration
pub type ClusterId = u64;

/// Whole days elapsed from `from` to `to` (floor; zero when `to < from`)
pub fn days_between(from: UnixTime, to: UnixTime) -> u64 {
    to.saturating_sub(from) / SECONDS_PER_DAY
}

/// Operator identity (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub [u8; 32]);

impl OperatorId {
    /// The all-zero identity
    pub fn zero() -> Self {
        OperatorId([0u8; 32])
    }

    /// Derive a deterministic identity from seed bytes
    pub fn derive(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tidepool-operator");
        hasher.update(seed);
        OperatorId(hasher.finalize().into())
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}..{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[30], self.0[31]
        )
    }
}

impl fmt::Debug for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorId({})", self)
    }
}

/// Vault identity (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultId(pub [u8; 32]);

impl VaultId {
    /// The all-zero identity
    pub fn zero() -> Self {
        VaultId([0u8; 32])
    }

    /// Derive a deterministic identity from seed bytes
    pub fn derive(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tidepool-vault");
        hasher.update(seed);
        VaultId(hasher.finalize().into())
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}..{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[30], self.0[31]
        )
    }
}

impl fmt::Debug for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultId({})", self)
    }
}
