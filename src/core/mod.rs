//! Core types and configuration shared across the platform

pub mod config;
pub mod types;

pub use config::{AuctionConfig, RewardsConfig};
pub use types::{
    days_between, BidId, ClusterId, OperatorId, Score, UnixTime, VaultId, BPS_DENOMINATOR,
    DROPS_PER_TIDE, NEUTRAL_REPUTATION_BPS, SECONDS_PER_DAY,
};
