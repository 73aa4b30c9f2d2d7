//! Auction engine: score-ordered bid ledger and cluster selection

pub mod engine;
pub mod ledger;
pub mod pricing;

pub use engine::{
    AuctionEngine, AuctionError, AuctionSnapshot, AuctionStats, OperatorProfile, SelectedMember,
    SelectionReceipt, SubmitReceipt, UpdateReceipt, WithdrawReceipt,
};
pub use ledger::{Bid, BidLedger, BidState, LedgerSlot};
pub use pricing::{quote, BidQuote, ReputationWeightedScore, ScorePolicy};
