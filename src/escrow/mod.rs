//! Escrow: sole custodian of locked operator collateral and the reward pool
//!
//! Every drop a bidding operator commits sits in an escrow account until the
//! auction engine either releases it into the reward pool (on selection) or
//! refunds it (on withdrawal or a price decrease). Locked balances move only
//! through the holder of the [`EscrowAuthority`] token; pool balances move
//! only through the holder of the [`PoolAuthority`] token. Both tokens are
//! minted once, at construction, and are neither `Clone` nor `Copy`.
//!
//! Outbound transfers serialize on the transfer guard and finish every
//! balance mutation before the payout value exists.

use crate::core::{OperatorId, VaultId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Monotonic source for authority token identities
static NEXT_AUTHORITY_ID: AtomicU64 = AtomicU64::new(1);

/// Capability token gating locked-balance operations (deposit, release,
/// refund). Held by the auction engine.
#[derive(Debug)]
pub struct EscrowAuthority {
    id: u64,
}

/// Capability token gating pool-side operations (reward payments, credit
/// refunds). Held by the rewards engine.
#[derive(Debug)]
pub struct PoolAuthority {
    id: u64,
}

/// Outbound transfer of locked collateral back to an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "a payout leaving custody must be delivered"]
pub struct OperatorPayout {
    pub operator: OperatorId,
    pub amount: u64,
}

/// Outbound reward payment to a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "a payout leaving custody must be delivered"]
pub struct VaultPayout {
    pub vault: VaultId,
    pub amount: u64,
}

/// Custodian of per-operator locked balances and the shared reward pool
#[derive(Debug)]
pub struct Escrow {
    /// Locked collateral per operator
    accounts: RwLock<HashMap<OperatorId, u64>>,
    /// Sum of all locked balances
    total_locked: AtomicU64,
    /// Reward pool funding cluster accrual
    pool: AtomicU64,
    engine_id: u64,
    rewards_id: u64,
    /// Serializes outbound transfers
    transfer_guard: Mutex<()>,
}

impl Escrow {
    /// Create an empty escrow and mint its two authority tokens
    pub fn new() -> (Self, EscrowAuthority, PoolAuthority) {
        let engine_id = NEXT_AUTHORITY_ID.fetch_add(1, Ordering::SeqCst);
        let rewards_id = NEXT_AUTHORITY_ID.fetch_add(1, Ordering::SeqCst);
        let escrow = Self {
            accounts: RwLock::new(HashMap::new()),
            total_locked: AtomicU64::new(0),
            pool: AtomicU64::new(0),
            engine_id,
            rewards_id,
            transfer_guard: Mutex::new(()),
        };
        (
            escrow,
            EscrowAuthority { id: engine_id },
            PoolAuthority { id: rewards_id },
        )
    }

    fn check_engine(&self, auth: &EscrowAuthority) -> Result<(), EscrowError> {
        if auth.id != self.engine_id {
            return Err(EscrowError::Unauthorized);
        }
        Ok(())
    }

    fn check_rewards(&self, auth: &PoolAuthority) -> Result<(), EscrowError> {
        if auth.id != self.rewards_id {
            return Err(EscrowError::Unauthorized);
        }
        Ok(())
    }

    /// Lock collateral into an operator's escrow account
    pub fn deposit(
        &self,
        auth: &EscrowAuthority,
        operator: OperatorId,
        amount: u64,
    ) -> Result<(), EscrowError> {
        self.check_engine(auth)?;
        let mut accounts = self.accounts.write();
        let balance = accounts.entry(operator).or_insert(0);
        *balance = balance.saturating_add(amount);
        drop(accounts);
        self.total_locked.fetch_add(amount, Ordering::SeqCst);
        debug!("escrow: locked {} drops for {}", amount, operator);
        Ok(())
    }

    /// Move locked collateral from an operator's account into the reward pool
    pub fn release(
        &self,
        auth: &EscrowAuthority,
        operator: OperatorId,
        amount: u64,
    ) -> Result<(), EscrowError> {
        self.check_engine(auth)?;
        let mut accounts = self.accounts.write();
        let balance = accounts
            .get_mut(&operator)
            .ok_or(EscrowError::InsufficientEscrowBalance {
                required: amount,
                available: 0,
            })?;
        if *balance < amount {
            return Err(EscrowError::InsufficientEscrowBalance {
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        drop(accounts);
        self.total_locked.fetch_sub(amount, Ordering::SeqCst);
        self.pool.fetch_add(amount, Ordering::SeqCst);
        debug!("escrow: released {} drops from {} to pool", amount, operator);
        Ok(())
    }

    /// Release collateral from several operators at once, all or nothing.
    ///
    /// Amounts for the same operator are summed before the balance check, so
    /// an operator winning multiple slots cannot overdraw. Returns the total
    /// moved into the pool.
    pub fn release_batch(
        &self,
        auth: &EscrowAuthority,
        items: &[(OperatorId, u64)],
    ) -> Result<u64, EscrowError> {
        self.check_engine(auth)?;
        let mut required: HashMap<OperatorId, u64> = HashMap::new();
        for (operator, amount) in items {
            let need = required.entry(*operator).or_insert(0);
            *need = need.saturating_add(*amount);
        }

        let mut accounts = self.accounts.write();
        for (operator, need) in &required {
            let available = accounts.get(operator).copied().unwrap_or(0);
            if available < *need {
                return Err(EscrowError::InsufficientEscrowBalance {
                    required: *need,
                    available,
                });
            }
        }
        let mut total = 0u64;
        for (operator, need) in &required {
            if let Some(balance) = accounts.get_mut(operator) {
                *balance -= need;
            }
            total = total.saturating_add(*need);
        }
        drop(accounts);
        self.total_locked.fetch_sub(total, Ordering::SeqCst);
        self.pool.fetch_add(total, Ordering::SeqCst);
        debug!(
            "escrow: released {} drops from {} operators to pool",
            total,
            required.len()
        );
        Ok(total)
    }

    /// Return locked collateral to its operator, leaving custody
    pub fn refund(
        &self,
        auth: &EscrowAuthority,
        operator: OperatorId,
        amount: u64,
    ) -> Result<OperatorPayout, EscrowError> {
        self.check_engine(auth)?;
        let _guard = self.transfer_guard.lock();
        {
            let mut accounts = self.accounts.write();
            let balance =
                accounts
                    .get_mut(&operator)
                    .ok_or(EscrowError::InsufficientEscrowBalance {
                        required: amount,
                        available: 0,
                    })?;
            if *balance < amount {
                return Err(EscrowError::InsufficientEscrowBalance {
                    required: amount,
                    available: *balance,
                });
            }
            *balance -= amount;
        }
        self.total_locked.fetch_sub(amount, Ordering::SeqCst);
        debug!("escrow: refunded {} drops to {}", amount, operator);
        Ok(OperatorPayout { operator, amount })
    }

    /// Pay vault rewards out of the pool, leaving custody
    pub fn pay_from_pool(
        &self,
        auth: &PoolAuthority,
        vault: VaultId,
        amount: u64,
    ) -> Result<VaultPayout, EscrowError> {
        self.check_rewards(auth)?;
        let _guard = self.transfer_guard.lock();
        let available = self.pool.load(Ordering::SeqCst);
        if available < amount {
            return Err(EscrowError::InsufficientEscrowBalance {
                required: amount,
                available,
            });
        }
        self.pool.fetch_sub(amount, Ordering::SeqCst);
        debug!("escrow: paid {} drops from pool to vault {}", amount, vault);
        Ok(VaultPayout { vault, amount })
    }

    /// Move unconsumed credit value from the pool back into an operator's
    /// locked account
    pub fn return_to_account(
        &self,
        auth: &PoolAuthority,
        operator: OperatorId,
        amount: u64,
    ) -> Result<(), EscrowError> {
        self.check_rewards(auth)?;
        let _guard = self.transfer_guard.lock();
        let available = self.pool.load(Ordering::SeqCst);
        if available < amount {
            return Err(EscrowError::InsufficientEscrowBalance {
                required: amount,
                available,
            });
        }
        self.pool.fetch_sub(amount, Ordering::SeqCst);
        let mut accounts = self.accounts.write();
        let balance = accounts.entry(operator).or_insert(0);
        *balance = balance.saturating_add(amount);
        drop(accounts);
        self.total_locked.fetch_add(amount, Ordering::SeqCst);
        debug!("escrow: returned {} drops from pool to {}", amount, operator);
        Ok(())
    }

    /// Locked balance of one operator (zero if no account exists)
    pub fn balance_of(&self, operator: &OperatorId) -> u64 {
        self.accounts.read().get(operator).copied().unwrap_or(0)
    }

    /// Sum of all locked operator balances
    pub fn total_locked(&self) -> u64 {
        self.total_locked.load(Ordering::SeqCst)
    }

    /// Current reward pool balance
    pub fn pool_balance(&self) -> u64 {
        self.pool.load(Ordering::SeqCst)
    }

    /// Capture the full custody state
    pub fn snapshot(&self) -> EscrowSnapshot {
        let mut accounts: Vec<(OperatorId, u64)> = self
            .accounts
            .read()
            .iter()
            .map(|(operator, balance)| (*operator, *balance))
            .collect();
        accounts.sort_by_key(|(operator, _)| *operator);
        EscrowSnapshot {
            accounts,
            pool: self.pool.load(Ordering::SeqCst),
        }
    }

    /// Rebuild an escrow from a snapshot, minting fresh authority tokens
    pub fn restore(snapshot: EscrowSnapshot) -> (Self, EscrowAuthority, PoolAuthority) {
        let (escrow, engine_auth, pool_auth) = Self::new();
        let total: u64 = snapshot.accounts.iter().map(|(_, balance)| balance).sum();
        {
            let mut accounts = escrow.accounts.write();
            for (operator, balance) in snapshot.accounts {
                accounts.insert(operator, balance);
            }
        }
        escrow.total_locked.store(total, Ordering::SeqCst);
        escrow.pool.store(snapshot.pool, Ordering::SeqCst);
        (escrow, engine_auth, pool_auth)
    }
}

/// Serializable custody state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub accounts: Vec<(OperatorId, u64)>,
    pub pool: u64,
}

/// Escrow errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscrowError {
    #[error("Caller is not authorized for this escrow operation")]
    Unauthorized,

    #[error("Insufficient escrow balance: required {required}, available {available}")]
    InsufficientEscrowBalance { required: u64, available: u64 },
}
