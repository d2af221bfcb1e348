//! Prepaid quota ledger.
//!
//! Balances are never stored directly. Each `(user_id, channel)` account is
//! an append-only chain of [`LedgerEntry`] rows, and the latest entry's
//! `balance_after` is the balance.
//!
//! # Two-phase charging
//!
//! A delivery reserves its cost before sending and settles it afterwards:
//!
//! ```text
//! pre_deduct(5)        balance 10 → 5     (reservation)
//!   send succeeded  →  confirm_deduct(5)  balance 5 → 5   (receipt)
//!   send failed     →  grant_refund(5)    balance 5 → 10  (release)
//! ```
//!
//! The receipt has a signed delta of zero: the charge happened at
//! reservation time, and the receipt records that it became final.
//!
//! # Concurrency
//!
//! Every operation runs "read latest, then append" inside one IMMEDIATE
//! transaction (see [`crate::store::SqliteStore::write`]). The
//! `(user_id, channel, seq)` uniqueness constraint rejects any append that
//! was computed against a stale latest entry.
//!
//! [`LedgerEntry`]: crate::types::LedgerEntry

pub mod chain;
pub mod quota;

use thiserror::Error;

use crate::store::StoreError;
use crate::types::{Channel, UserId};

pub use chain::{ChainBreak, verify_chain};
pub use quota::QuotaLedger;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The account cannot cover the requested reservation.
    #[error("insufficient {channel} quota for user {user_id}: balance {balance}, requested {requested}")]
    Insufficient {
        user_id: UserId,
        channel: Channel,
        balance: i64,
        requested: i64,
    },

    /// Amounts are magnitudes and must be positive.
    #[error("ledger amount must be positive, got {0}")]
    InvalidAmount(i64),

    /// Underlying store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
