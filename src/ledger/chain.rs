//! Ledger chain verification.

use thiserror::Error;

use crate::types::LedgerEntry;

/// The first place where an account's chain stops adding up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainBreak {
    /// `seq` does not follow the previous entry.
    #[error("expected seq {expected}, found {found}")]
    SeqGap { expected: i64, found: i64 },

    /// `balance_after` differs from previous balance plus signed delta.
    #[error("entry seq {seq}: expected balance_after {expected}, found {found}")]
    Balance { seq: i64, expected: i64, found: i64 },

    /// Entries from more than one account were passed in.
    #[error("entry seq {seq} belongs to a different account")]
    MixedAccounts { seq: i64 },
}

/// Checks that `entries` (one account, in chain order) satisfy the balance
/// invariant, starting from a zero balance.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<(), ChainBreak> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    let account = (first.user_id, first.channel);

    let mut balance = 0;
    for (expected_seq, entry) in (1..).zip(entries) {
        if (entry.user_id, entry.channel) != account {
            return Err(ChainBreak::MixedAccounts { seq: entry.seq });
        }
        if entry.seq != expected_seq {
            return Err(ChainBreak::SeqGap {
                expected: expected_seq,
                found: entry.seq,
            });
        }
        balance += entry.signed_delta();
        if entry.balance_after != balance {
            return Err(ChainBreak::Balance {
                seq: entry.seq,
                expected: balance,
                found: entry.balance_after,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, LedgerReason, UserId};
    use chrono::Utc;

    fn entry(seq: i64, reason: LedgerReason, amount: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            user_id: UserId(1),
            channel: Channel::Sms,
            seq,
            transaction_type: reason.transaction_type(),
            reason,
            amount,
            balance_after,
            reference: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_chain_is_valid() {
        assert_eq!(verify_chain(&[]), Ok(()));
    }

    #[test]
    fn confirm_is_a_zero_delta_receipt() {
        let entries = [
            entry(1, LedgerReason::GrantDefault, 10, 10),
            entry(2, LedgerReason::PreDeduct, 5, 5),
            entry(3, LedgerReason::ConfirmDeduct, 5, 5),
        ];
        assert_eq!(verify_chain(&entries), Ok(()));
    }

    #[test]
    fn double_charge_is_detected() {
        let entries = [
            entry(1, LedgerReason::GrantDefault, 10, 10),
            entry(2, LedgerReason::PreDeduct, 5, 5),
            entry(3, LedgerReason::ConfirmDeduct, 5, 0),
        ];
        assert_eq!(
            verify_chain(&entries),
            Err(ChainBreak::Balance {
                seq: 3,
                expected: 5,
                found: 0
            })
        );
    }

    #[test]
    fn seq_gap_is_detected() {
        let entries = [
            entry(1, LedgerReason::GrantDefault, 10, 10),
            entry(3, LedgerReason::PreDeduct, 5, 5),
        ];
        assert_eq!(
            verify_chain(&entries),
            Err(ChainBreak::SeqGap {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn mixed_accounts_are_rejected() {
        let mut voice = entry(2, LedgerReason::GrantDefault, 1, 11);
        voice.channel = Channel::Voice;
        let entries = [entry(1, LedgerReason::GrantDefault, 10, 10), voice];
        assert_eq!(
            verify_chain(&entries),
            Err(ChainBreak::MixedAccounts { seq: 2 })
        );
    }
}
