//! Quota operations.
//!
//! The `*_in` functions run against a caller-supplied connection so the task
//! engine can combine a ledger mutation and a task update in one
//! transaction. [`QuotaLedger`] wraps each of them in its own transaction.

use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::store::ledger::{self as entries, EntryDraft};
use crate::store::SqliteStore;
use crate::types::{Channel, GrantReason, LedgerEntry, LedgerReason, TaskCode, UserId};

use super::{QuotaError, Result};

fn check_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(QuotaError::InvalidAmount(amount));
    }
    Ok(())
}

fn append_after_latest(
    conn: &Connection,
    user_id: UserId,
    channel: Channel,
    reason: LedgerReason,
    amount: i64,
    reference: Option<&TaskCode>,
) -> Result<LedgerEntry> {
    check_amount(amount)?;
    let latest = entries::latest(conn, user_id, channel)?;
    let draft = EntryDraft {
        user_id,
        channel,
        reason,
        amount,
        reference: reference.cloned(),
    };
    Ok(entries::append(conn, latest.as_ref(), &draft)?)
}

/// Reserves `amount`, failing if the balance cannot cover it.
pub fn pre_deduct_in(
    conn: &Connection,
    user_id: UserId,
    channel: Channel,
    amount: i64,
    reference: Option<&TaskCode>,
) -> Result<LedgerEntry> {
    check_amount(amount)?;
    let latest = entries::latest(conn, user_id, channel)?;
    let balance = latest.as_ref().map_or(0, |e| e.balance_after);
    if balance < amount {
        return Err(QuotaError::Insufficient {
            user_id,
            channel,
            balance,
            requested: amount,
        });
    }
    let draft = EntryDraft {
        user_id,
        channel,
        reason: LedgerReason::PreDeduct,
        amount,
        reference: reference.cloned(),
    };
    Ok(entries::append(conn, latest.as_ref(), &draft)?)
}

/// Records that a reservation of `amount` became a final charge.
pub fn confirm_in(
    conn: &Connection,
    user_id: UserId,
    channel: Channel,
    amount: i64,
    reference: Option<&TaskCode>,
) -> Result<LedgerEntry> {
    append_after_latest(
        conn,
        user_id,
        channel,
        LedgerReason::ConfirmDeduct,
        amount,
        reference,
    )
}

/// Returns a reservation of `amount` to the balance.
pub fn refund_in(
    conn: &Connection,
    user_id: UserId,
    channel: Channel,
    amount: i64,
    reference: Option<&TaskCode>,
) -> Result<LedgerEntry> {
    append_after_latest(
        conn,
        user_id,
        channel,
        LedgerReason::GrantRefund,
        amount,
        reference,
    )
}

/// Adds funds to an account.
pub fn grant_in(
    conn: &Connection,
    user_id: UserId,
    channel: Channel,
    amount: i64,
    reason: GrantReason,
) -> Result<LedgerEntry> {
    append_after_latest(conn, user_id, channel, reason.into(), amount, None)
}

/// The ledger service.
///
/// Cheap to clone; clones share the store.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    store: SqliteStore,
}

impl QuotaLedger {
    pub fn new(store: SqliteStore) -> Self {
        QuotaLedger { store }
    }

    /// Reserves `amount` from the account.
    ///
    /// Fails with [`QuotaError::Insufficient`] (and writes nothing) when the
    /// balance is below `amount`.
    #[instrument(skip_all, fields(user = %user_id, %channel, amount))]
    pub fn pre_deduct(&self, user_id: UserId, channel: Channel, amount: i64) -> Result<LedgerEntry> {
        let entry = self
            .store
            .write(|tx| pre_deduct_in(tx, user_id, channel, amount, None))?;
        debug!(balance = entry.balance_after, "reserved quota");
        Ok(entry)
    }

    /// Confirms a previous reservation of `amount`. The balance is unchanged.
    #[instrument(skip_all, fields(user = %user_id, %channel, amount))]
    pub fn confirm_deduction(
        &self,
        user_id: UserId,
        channel: Channel,
        amount: i64,
    ) -> Result<LedgerEntry> {
        self.store
            .write(|tx| confirm_in(tx, user_id, channel, amount, None))
    }

    /// Releases a previous reservation of `amount`.
    #[instrument(skip_all, fields(user = %user_id, %channel, amount))]
    pub fn refund(&self, user_id: UserId, channel: Channel, amount: i64) -> Result<LedgerEntry> {
        let entry = self
            .store
            .write(|tx| refund_in(tx, user_id, channel, amount, None))?;
        debug!(balance = entry.balance_after, "refunded quota");
        Ok(entry)
    }

    /// Funds an account.
    #[instrument(skip_all, fields(user = %user_id, %channel, amount))]
    pub fn grant(
        &self,
        user_id: UserId,
        channel: Channel,
        amount: i64,
        reason: GrantReason,
    ) -> Result<LedgerEntry> {
        let entry = self
            .store
            .write(|tx| grant_in(tx, user_id, channel, amount, reason))?;
        info!(balance = entry.balance_after, "granted quota");
        Ok(entry)
    }

    /// Grants the default allowance to an account that has never had an entry.
    ///
    /// Returns true if it granted.
    #[instrument(skip_all, fields(user = %user_id, %channel, amount))]
    pub fn ensure_default_grant(
        &self,
        user_id: UserId,
        channel: Channel,
        amount: i64,
    ) -> Result<bool> {
        self.store.write(|tx| -> Result<bool> {
            if entries::latest(tx, user_id, channel)?.is_some() {
                return Ok(false);
            }
            grant_in(tx, user_id, channel, amount, GrantReason::Default)?;
            Ok(true)
        })
    }

    /// Returns the account's current balance.
    pub fn balance(&self, user_id: UserId, channel: Channel) -> Result<i64> {
        Ok(self
            .store
            .read(|conn| entries::balance(conn, user_id, channel))?)
    }

    /// Returns every entry of the account in chain order.
    pub fn history(&self, user_id: UserId, channel: Channel) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .store
            .read(|conn| entries::entries(conn, user_id, channel))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::verify_chain;
    use crate::types::TransactionType;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    const USER: UserId = UserId(42);

    fn funded(balance: i64) -> QuotaLedger {
        let ledger = QuotaLedger::new(SqliteStore::open_in_memory().unwrap());
        if balance > 0 {
            ledger
                .grant(USER, Channel::Sms, balance, GrantReason::Default)
                .unwrap();
        }
        ledger
    }

    #[test]
    fn reservation_then_confirmation_charges_once() {
        let ledger = funded(10);

        let reserved = ledger.pre_deduct(USER, Channel::Sms, 5).unwrap();
        assert_eq!(reserved.balance_after, 5);
        assert_eq!(reserved.transaction_type, TransactionType::Deduct);

        let receipt = ledger.confirm_deduction(USER, Channel::Sms, 5).unwrap();
        assert_eq!(receipt.reason, LedgerReason::ConfirmDeduct);
        assert_eq!(receipt.amount, 5);
        assert_eq!(receipt.balance_after, 5);
        assert_eq!(ledger.balance(USER, Channel::Sms).unwrap(), 5);
    }

    #[test]
    fn refund_restores_balance_exactly() {
        let ledger = funded(10);
        ledger.pre_deduct(USER, Channel::Sms, 5).unwrap();
        let refund = ledger.refund(USER, Channel::Sms, 5).unwrap();
        assert_eq!(refund.reason, LedgerReason::GrantRefund);
        assert_eq!(refund.transaction_type, TransactionType::Grant);
        assert_eq!(ledger.balance(USER, Channel::Sms).unwrap(), 10);
    }

    #[test]
    fn insufficient_balance_writes_nothing() {
        let ledger = funded(3);
        let err = ledger.pre_deduct(USER, Channel::Sms, 5).unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Insufficient {
                balance: 3,
                requested: 5,
                ..
            }
        ));
        assert_eq!(ledger.history(USER, Channel::Sms).unwrap().len(), 1);
    }

    #[test]
    fn empty_account_is_insufficient() {
        let ledger = funded(0);
        assert!(matches!(
            ledger.pre_deduct(USER, Channel::Voice, 1),
            Err(QuotaError::Insufficient { balance: 0, .. })
        ));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let ledger = funded(10);
        for amount in [0, -5] {
            assert!(matches!(
                ledger.pre_deduct(USER, Channel::Sms, amount),
                Err(QuotaError::InvalidAmount(a)) if a == amount
            ));
            assert!(matches!(
                ledger.refund(USER, Channel::Sms, amount),
                Err(QuotaError::InvalidAmount(_))
            ));
        }
        assert_eq!(ledger.history(USER, Channel::Sms).unwrap().len(), 1);
    }

    #[test]
    fn default_grant_only_once() {
        let ledger = funded(0);
        assert!(ledger.ensure_default_grant(USER, Channel::Sms, 10).unwrap());
        assert!(!ledger.ensure_default_grant(USER, Channel::Sms, 10).unwrap());
        assert_eq!(ledger.balance(USER, Channel::Sms).unwrap(), 10);
        let history = ledger.history(USER, Channel::Sms).unwrap();
        assert_eq!(history[0].reason, LedgerReason::GrantDefault);
    }

    #[test]
    fn references_are_recorded() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ledger = QuotaLedger::new(store.clone());
        ledger
            .grant(USER, Channel::Sms, 10, GrantReason::Recharge)
            .unwrap();
        let code = TaskCode::new("journey_timeout:5");
        store
            .write(|tx| {
                pre_deduct_in(tx, USER, Channel::Sms, 5, Some(&code))?;
                confirm_in(tx, USER, Channel::Sms, 5, Some(&code))
            })
            .unwrap();

        let referenced = store
            .read(|conn| entries::entries_for_reference(conn, &code))
            .unwrap();
        let reasons: Vec<_> = referenced.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![LedgerReason::PreDeduct, LedgerReason::ConfirmDeduct]
        );
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let ledger = QuotaLedger::new(SqliteStore::open(&path).unwrap());
        ledger
            .grant(USER, Channel::Sms, 50, GrantReason::Default)
            .unwrap();

        // Separate connections, so serialization comes from SQLite itself.
        let ledgers: Vec<_> = (0..8)
            .map(|_| QuotaLedger::new(SqliteStore::open(&path).unwrap()))
            .collect();
        let successes = Arc::new(std::sync::atomic::AtomicI64::new(0));

        let handles: Vec<_> = ledgers
            .into_iter()
            .map(|ledger| {
                let successes = Arc::clone(&successes);
                thread::spawn(move || {
                    for _ in 0..5 {
                        match ledger.pre_deduct(USER, Channel::Sms, 3) {
                            Ok(_) => {
                                successes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            }
                            Err(QuotaError::Insufficient { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reserved = successes.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(reserved, 16);
        assert_eq!(ledger.balance(USER, Channel::Sms).unwrap(), 50 - 3 * reserved);
        verify_chain(&ledger.history(USER, Channel::Sms).unwrap()).unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Grant(i64),
        PreDeduct(i64),
        Confirm(i64),
        Refund(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1..20i64).prop_map(Op::Grant),
            (1..20i64).prop_map(Op::PreDeduct),
            (1..20i64).prop_map(Op::Confirm),
            (1..20i64).prop_map(Op::Refund),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chain_invariant_holds_for_any_sequence(ops in prop::collection::vec(op(), 0..30)) {
            let ledger = funded(0);
            let mut expected = 0i64;
            for op in ops {
                match op {
                    Op::Grant(n) => {
                        ledger.grant(USER, Channel::Sms, n, GrantReason::Recharge).unwrap();
                        expected += n;
                    }
                    Op::PreDeduct(n) => match ledger.pre_deduct(USER, Channel::Sms, n) {
                        Ok(_) => expected -= n,
                        Err(QuotaError::Insufficient { balance, .. }) => {
                            prop_assert_eq!(balance, expected);
                            prop_assert!(balance < n);
                        }
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    },
                    Op::Confirm(n) => {
                        ledger.confirm_deduction(USER, Channel::Sms, n).unwrap();
                    }
                    Op::Refund(n) => {
                        ledger.refund(USER, Channel::Sms, n).unwrap();
                        expected += n;
                    }
                }
            }

            prop_assert_eq!(ledger.balance(USER, Channel::Sms).unwrap(), expected);
            prop_assert!(expected >= 0);
            let history = ledger.history(USER, Channel::Sms).unwrap();
            prop_assert_eq!(verify_chain(&history), Ok(()));
        }
    }
}
