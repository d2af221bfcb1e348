//! Quota ledger entry types.
//!
//! The ledger is append-only: each entry records one balance change and the
//! balance that resulted from it. The latest entry for a `(user, channel)`
//! account is the current balance; there is no separately mutated wallet row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{TaskCode, UserId};

/// A delivery channel. Each channel is a separately metered account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Voice,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Channel::Sms),
            "voice" => Some(Channel::Voice),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Grant,
    Deduct,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Grant => "grant",
            TransactionType::Deduct => "deduct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(TransactionType::Grant),
            "deduct" => Some(TransactionType::Deduct),
            _ => None,
        }
    }
}

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Free quota granted when the account is first funded.
    GrantDefault,
    /// Purchased quota.
    GrantRecharge,
    /// Release of a reservation whose delivery did not complete.
    GrantRefund,
    /// Reservation made before attempting a delivery.
    PreDeduct,
    /// Settlement receipt for a reservation whose delivery succeeded.
    ConfirmDeduct,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::GrantDefault => "grant_default",
            LedgerReason::GrantRecharge => "grant_recharge",
            LedgerReason::GrantRefund => "grant_refund",
            LedgerReason::PreDeduct => "pre_deduct",
            LedgerReason::ConfirmDeduct => "confirm_deduct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant_default" => Some(LedgerReason::GrantDefault),
            "grant_recharge" => Some(LedgerReason::GrantRecharge),
            "grant_refund" => Some(LedgerReason::GrantRefund),
            "pre_deduct" => Some(LedgerReason::PreDeduct),
            "confirm_deduct" => Some(LedgerReason::ConfirmDeduct),
            _ => None,
        }
    }

    /// The transaction type every entry with this reason carries.
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            LedgerReason::GrantDefault | LedgerReason::GrantRecharge | LedgerReason::GrantRefund => {
                TransactionType::Grant
            }
            LedgerReason::PreDeduct | LedgerReason::ConfirmDeduct => TransactionType::Deduct,
        }
    }

    /// The effect an entry of `amount` with this reason has on the balance.
    ///
    /// `ConfirmDeduct` is a receipt for funds already reserved by
    /// `PreDeduct`, so it moves the balance by zero.
    pub fn signed_delta(&self, amount: i64) -> i64 {
        match self {
            LedgerReason::GrantDefault | LedgerReason::GrantRecharge | LedgerReason::GrantRefund => {
                amount
            }
            LedgerReason::PreDeduct => -amount,
            LedgerReason::ConfirmDeduct => 0,
        }
    }
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller-facing reasons for funding an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReason {
    Default,
    Recharge,
}

impl From<GrantReason> for LedgerReason {
    fn from(reason: GrantReason) -> Self {
        match reason {
            GrantReason::Default => LedgerReason::GrantDefault,
            GrantReason::Recharge => LedgerReason::GrantRecharge,
        }
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub channel: Channel,
    /// Position in the account's chain, starting at 1.
    pub seq: i64,
    pub transaction_type: TransactionType,
    pub reason: LedgerReason,
    /// Non-negative magnitude in minor currency units.
    pub amount: i64,
    pub balance_after: i64,
    /// The task this entry settles, if any.
    pub reference: Option<TaskCode>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// The entry's effect on the account balance.
    pub fn signed_delta(&self) -> i64 {
        self.reason.signed_delta(self.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_round_trip() {
        for reason in [
            LedgerReason::GrantDefault,
            LedgerReason::GrantRecharge,
            LedgerReason::GrantRefund,
            LedgerReason::PreDeduct,
            LedgerReason::ConfirmDeduct,
        ] {
            assert_eq!(LedgerReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(LedgerReason::parse("bonus"), None);
    }

    #[test]
    fn confirm_is_a_receipt_not_a_charge() {
        assert_eq!(LedgerReason::PreDeduct.signed_delta(5), -5);
        assert_eq!(LedgerReason::ConfirmDeduct.signed_delta(5), 0);
        assert_eq!(LedgerReason::GrantRefund.signed_delta(5), 5);
    }

    #[test]
    fn deduct_reasons_carry_deduct_type() {
        assert_eq!(
            LedgerReason::ConfirmDeduct.transaction_type(),
            TransactionType::Deduct
        );
        assert_eq!(
            LedgerReason::GrantRefund.transaction_type(),
            TransactionType::Grant
        );
    }

    #[test]
    fn channel_parse_rejects_unknown() {
        assert_eq!(Channel::parse("sms"), Some(Channel::Sms));
        assert_eq!(Channel::parse("voice"), Some(Channel::Voice));
        assert_eq!(Channel::parse("email"), None);
    }
}
