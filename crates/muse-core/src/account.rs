//! Token accounts and caller identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntryKind, LedgerEntry, MuseError, Result, UserId};

/// A user's token balance.
///
/// The balance only changes through ledger operations; the lifetime counters
/// are materialized alongside it so the account can be checked against the
/// entry log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    /// Owning user.
    pub user_id: UserId,

    /// Current balance in tokens. Never negative after a successful deduct.
    pub balance: i64,

    /// Lifetime tokens deducted for generations.
    pub lifetime_charged: i64,

    /// Lifetime tokens returned by refunds.
    pub lifetime_refunded: i64,

    /// Lifetime tokens granted (purchases, promotions, admin top-ups).
    pub lifetime_granted: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl TokenAccount {
    /// Create an empty account.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            lifetime_charged: 0,
            lifetime_refunded: 0,
            lifetime_granted: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether a deduction of `amount` would succeed.
    #[must_use]
    pub fn has_sufficient_tokens(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Apply `entry` to the balance and lifetime counters, and stamp
    /// `entry.balance_after`.
    ///
    /// Nothing changes when the entry is rejected.
    ///
    /// # Errors
    ///
    /// - `MuseError::InsufficientTokens` if a deduction exceeds the balance.
    /// - `MuseError::BalanceOverflow` if the balance or a lifetime counter
    ///   would leave the `i64` range.
    pub fn apply(&mut self, entry: &mut LedgerEntry) -> Result<()> {
        let amount = entry.amount();

        let (balance, counter) = match entry.kind {
            EntryKind::Deduction => {
                if !self.has_sufficient_tokens(amount) {
                    return Err(MuseError::InsufficientTokens {
                        balance: self.balance,
                        required: amount,
                    });
                }
                (
                    self.balance.checked_sub(amount),
                    self.lifetime_charged.checked_add(amount),
                )
            }
            EntryKind::Refund => (
                self.balance.checked_add(amount),
                self.lifetime_refunded.checked_add(amount),
            ),
            EntryKind::Grant => (
                self.balance.checked_add(amount),
                self.lifetime_granted.checked_add(amount),
            ),
        };
        let (Some(balance), Some(counter)) = (balance, counter) else {
            return Err(MuseError::BalanceOverflow {
                balance: self.balance,
                amount,
            });
        };

        match entry.kind {
            EntryKind::Deduction => self.lifetime_charged = counter,
            EntryKind::Refund => self.lifetime_refunded = counter,
            EntryKind::Grant => self.lifetime_granted = counter,
        }
        self.balance = balance;
        self.updated_at = Utc::now();
        entry.balance_after = self.balance;
        Ok(())
    }
}

/// The verified identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Verified user id.
    pub user_id: UserId,
    /// Admins bypass every limit and are never charged.
    pub is_admin: bool,
    /// Premium subscribers bypass free-tier limits.
    pub is_premium: bool,
}

impl Caller {
    /// A free-tier caller.
    #[must_use]
    pub const fn free(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
            is_premium: false,
        }
    }

    /// A premium caller.
    #[must_use]
    pub const fn premium(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
            is_premium: true,
        }
    }

    /// An admin caller.
    #[must_use]
    pub const fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
            is_premium: false,
        }
    }

    /// Effective plan tier. Admin wins over premium.
    #[must_use]
    pub const fn tier(&self) -> PlanTier {
        if self.is_admin {
            PlanTier::Admin
        } else if self.is_premium {
            PlanTier::Premium
        } else {
            PlanTier::Free
        }
    }
}

/// Effective plan tier of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Single clean images, limited per week.
    Free,
    /// Multi-image and unrestricted content, metered in tokens.
    Premium,
    /// Unmetered.
    Admin,
}

impl PlanTier {
    /// Whether free-tier restrictions apply.
    #[must_use]
    pub const fn is_restricted(self) -> bool {
        matches!(self, Self::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_is_empty() {
        let account = TokenAccount::new(UserId::generate());
        assert_eq!(account.balance, 0);
        assert_eq!(account.lifetime_charged, 0);
        assert!(account.has_sufficient_tokens(0));
        assert!(!account.has_sufficient_tokens(1));
    }

    #[test]
    fn apply_deduction_is_conditional() {
        let user_id = UserId::generate();
        let mut account = TokenAccount::new(user_id);
        let mut grant = LedgerEntry::grant(user_id, 50, "top-up", serde_json::Value::Null).unwrap();
        account.apply(&mut grant).unwrap();
        assert_eq!(grant.balance_after, 50);

        let mut charge = LedgerEntry::deduction(user_id, 20, "batch", None).unwrap();
        account.apply(&mut charge).unwrap();
        assert_eq!(account.balance, 30);
        assert_eq!(charge.balance_after, 30);

        let mut too_much = LedgerEntry::deduction(user_id, 40, "batch", None).unwrap();
        assert!(matches!(
            account.apply(&mut too_much),
            Err(MuseError::InsufficientTokens {
                balance: 30,
                required: 40
            })
        ));
        assert_eq!(account.balance, 30);
        assert_eq!(account.lifetime_charged, 20);
        assert_eq!(account.lifetime_granted, 50);
    }

    #[test]
    fn apply_rejects_overflow_without_change() {
        let user_id = UserId::generate();
        let mut account = TokenAccount::new(user_id);
        let mut grant = LedgerEntry::grant(user_id, 10, "top-up", serde_json::Value::Null).unwrap();
        account.apply(&mut grant).unwrap();

        let mut huge =
            LedgerEntry::grant(user_id, i64::MAX, "top-up", serde_json::Value::Null).unwrap();
        assert!(matches!(
            account.apply(&mut huge),
            Err(MuseError::BalanceOverflow {
                balance: 10,
                amount: i64::MAX
            })
        ));
        assert_eq!(account.balance, 10);
        assert_eq!(account.lifetime_granted, 10);
        assert_eq!(huge.balance_after, 0);

        let mut refund =
            LedgerEntry::refund(user_id, i64::MAX, "refund", None, serde_json::Value::Null)
                .unwrap();
        assert!(account.apply(&mut refund).is_err());
        assert_eq!(account.balance, 10);
        assert_eq!(account.lifetime_refunded, 0);
    }

    #[test]
    fn admin_flag_wins_over_premium() {
        let user_id = UserId::generate();
        let caller = Caller {
            user_id,
            is_admin: true,
            is_premium: true,
        };
        assert_eq!(caller.tier(), PlanTier::Admin);
        assert_eq!(Caller::premium(user_id).tier(), PlanTier::Premium);
        assert!(Caller::free(user_id).tier().is_restricted());
    }
}
