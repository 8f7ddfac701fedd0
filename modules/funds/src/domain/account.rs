use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::money::{Currency, Money};
use super::DomainError;

/// A user's account in exactly one currency.
///
/// Mutated only through the account repository inside a unit of work; the
/// balance currency is the account currency by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn currency(&self) -> Currency {
        self.balance.currency()
    }

    /// Check that `user_id` owns this account and that `amount` can be
    /// withdrawn from it
    pub fn validate_withdraw(&self, user_id: Uuid, amount: Money) -> Result<(), DomainError> {
        if self.user_id != user_id {
            return Err(DomainError::NotAccountOwner);
        }
        if amount.currency() != self.currency() {
            return Err(DomainError::CurrencyMismatch {
                account: self.currency().code(),
                amount: amount.currency().code(),
            });
        }
        if !amount.is_positive() {
            return Err(DomainError::AmountNotPositive);
        }
        if amount.minor() > self.balance.minor() {
            return Err(DomainError::InsufficientFunds);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance_minor: i64) -> Account {
        Account {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            balance: Money::new(balance_minor, Currency::get("USD").unwrap()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    #[test]
    fn withdraw_within_balance_is_allowed() {
        let account = account(5_000);
        assert!(account.validate_withdraw(account.user_id, usd(5_000)).is_ok());
        assert!(account.validate_withdraw(account.user_id, usd(1)).is_ok());
    }

    #[test]
    fn withdraw_rejects_foreign_user() {
        let account = account(5_000);
        assert_eq!(
            account.validate_withdraw(Uuid::new_v4(), usd(100)),
            Err(DomainError::NotAccountOwner)
        );
    }

    #[test]
    fn withdraw_rejects_currency_mismatch() {
        let account = account(5_000);
        let eur = Money::new(100, Currency::get("EUR").unwrap());
        assert_eq!(
            account.validate_withdraw(account.user_id, eur),
            Err(DomainError::CurrencyMismatch {
                account: "USD",
                amount: "EUR"
            })
        );
    }

    #[test]
    fn withdraw_rejects_non_positive_amounts() {
        let account = account(5_000);
        assert_eq!(
            account.validate_withdraw(account.user_id, usd(0)),
            Err(DomainError::AmountNotPositive)
        );
        assert_eq!(
            account.validate_withdraw(account.user_id, usd(-100)),
            Err(DomainError::AmountNotPositive)
        );
    }

    #[test]
    fn withdraw_rejects_insufficient_funds() {
        let account = account(1_000);
        assert_eq!(
            account.validate_withdraw(account.user_id, usd(2_500)),
            Err(DomainError::InsufficientFunds)
        );
    }
}
