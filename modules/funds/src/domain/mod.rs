//! Domain entities and value types

pub mod account;
pub mod money;
pub mod transaction;

pub use account::Account;
pub use money::{Currency, Money, MoneyError};
pub use transaction::{MoneySource, Transaction, TransactionStatus};

use serde::{Deserialize, Serialize};

/// Business-rule violations surfaced to flows as `*Failed` events
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("account does not belong to user")]
    NotAccountOwner,

    #[error("currency mismatch: account holds {account}, amount is {amount}")]
    CurrencyMismatch {
        account: &'static str,
        amount: &'static str,
    },

    #[error("amount must be positive")]
    AmountNotPositive,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("transfer source and destination are the same account")]
    SelfTransfer,
}

/// Destination of an external payout.
///
/// At least one field must be non-empty; enforced at command construction
/// before the first event of the flow is emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
}

impl ExternalTarget {
    pub fn is_empty(&self) -> bool {
        fn blank(field: &Option<String>) -> bool {
            field.as_deref().map(str::trim).unwrap_or("").is_empty()
        }
        blank(&self.bank_account) && blank(&self.routing_number) && blank(&self.wallet_address)
    }

    /// The money source a payout through this target is recorded under
    pub fn money_source(&self) -> MoneySource {
        if self.wallet_address.is_some() {
            MoneySource::Wallet
        } else {
            MoneySource::BankAccount
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_with_no_fields_is_empty() {
        assert!(ExternalTarget::default().is_empty());
        assert!(ExternalTarget {
            bank_account: Some("   ".to_string()),
            ..ExternalTarget::default()
        }
        .is_empty());
    }

    #[test]
    fn target_with_any_field_is_not_empty() {
        assert!(!ExternalTarget {
            bank_account: Some("DE89370400440532013000".to_string()),
            ..ExternalTarget::default()
        }
        .is_empty());
        assert!(!ExternalTarget {
            wallet_address: Some("0xabc".to_string()),
            ..ExternalTarget::default()
        }
        .is_empty());
    }

    #[test]
    fn wallet_target_maps_to_wallet_source() {
        let target = ExternalTarget {
            wallet_address: Some("0xabc".to_string()),
            ..ExternalTarget::default()
        };
        assert_eq!(target.money_source(), MoneySource::Wallet);

        let target = ExternalTarget {
            bank_account: Some("acct".to_string()),
            ..ExternalTarget::default()
        };
        assert_eq!(target.money_source(), MoneySource::BankAccount);
    }
}
