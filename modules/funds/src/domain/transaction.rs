use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::Money;

/// Transaction status lifecycle: `created -> pending -> (completed | failed)`,
/// with payment-bearing flows crossing `initiated -> succeeded` in between.
///
/// `completed` and `failed` are terminal; every status update in the
/// repository is a compare-and-set against this lattice so redelivered
/// events become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Created,
    Pending,
    Initiated,
    Succeeded,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match self {
            Created => matches!(next, Pending | Initiated | Completed | Failed),
            Pending => matches!(next, Initiated | Completed | Failed),
            Initiated => matches!(next, Succeeded | Completed | Failed),
            Succeeded => matches!(next, Completed | Failed),
            Completed | Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Initiated => "initiated",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// Where the money entered or left the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "money_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MoneySource {
    Cash,
    BankAccount,
    Card,
    Wallet,
    Internal,
}

/// One financial movement against an account.
///
/// `amount` is signed: positive for deposits, negative for withdrawals and
/// transfer-outs. `balance_after` is the account balance immediately after
/// the transaction was applied, recorded in the same unit of work as the
/// balance write. `converted` holds the account-currency amount for
/// cross-currency flows. Transactions are never deleted; status updates are
/// the only mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub amount: Money,
    pub balance_after: Option<Money>,
    pub status: TransactionStatus,
    pub money_source: MoneySource,
    pub payment_id: Option<String>,
    pub converted: Option<Money>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// The signed, account-currency amount this transaction applies to the
    /// balance: the converted amount when the flow crossed currencies,
    /// carrying the sign of `amount`.
    pub fn settled_amount(&self) -> Result<Money, super::money::MoneyError> {
        let magnitude = match self.converted {
            Some(converted) => converted.abs()?,
            None => self.amount.abs()?,
        };
        if self.amount.is_negative() {
            magnitude.negate()
        } else {
            Ok(magnitude)
        }
    }
}
