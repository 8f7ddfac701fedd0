use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::money::{Currency, Money};
use crate::domain::{MoneySource, Transaction, TransactionStatus};

use super::uow::UowTx;

/// Errors that can occur during transaction repository operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction not found: {id}")]
    NotFound { id: Uuid },

    #[error("no transaction carries payment id {payment_id}")]
    PaymentNotFound { payment_id: String },

    #[error("stored transaction {id} carries unknown currency {currency}")]
    Corrupt { id: Uuid, currency: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields for a new transaction row
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    /// Signed: positive for deposits, negative for withdrawals and
    /// transfer-outs
    pub amount: Money,
    pub status: TransactionStatus,
    pub money_source: MoneySource,
    pub balance_after: Option<Money>,
    pub converted: Option<Money>,
    pub payment_id: Option<String>,
}

impl NewTransaction {
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        account_id: Uuid,
        amount: Money,
        status: TransactionStatus,
        money_source: MoneySource,
    ) -> Self {
        Self {
            id,
            user_id,
            account_id,
            amount,
            status,
            money_source,
            balance_after: None,
            converted: None,
            payment_id: None,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    account_id: Uuid,
    amount_minor: i64,
    currency: String,
    balance_after_minor: Option<i64>,
    status: TransactionStatus,
    money_source: MoneySource,
    payment_id: Option<String>,
    converted_amount_minor: Option<i64>,
    converted_currency: Option<String>,
    created_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<Transaction, TransactionError> {
        let currency = self.resolve_currency(&self.currency.clone())?;
        let balance_after = self
            .balance_after_minor
            .map(|minor| Money::new(minor, currency));
        let converted = match (self.converted_amount_minor, &self.converted_currency) {
            (Some(minor), Some(code)) => Some(Money::new(minor, self.resolve_currency(code)?)),
            _ => None,
        };
        Ok(Transaction {
            id: self.id,
            user_id: self.user_id,
            account_id: self.account_id,
            amount: Money::new(self.amount_minor, currency),
            balance_after,
            status: self.status,
            money_source: self.money_source,
            payment_id: self.payment_id,
            converted,
            created_at: self.created_at,
        })
    }

    fn resolve_currency(&self, code: &str) -> Result<Currency, TransactionError> {
        Currency::get(code).map_err(|_| TransactionError::Corrupt {
            id: self.id,
            currency: code.to_string(),
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, account_id, amount_minor, currency, \
     balance_after_minor, status, money_source, payment_id, converted_amount_minor, \
     converted_currency, created_at FROM transactions";

/// Insert a transaction unless its id already exists.
///
/// `*Requested` handlers call this with the transaction id minted by the
/// command, so a redelivered request event does not create a second row.
/// Returns whether the row was inserted.
pub async fn insert_if_absent_tx(
    tx: &mut UowTx,
    new: &NewTransaction,
) -> Result<bool, TransactionError> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions
            (id, user_id, account_id, amount_minor, currency, balance_after_minor,
             status, money_source, payment_id, converted_amount_minor, converted_currency)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(new.id)
    .bind(new.user_id)
    .bind(new.account_id)
    .bind(new.amount.minor())
    .bind(new.amount.currency().code())
    .bind(new.balance_after.map(|m| m.minor()))
    .bind(new.status)
    .bind(new.money_source)
    .bind(new.payment_id.as_deref())
    .bind(new.converted.map(|m| m.minor()))
    .bind(new.converted.map(|m| m.currency().code()))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Transaction, TransactionError> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.ok_or(TransactionError::NotFound { id })?.into_transaction()
}

pub async fn get_tx(tx: &mut UowTx, id: Uuid) -> Result<Transaction, TransactionError> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

    row.ok_or(TransactionError::NotFound { id })?.into_transaction()
}

pub async fn get_by_payment_id(
    pool: &PgPool,
    payment_id: &str,
) -> Result<Transaction, TransactionError> {
    let row =
        sqlx::query_as::<_, TransactionRow>(&format!("{SELECT_COLUMNS} WHERE payment_id = $1"))
            .bind(payment_id)
            .fetch_optional(pool)
            .await?;

    row.ok_or_else(|| TransactionError::PaymentNotFound {
        payment_id: payment_id.to_string(),
    })?
    .into_transaction()
}

pub async fn get_by_payment_id_tx(
    tx: &mut UowTx,
    payment_id: &str,
) -> Result<Transaction, TransactionError> {
    let row =
        sqlx::query_as::<_, TransactionRow>(&format!("{SELECT_COLUMNS} WHERE payment_id = $1"))
            .bind(payment_id)
            .fetch_optional(&mut **tx)
            .await?;

    row.ok_or_else(|| TransactionError::PaymentNotFound {
        payment_id: payment_id.to_string(),
    })?
    .into_transaction()
}

/// Compare-and-set `created -> initiated`, attaching the provider payment id
/// and the converted amount. Returns whether the transition applied.
pub async fn mark_initiated_tx(
    tx: &mut UowTx,
    id: Uuid,
    payment_id: &str,
    converted: Option<Money>,
) -> Result<bool, TransactionError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'initiated', payment_id = $2,
            converted_amount_minor = $3, converted_currency = $4
        WHERE id = $1 AND status = 'created'
        "#,
    )
    .bind(id)
    .bind(payment_id)
    .bind(converted.map(|m| m.minor()))
    .bind(converted.map(|m| m.currency().code()))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-set a single status transition. Returns whether it applied.
pub async fn set_status_tx(
    tx: &mut UowTx,
    id: Uuid,
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<bool, TransactionError> {
    let result = sqlx::query("UPDATE transactions SET status = $3 WHERE id = $1 AND status = $2")
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Settle a transaction: compare-and-set the status and record the
/// post-apply balance (and converted amount, when the flow crossed
/// currencies). Returns whether the transition applied.
pub async fn record_settlement_tx(
    tx: &mut UowTx,
    id: Uuid,
    from: TransactionStatus,
    to: TransactionStatus,
    balance_after: Money,
    converted: Option<Money>,
) -> Result<bool, TransactionError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = $3, balance_after_minor = $4,
            converted_amount_minor = COALESCE($5, converted_amount_minor),
            converted_currency = COALESCE($6, converted_currency)
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(balance_after.minor())
    .bind(converted.map(|m| m.minor()))
    .bind(converted.map(|m| m.currency().code()))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a not-yet-terminal transaction failed. Returns whether a row
/// changed; terminal rows are left untouched.
pub async fn fail_if_active_tx(tx: &mut UowTx, id: Uuid) -> Result<bool, TransactionError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'failed'
        WHERE id = $1 AND status IN ('created', 'pending', 'initiated', 'succeeded')
        "#,
    )
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Latest transactions for an account, newest first, capped at 100
pub async fn list_for_account(
    pool: &PgPool,
    account_id: Uuid,
) -> Result<Vec<Transaction>, TransactionError> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        "{SELECT_COLUMNS} WHERE account_id = $1 ORDER BY created_at DESC LIMIT 100"
    ))
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(TransactionRow::into_transaction)
        .collect()
}
