use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::money::{Currency, Money};
use crate::domain::Account;

use super::uow::UowTx;

/// Errors that can occur during account repository operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found: {id}")]
    NotFound { id: Uuid },

    #[error("user {user_id} already holds a {currency} account")]
    Conflict { user_id: Uuid, currency: String },

    #[error("stored account {id} carries unknown currency {currency}")]
    Corrupt { id: Uuid, currency: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields for a new account; the balance starts at zero
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    user_id: Uuid,
    balance_minor: i64,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_account(self) -> Result<Account, AccountError> {
        let currency = Currency::get(&self.currency).map_err(|_| AccountError::Corrupt {
            id: self.id,
            currency: self.currency.clone(),
        })?;
        Ok(Account {
            id: self.id,
            user_id: self.user_id,
            balance: Money::new(self.balance_minor, currency),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, balance_minor, currency, created_at, updated_at FROM accounts";

/// Create an account.
///
/// Rejects with [`AccountError::Conflict`] when the user already holds an
/// account in the requested currency (unique index on `(user_id, currency)`).
pub async fn create(pool: &PgPool, new: &NewAccount) -> Result<Account, AccountError> {
    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        INSERT INTO accounts (id, user_id, balance_minor, currency)
        VALUES ($1, $2, 0, $3)
        RETURNING id, user_id, balance_minor, currency, created_at, updated_at
        "#,
    )
    .bind(new.id)
    .bind(new.user_id)
    .bind(new.currency.code())
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => AccountError::Conflict {
            user_id: new.user_id,
            currency: new.currency.code().to_string(),
        },
        _ => AccountError::Database(e),
    })?;

    row.into_account()
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Account, AccountError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.ok_or(AccountError::NotFound { id })?.into_account()
}

pub async fn get_tx(tx: &mut UowTx, id: Uuid) -> Result<Account, AccountError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

    row.ok_or(AccountError::NotFound { id })?.into_account()
}

/// Fetch an account and take a row lock on it for the rest of the
/// transaction. Balance writes go through this to prevent lost updates on
/// concurrent credits to the same account.
pub async fn lock_tx(tx: &mut UowTx, id: Uuid) -> Result<Account, AccountError> {
    let row =
        sqlx::query_as::<_, AccountRow>(&format!("{SELECT_COLUMNS} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

    row.ok_or(AccountError::NotFound { id })?.into_account()
}

/// Write a new balance for a locked account row.
///
/// The currency guard keeps a balance in the wrong currency from ever
/// reaching the row.
pub async fn update_balance_tx(
    tx: &mut UowTx,
    id: Uuid,
    balance: Money,
) -> Result<(), AccountError> {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET balance_minor = $2, updated_at = now()
        WHERE id = $1 AND currency = $3
        "#,
    )
    .bind(id)
    .bind(balance.minor())
    .bind(balance.currency().code())
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AccountError::NotFound { id });
    }
    Ok(())
}

pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Account>, AccountError> {
    let rows = sqlx::query_as::<_, AccountRow>(&format!(
        "{SELECT_COLUMNS} WHERE user_id = $1 ORDER BY created_at"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AccountRow::into_account).collect()
}
