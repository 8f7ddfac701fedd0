//! Unit of work: begin -> work -> commit on `Ok`, rollback on `Err`.
//!
//! The closure receives the open transaction and fetches `_tx` repository
//! functions against it; nested steps pass the same `&mut` transaction down,
//! so they flatten into the outer transaction. Repository functions called
//! with a plain pool run auto-commit instead.

use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

/// An open unit-of-work transaction
pub type UowTx = Transaction<'static, Postgres>;

/// Run `work` inside one database transaction.
///
/// ```ignore
/// let account = uow::run(&pool, |tx| {
///     Box::pin(async move {
///         let account = account_repo::lock_tx(tx, id).await?;
///         account_repo::update_balance_tx(tx, id, balance).await?;
///         Ok(account)
///     })
/// })
/// .await?;
/// ```
pub async fn run<T, E, F>(pool: &PgPool, work: F) -> Result<T, E>
where
    E: From<sqlx::Error>,
    F: for<'t> FnOnce(&'t mut UowTx) -> BoxFuture<'t, Result<T, E>>,
{
    let mut tx = pool.begin().await.map_err(E::from)?;

    match work(&mut tx).await {
        Ok(value) => {
            tx.commit().await.map_err(E::from)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "unit-of-work rollback failed");
            }
            Err(e)
        }
    }
}
