//! Transfer flow: same-user movement between two accounts, with conversion
//! into the destination currency.
//!
//! The settlement handler performs the whole domain operation inside one
//! unit of work: both account rows are locked (in stable id order, so
//! concurrent transfers cannot deadlock), the source is debited, the
//! destination credited with the converted amount, and both transaction
//! legs reach `completed` together.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use event_bus::{EventHandler, HandlerError};

use crate::domain::{Account, DomainError, MoneySource, TransactionStatus};
use crate::events::{
    flow_failed, ConversionRequested, FlowContext, FlowDetail, FlowEvent, TransferCompleted,
    TransferDomainOpDone, TransferRequested,
};
use crate::repos::account_repo::{self, AccountError};
use crate::repos::transaction_repo::{self, NewTransaction};
use crate::repos::uow::{self, UowTx};

use super::{emit, DynBus, StepError};

pub struct TransferRequestedHandler {
    pool: PgPool,
    bus: DynBus,
}

impl TransferRequestedHandler {
    pub fn new(pool: PgPool, bus: DynBus) -> Self {
        Self { pool, bus }
    }

    async fn load_account(
        &self,
        id: Uuid,
        role: &'static str,
    ) -> Result<Result<Account, String>, HandlerError> {
        match account_repo::get(&self.pool, id).await {
            Ok(account) => Ok(Ok(account)),
            Err(AccountError::NotFound { .. }) => Ok(Err(format!("{role} account not found"))),
            Err(AccountError::Corrupt { .. }) => {
                Ok(Err(format!("{role} account record is invalid")))
            }
            Err(e) => Err(HandlerError::transient(e)),
        }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for TransferRequestedHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::TransferRequested(request) = event else {
            debug!("transfer handler ignoring unrelated event");
            return Ok(());
        };
        let flow = request.flow.clone();

        info!(
            correlation_id = %flow.correlation_id,
            source_account = %flow.account_id,
            destination_account = %request.destination_account_id,
            amount = %request.amount,
            "transfer requested"
        );

        let transaction_id = match validate(&request) {
            Ok(id) => id,
            Err(reason) => {
                warn!(correlation_id = %flow.correlation_id, reason = %reason, "transfer rejected");
                return emit(&self.bus, flow_failed(&flow, reason)).await;
            }
        };

        let source = match self.load_account(flow.account_id, "source").await? {
            Ok(account) => account,
            Err(reason) => return emit(&self.bus, flow_failed(&flow, reason)).await,
        };
        let destination = match self
            .load_account(request.destination_account_id, "destination")
            .await?
        {
            Ok(account) => account,
            Err(reason) => return emit(&self.bus, flow_failed(&flow, reason)).await,
        };

        if destination.user_id != flow.user_id {
            return emit(
                &self.bus,
                flow_failed(&flow, "destination account belongs to another user"),
            )
            .await;
        }
        if let Err(rule) = source.validate_withdraw(flow.user_id, request.amount) {
            return emit(&self.bus, flow_failed(&flow, rule.to_string())).await;
        }

        let Ok(negated) = request.amount.negate() else {
            return emit(&self.bus, flow_failed(&flow, "amount overflow")).await;
        };
        let record = NewTransaction::new(
            transaction_id,
            flow.user_id,
            flow.account_id,
            negated,
            TransactionStatus::Pending,
            MoneySource::Internal,
        );
        let inserted = uow::run::<_, StepError, _>(&self.pool, |tx| {
            Box::pin(async move { Ok(transaction_repo::insert_if_absent_tx(tx, &record).await?) })
        })
        .await?;
        if !inserted {
            debug!(
                correlation_id = %flow.correlation_id,
                transaction_id = %transaction_id,
                "transaction already recorded, continuing redelivered flow"
            );
        }

        emit(
            &self.bus,
            FlowEvent::ConversionRequested(ConversionRequested {
                flow: flow.clone(),
                amount: request.amount,
                to: destination.currency(),
                detail: FlowDetail::Transfer {
                    destination_account_id: request.destination_account_id,
                },
            }),
        )
        .await
    }
}

fn validate(request: &TransferRequested) -> Result<Uuid, String> {
    if request.flow.user_id.is_nil() {
        return Err("user id is required".to_string());
    }
    if request.flow.account_id.is_nil() {
        return Err("source account id is required".to_string());
    }
    if request.destination_account_id.is_nil() {
        return Err("destination account id is required".to_string());
    }
    if request.destination_account_id == request.flow.account_id {
        return Err(DomainError::SelfTransfer.to_string());
    }
    if !request.amount.is_positive() {
        return Err(DomainError::AmountNotPositive.to_string());
    }
    request
        .flow
        .transaction_id
        .ok_or_else(|| "transaction id is required".to_string())
}

enum Settlement {
    Applied(FlowEvent),
    AlreadySettled,
}

/// Applies `transfer.domain_done`: the one unit of work that moves money
/// between the two accounts.
pub struct TransferSettlementHandler {
    pool: PgPool,
    bus: DynBus,
}

impl TransferSettlementHandler {
    pub fn new(pool: PgPool, bus: DynBus) -> Self {
        Self { pool, bus }
    }
}

/// Lock both rows in ascending id order, then hand them back as
/// (source, destination)
async fn lock_pair(
    tx: &mut UowTx,
    source_id: Uuid,
    destination_id: Uuid,
) -> Result<(Account, Account), AccountError> {
    let (first_id, second_id) = if source_id <= destination_id {
        (source_id, destination_id)
    } else {
        (destination_id, source_id)
    };
    let first = account_repo::lock_tx(tx, first_id).await?;
    let second = account_repo::lock_tx(tx, second_id).await?;

    if first.id == source_id {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for TransferSettlementHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::TransferDomainOpDone(op) = event else {
            debug!("transfer settlement handler ignoring unrelated event");
            return Ok(());
        };
        let flow = op.flow.clone();
        let Some(transaction_id) = flow.transaction_id else {
            warn!(correlation_id = %flow.correlation_id, "transfer.domain_done without transaction id");
            return Ok(());
        };

        let outcome = uow::run::<_, StepError, _>(&self.pool, |tx| {
            Box::pin(async move {
                settle(tx, &flow, transaction_id, op).await
            })
        })
        .await?;

        match outcome {
            Settlement::Applied(terminal) => {
                info!(
                    correlation_id = %terminal.context().correlation_id,
                    "transfer settled"
                );
                emit(&self.bus, terminal).await
            }
            Settlement::AlreadySettled => {
                debug!("transfer already settled, acknowledging redelivery");
                Ok(())
            }
        }
    }
}

async fn settle(
    tx: &mut UowTx,
    flow: &FlowContext,
    transaction_id: Uuid,
    op: TransferDomainOpDone,
) -> Result<Settlement, StepError> {
    let (source, destination) =
        match lock_pair(tx, flow.account_id, op.destination_account_id).await {
            Ok(pair) => pair,
            Err(AccountError::NotFound { id }) => {
                transaction_repo::fail_if_active_tx(tx, transaction_id).await?;
                return Ok(Settlement::Applied(flow_failed(
                    flow,
                    format!("account {id} not found"),
                )));
            }
            Err(e) => return Err(e.into()),
        };

    let txn = transaction_repo::get_tx(tx, transaction_id).await?;
    if txn.status.is_terminal() {
        return Ok(Settlement::AlreadySettled);
    }

    // Re-validate under the lock: balances may have moved since the
    // requested-stage check
    if source.balance.currency() != op.amount.currency() {
        transaction_repo::fail_if_active_tx(tx, transaction_id).await?;
        return Ok(Settlement::Applied(flow_failed(
            flow,
            format!(
                "currency mismatch: account holds {}, amount is {}",
                source.balance.currency(),
                op.amount.currency()
            ),
        )));
    }
    if source.balance.minor() < op.amount.minor() {
        transaction_repo::fail_if_active_tx(tx, transaction_id).await?;
        return Ok(Settlement::Applied(flow_failed(
            flow,
            DomainError::InsufficientFunds.to_string(),
        )));
    }

    let new_source_balance = source.balance.checked_sub(op.amount)?;
    let new_destination_balance = destination.balance.checked_add(op.converted)?;

    let moved = transaction_repo::record_settlement_tx(
        tx,
        transaction_id,
        TransactionStatus::Pending,
        TransactionStatus::Completed,
        new_source_balance,
        Some(op.converted),
    )
    .await?;
    if !moved {
        return Ok(Settlement::AlreadySettled);
    }

    account_repo::update_balance_tx(tx, source.id, new_source_balance).await?;
    account_repo::update_balance_tx(tx, destination.id, new_destination_balance).await?;

    // Inbound leg id is derived from the outbound one, so a replayed
    // settlement cannot create a second credit
    let mut inbound = NewTransaction::new(
        Uuid::new_v5(&transaction_id, b"transfer-in"),
        flow.user_id,
        destination.id,
        op.converted,
        TransactionStatus::Completed,
        MoneySource::Internal,
    );
    inbound.balance_after = Some(new_destination_balance);
    transaction_repo::insert_if_absent_tx(tx, &inbound).await?;

    Ok(Settlement::Applied(FlowEvent::TransferCompleted(
        TransferCompleted {
            flow: flow.clone(),
            amount: op.amount,
            converted: op.converted,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, Money};
    use crate::events::{types, FlowType};
    use crate::workflows::testing::{lazy_pool, CaptureHandler};
    use event_bus::{EventBus, MemoryBus};
    use std::sync::Arc;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    fn request(amount: Money) -> TransferRequested {
        TransferRequested {
            flow: FlowContext {
                flow_type: FlowType::Transfer,
                correlation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                account_id: Uuid::new_v4(),
                transaction_id: Some(Uuid::new_v4()),
            },
            amount,
            destination_account_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn self_transfer_is_rejected() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let (capture, seen) = CaptureHandler::new();
        bus.register(types::TRANSFER_FAILED, capture).await.unwrap();

        let handler = TransferRequestedHandler::new(lazy_pool(), bus.clone());
        let mut request = request(usd(3_000));
        request.destination_account_id = request.flow.account_id;

        handler
            .handle(FlowEvent::TransferRequested(request))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let FlowEvent::TransferFailed(failed) = &seen[0] else {
            panic!("expected transfer.failed");
        };
        assert_eq!(
            failed.reason,
            "transfer source and destination are the same account"
        );
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let (capture, seen) = CaptureHandler::new();
        bus.register(types::TRANSFER_FAILED, capture).await.unwrap();

        let handler = TransferRequestedHandler::new(lazy_pool(), bus.clone());
        handler
            .handle(FlowEvent::TransferRequested(request(usd(0))))
            .await
            .unwrap();

        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [FlowEvent::TransferFailed(_)]
        ));
    }
}
