//! Payment stages shared by the deposit and withdraw flows.
//!
//! Initiation calls the provider; the `payment.initiated` handler pins the
//! provider payment id and the converted amount onto the transaction; the
//! settlement handler reacts to the webhook-derived `payment.completed` /
//! `payment.failed` events, applying the balance change and the terminal
//! status inside one unit of work. Every status write is a compare-and-set,
//! so redelivered events settle into no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use event_bus::{EventHandler, HandlerError};

use crate::domain::{DomainError, TransactionStatus};
use crate::events::{
    flow_failed, DepositCompleted, FlowEvent, FlowType, PaymentInitiated, WithdrawCompleted,
};
use crate::providers::PaymentProvider;
use crate::repos::{account_repo, transaction_repo, uow};

use super::{emit, DynBus, StepError};

pub struct PaymentInitiationHandler {
    pool: PgPool,
    payments: Arc<dyn PaymentProvider>,
    bus: DynBus,
}

impl PaymentInitiationHandler {
    pub fn new(pool: PgPool, payments: Arc<dyn PaymentProvider>, bus: DynBus) -> Self {
        Self { pool, payments, bus }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for PaymentInitiationHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::PaymentInitiation(request) = event else {
            debug!("payment initiation handler ignoring unrelated event");
            return Ok(());
        };
        let flow = request.flow.clone();

        match self
            .payments
            .initiate_payment(flow.user_id, flow.account_id, request.amount)
            .await
        {
            Ok(payment_id) => {
                info!(
                    correlation_id = %flow.correlation_id,
                    payment_id = %payment_id,
                    amount = %request.amount,
                    "payment initiated with provider"
                );
                emit(
                    &self.bus,
                    FlowEvent::PaymentInitiated(PaymentInitiated {
                        flow,
                        payment_id,
                        amount: request.amount,
                    }),
                )
                .await
            }
            Err(e) if e.is_transient() => Err(HandlerError::transient(format!(
                "payment initiation failed: {e}"
            ))),
            Err(e) => {
                warn!(
                    correlation_id = %flow.correlation_id,
                    error = %e,
                    "payment rejected by provider"
                );
                if let Some(transaction_id) = flow.transaction_id {
                    let marked = uow::run::<_, StepError, _>(&self.pool, |tx| {
                        Box::pin(async move {
                            Ok(transaction_repo::fail_if_active_tx(tx, transaction_id).await?)
                        })
                    })
                    .await;
                    if let Err(db_err) = marked {
                        warn!(
                            correlation_id = %flow.correlation_id,
                            transaction_id = %transaction_id,
                            error = %db_err,
                            "could not mark transaction failed after provider rejection"
                        );
                    }
                }
                emit(&self.bus, flow_failed(&flow, e.to_string())).await
            }
        }
    }
}

/// Pins the provider payment id onto the transaction: CAS
/// `created -> initiated`. Emits nothing; the flow resumes when the
/// provider webhook arrives.
pub struct PaymentInitiatedHandler {
    pool: PgPool,
}

impl PaymentInitiatedHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for PaymentInitiatedHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::PaymentInitiated(initiated) = event else {
            debug!("payment initiated handler ignoring unrelated event");
            return Ok(());
        };
        let flow = initiated.flow.clone();
        let Some(transaction_id) = flow.transaction_id else {
            warn!(correlation_id = %flow.correlation_id, "payment.initiated without transaction id");
            return Ok(());
        };

        let payment_id = initiated.payment_id.clone();
        let amount = initiated.amount;

        uow::run::<_, StepError, _>(&self.pool, |tx| {
            Box::pin(async move {
                let applied = transaction_repo::mark_initiated_tx(
                    tx,
                    transaction_id,
                    &payment_id,
                    Some(amount),
                )
                .await?;
                if !applied {
                    let existing = transaction_repo::get_tx(tx, transaction_id).await?;
                    if existing.status == TransactionStatus::Initiated
                        && existing.payment_id.as_deref() == Some(payment_id.as_str())
                    {
                        debug!(
                            transaction_id = %transaction_id,
                            "transaction already initiated, redelivery is a no-op"
                        );
                    } else {
                        warn!(
                            transaction_id = %transaction_id,
                            status = existing.status.as_str(),
                            "payment.initiated arrived for a transaction outside 'created'"
                        );
                    }
                }
                Ok(())
            })
        })
        .await?;

        info!(
            correlation_id = %flow.correlation_id,
            transaction_id = %transaction_id,
            payment_id = %initiated.payment_id,
            "transaction initiated"
        );
        Ok(())
    }
}

enum Settlement {
    Applied(FlowEvent),
    AlreadySettled,
}

/// Applies webhook outcomes: credits or debits the account and moves the
/// transaction to its terminal status, all inside one unit of work.
pub struct PaymentSettlementHandler {
    pool: PgPool,
    bus: DynBus,
}

impl PaymentSettlementHandler {
    pub fn new(pool: PgPool, bus: DynBus) -> Self {
        Self { pool, bus }
    }

    async fn settle_completed(
        &self,
        flow: crate::events::FlowContext,
        payment_id: String,
    ) -> Result<Settlement, StepError> {
        uow::run(&self.pool, |tx| {
            Box::pin(async move {
                let located = transaction_repo::get_by_payment_id_tx(tx, &payment_id).await?;
                if located.status.is_terminal() {
                    return Ok(Settlement::AlreadySettled);
                }

                // The account row lock is the serialization point; the
                // transaction is re-read under it before the CAS.
                let account = account_repo::lock_tx(tx, located.account_id).await?;
                let txn = transaction_repo::get_tx(tx, located.id).await?;
                if txn.status.is_terminal() {
                    return Ok(Settlement::AlreadySettled);
                }

                let applied_amount = txn.settled_amount()?;
                let new_balance = account.balance.checked_add(applied_amount)?;
                if new_balance.is_negative() {
                    // The account was spent down while the payout was in
                    // flight; fail the flow instead of overdrawing.
                    transaction_repo::fail_if_active_tx(tx, txn.id).await?;
                    return Ok(Settlement::Applied(flow_failed(
                        &flow,
                        DomainError::InsufficientFunds.to_string(),
                    )));
                }

                let moved = transaction_repo::record_settlement_tx(
                    tx,
                    txn.id,
                    TransactionStatus::Initiated,
                    TransactionStatus::Completed,
                    new_balance,
                    None,
                )
                .await?;
                if !moved {
                    // Still 'created': the initiated handler has not run yet,
                    // so this webhook arrived early. Retry via the DLQ.
                    return Err(StepError::NotReady(txn.id));
                }

                account_repo::update_balance_tx(tx, account.id, new_balance).await?;

                let terminal = match flow.flow_type {
                    FlowType::Deposit => FlowEvent::DepositCompleted(DepositCompleted {
                        flow: flow.clone(),
                        amount: txn.amount,
                    }),
                    FlowType::Withdraw => FlowEvent::WithdrawCompleted(WithdrawCompleted {
                        flow: flow.clone(),
                        amount: txn.amount.abs()?,
                    }),
                    FlowType::Transfer => {
                        flow_failed(&flow, "payment settlement does not apply to transfers")
                    }
                };
                Ok(Settlement::Applied(terminal))
            })
        })
        .await
    }

    async fn settle_failed(
        &self,
        flow: crate::events::FlowContext,
        payment_id: String,
        reason: String,
    ) -> Result<Settlement, StepError> {
        uow::run(&self.pool, |tx| {
            Box::pin(async move {
                let txn = transaction_repo::get_by_payment_id_tx(tx, &payment_id).await?;
                if txn.status.is_terminal() {
                    return Ok(Settlement::AlreadySettled);
                }

                transaction_repo::fail_if_active_tx(tx, txn.id).await?;
                Ok(Settlement::Applied(flow_failed(&flow, reason)))
            })
        })
        .await
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for PaymentSettlementHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let outcome = match event {
            FlowEvent::PaymentCompleted(completed) => {
                self.settle_completed(completed.flow.clone(), completed.payment_id.clone())
                    .await?
            }
            FlowEvent::PaymentFailed(failed) => {
                info!(
                    correlation_id = %failed.flow.correlation_id,
                    payment_id = %failed.payment_id,
                    reason = %failed.reason,
                    "payment failed at provider"
                );
                self.settle_failed(
                    failed.flow.clone(),
                    failed.payment_id.clone(),
                    failed.reason.clone(),
                )
                .await?
            }
            _ => {
                debug!("settlement handler ignoring unrelated event");
                return Ok(());
            }
        };

        match outcome {
            Settlement::Applied(terminal) => {
                info!(
                    correlation_id = %terminal.context().correlation_id,
                    "flow settled"
                );
                emit(&self.bus, terminal).await
            }
            Settlement::AlreadySettled => {
                debug!("transaction already terminal, acknowledging redelivery");
                Ok(())
            }
        }
    }
}
