//! Withdraw flow: `withdraw.requested` validation against the account and
//! creation of the negative transaction.
//!
//! Domain failures record a `failed` transaction so the rejection shows up
//! in the account history, then terminate the flow.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use event_bus::{EventHandler, HandlerError};

use crate::domain::TransactionStatus;
use crate::events::{
    flow_failed, ConversionRequested, FlowDetail, FlowEvent, WithdrawRequested,
};
use crate::repos::account_repo::{self, AccountError};
use crate::repos::transaction_repo::{self, NewTransaction};
use crate::repos::uow;

use super::{emit, DynBus, StepError};

pub struct WithdrawRequestedHandler {
    pool: PgPool,
    bus: DynBus,
}

impl WithdrawRequestedHandler {
    pub fn new(pool: PgPool, bus: DynBus) -> Self {
        Self { pool, bus }
    }

    async fn record_transaction(
        &self,
        record: NewTransaction,
    ) -> Result<bool, HandlerError> {
        Ok(uow::run::<_, StepError, _>(&self.pool, |tx| {
            Box::pin(async move { Ok(transaction_repo::insert_if_absent_tx(tx, &record).await?) })
        })
        .await?)
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for WithdrawRequestedHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::WithdrawRequested(request) = event else {
            debug!("withdraw handler ignoring unrelated event");
            return Ok(());
        };
        let flow = request.flow.clone();

        info!(
            correlation_id = %flow.correlation_id,
            account_id = %flow.account_id,
            amount = %request.amount,
            "withdraw requested"
        );

        let transaction_id = match validate(&request) {
            Ok(id) => id,
            Err(reason) => {
                warn!(correlation_id = %flow.correlation_id, reason = %reason, "withdraw rejected");
                return emit(&self.bus, flow_failed(&flow, reason)).await;
            }
        };

        let account = match account_repo::get(&self.pool, flow.account_id).await {
            Ok(account) => account,
            Err(AccountError::NotFound { .. }) => {
                return emit(&self.bus, flow_failed(&flow, "account not found")).await;
            }
            Err(AccountError::Corrupt { .. }) => {
                return emit(&self.bus, flow_failed(&flow, "account record is invalid")).await;
            }
            Err(e) => return Err(HandlerError::transient(e)),
        };

        let Ok(negated) = request.amount.negate() else {
            return emit(&self.bus, flow_failed(&flow, "amount overflow")).await;
        };
        let money_source = request.target.money_source();

        if let Err(rule) = account.validate_withdraw(flow.user_id, request.amount) {
            warn!(
                correlation_id = %flow.correlation_id,
                account_id = %flow.account_id,
                reason = %rule,
                "withdraw violates account rules"
            );
            // Keep the rejected attempt visible in the account history
            let record = NewTransaction::new(
                transaction_id,
                flow.user_id,
                flow.account_id,
                negated,
                TransactionStatus::Failed,
                money_source,
            );
            self.record_transaction(record).await?;
            return emit(&self.bus, flow_failed(&flow, rule.to_string())).await;
        }

        let record = NewTransaction::new(
            transaction_id,
            flow.user_id,
            flow.account_id,
            negated,
            TransactionStatus::Created,
            money_source,
        );
        let inserted = self.record_transaction(record).await?;
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
                to: account.currency(),
                detail: FlowDetail::Withdraw {
                    target: request.target,
                },
            }),
        )
        .await
    }
}

fn validate(request: &WithdrawRequested) -> Result<Uuid, String> {
    if request.flow.user_id.is_nil() {
        return Err("user id is required".to_string());
    }
    if request.flow.account_id.is_nil() {
        return Err("account id is required".to_string());
    }
    if !request.amount.is_positive() {
        return Err("amount must be positive".to_string());
    }
    if request.target.is_empty() {
        return Err("external target is required".to_string());
    }
    request
        .flow
        .transaction_id
        .ok_or_else(|| "transaction id is required".to_string())
}
