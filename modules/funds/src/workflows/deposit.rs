//! Deposit flow: `deposit.requested` validation and transaction creation.
//!
//! The chain continues through conversion, payment initiation, and the
//! provider webhook before the settlement handler credits the account.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use event_bus::{EventHandler, HandlerError};

use crate::domain::{DomainError, TransactionStatus};
use crate::events::{
    flow_failed, ConversionRequested, DepositRequested, FlowDetail, FlowEvent,
};
use crate::repos::account_repo::{self, AccountError};
use crate::repos::transaction_repo::{self, NewTransaction};
use crate::repos::uow;

use super::{emit, DynBus, StepError};

pub struct DepositRequestedHandler {
    pool: PgPool,
    bus: DynBus,
}

impl DepositRequestedHandler {
    pub fn new(pool: PgPool, bus: DynBus) -> Self {
        Self { pool, bus }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for DepositRequestedHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::DepositRequested(request) = event else {
            debug!("deposit handler ignoring unrelated event");
            return Ok(());
        };
        let flow = request.flow.clone();

        info!(
            correlation_id = %flow.correlation_id,
            account_id = %flow.account_id,
            amount = %request.amount,
            "deposit requested"
        );

        let transaction_id = match validate(&request) {
            Ok(id) => id,
            Err(reason) => {
                warn!(correlation_id = %flow.correlation_id, reason = %reason, "deposit rejected");
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
        if account.user_id != flow.user_id {
            return emit(
                &self.bus,
                flow_failed(&flow, DomainError::NotAccountOwner.to_string()),
            )
            .await;
        }

        let record = NewTransaction::new(
            transaction_id,
            flow.user_id,
            flow.account_id,
            request.amount,
            TransactionStatus::Created,
            request.source,
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
                to: account.currency(),
                detail: FlowDetail::Deposit {
                    source: request.source,
                },
            }),
        )
        .await
    }
}

fn validate(request: &DepositRequested) -> Result<Uuid, String> {
    if request.flow.user_id.is_nil() {
        return Err("user id is required".to_string());
    }
    if request.flow.account_id.is_nil() {
        return Err("account id is required".to_string());
    }
    if !request.amount.is_positive() {
        return Err(DomainError::AmountNotPositive.to_string());
    }
    request
        .flow
        .transaction_id
        .ok_or_else(|| "transaction id is required".to_string())
}
