//! Command layer: thin translators from caller intent to the first flow
//! event.
//!
//! Each dispatch validates the command shape synchronously, mints a fresh
//! correlation id and transaction id, emits the `*Requested` event, and
//! returns a 202-equivalent acknowledgement. Callers observe completion by
//! polling the transaction status or subscribing to the terminal events.

use tracing::info;
use uuid::Uuid;

use event_bus::BusError;

use crate::domain::{DomainError, ExternalTarget, Money, MoneySource};
use crate::events::{
    DepositRequested, FlowContext, FlowEvent, FlowType, TransferRequested, WithdrawRequested,
};
use crate::workflows::DynBus;

/// Errors surfaced synchronously to the caller
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Acknowledgement that a flow was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAck {
    pub correlation_id: Uuid,
    pub transaction_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct DepositCommand {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub amount: Money,
    pub source: MoneySource,
}

#[derive(Debug, Clone)]
pub struct WithdrawCommand {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub amount: Money,
    pub target: ExternalTarget,
}

#[derive(Debug, Clone)]
pub struct TransferCommand {
    pub user_id: Uuid,
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    pub amount: Money,
}

fn require_ids(user_id: Uuid, account_id: Uuid) -> Result<(), CommandError> {
    if user_id.is_nil() {
        return Err(CommandError::Validation("user id is required".to_string()));
    }
    if account_id.is_nil() {
        return Err(CommandError::Validation(
            "account id is required".to_string(),
        ));
    }
    Ok(())
}

fn require_positive(amount: Money) -> Result<(), CommandError> {
    if !amount.is_positive() {
        return Err(CommandError::Validation(
            DomainError::AmountNotPositive.to_string(),
        ));
    }
    Ok(())
}

impl DepositCommand {
    pub fn validate(&self) -> Result<(), CommandError> {
        require_ids(self.user_id, self.account_id)?;
        require_positive(self.amount)
    }
}

impl WithdrawCommand {
    pub fn validate(&self) -> Result<(), CommandError> {
        require_ids(self.user_id, self.account_id)?;
        require_positive(self.amount)?;
        if self.target.is_empty() {
            return Err(CommandError::Validation(
                "at least one external target field is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl TransferCommand {
    pub fn validate(&self) -> Result<(), CommandError> {
        require_ids(self.user_id, self.source_account_id)?;
        if self.destination_account_id.is_nil() {
            return Err(CommandError::Validation(
                "destination account id is required".to_string(),
            ));
        }
        if self.destination_account_id == self.source_account_id {
            return Err(CommandError::Validation(
                DomainError::SelfTransfer.to_string(),
            ));
        }
        require_positive(self.amount)
    }
}

pub struct CommandDispatcher {
    bus: DynBus,
}

impl CommandDispatcher {
    pub fn new(bus: DynBus) -> Self {
        Self { bus }
    }

    fn fresh_context(
        flow_type: FlowType,
        user_id: Uuid,
        account_id: Uuid,
    ) -> (FlowContext, FlowAck) {
        let correlation_id = Uuid::new_v4();
        let transaction_id = Uuid::new_v4();
        let context = FlowContext {
            flow_type,
            correlation_id,
            user_id,
            account_id,
            transaction_id: Some(transaction_id),
        };
        (
            context,
            FlowAck {
                correlation_id,
                transaction_id,
            },
        )
    }

    pub async fn deposit(&self, command: DepositCommand) -> Result<FlowAck, CommandError> {
        command.validate()?;
        let (flow, ack) =
            Self::fresh_context(FlowType::Deposit, command.user_id, command.account_id);

        info!(
            correlation_id = %ack.correlation_id,
            account_id = %command.account_id,
            amount = %command.amount,
            "dispatching deposit"
        );

        self.bus
            .emit(&FlowEvent::DepositRequested(DepositRequested {
                flow,
                amount: command.amount,
                source: command.source,
            }))
            .await?;
        Ok(ack)
    }

    pub async fn withdraw(&self, command: WithdrawCommand) -> Result<FlowAck, CommandError> {
        command.validate()?;
        let (flow, ack) =
            Self::fresh_context(FlowType::Withdraw, command.user_id, command.account_id);

        info!(
            correlation_id = %ack.correlation_id,
            account_id = %command.account_id,
            amount = %command.amount,
            "dispatching withdraw"
        );

        self.bus
            .emit(&FlowEvent::WithdrawRequested(WithdrawRequested {
                flow,
                amount: command.amount,
                target: command.target,
            }))
            .await?;
        Ok(ack)
    }

    pub async fn transfer(&self, command: TransferCommand) -> Result<FlowAck, CommandError> {
        command.validate()?;
        let (flow, ack) = Self::fresh_context(
            FlowType::Transfer,
            command.user_id,
            command.source_account_id,
        );

        info!(
            correlation_id = %ack.correlation_id,
            source_account = %command.source_account_id,
            destination_account = %command.destination_account_id,
            amount = %command.amount,
            "dispatching transfer"
        );

        self.bus
            .emit(&FlowEvent::TransferRequested(TransferRequested {
                flow,
                amount: command.amount,
                destination_account_id: command.destination_account_id,
            }))
            .await?;
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Currency;
    use crate::events::types;
    use crate::workflows::testing::CaptureHandler;
    use event_bus::{EventBus, MemoryBus};
    use std::sync::Arc;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    fn deposit_command() -> DepositCommand {
        DepositCommand {
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            amount: usd(10_000),
            source: MoneySource::Cash,
        }
    }

    #[tokio::test]
    async fn deposit_dispatch_emits_requested_with_fresh_ids() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let (capture, seen) = CaptureHandler::new();
        bus.register(types::DEPOSIT_REQUESTED, capture).await.unwrap();

        let dispatcher = CommandDispatcher::new(bus.clone());
        let command = deposit_command();
        let ack = dispatcher.deposit(command.clone()).await.unwrap();

        let seen = seen.lock().unwrap();
        let FlowEvent::DepositRequested(event) = &seen[0] else {
            panic!("expected deposit.requested");
        };
        assert_eq!(event.flow.correlation_id, ack.correlation_id);
        assert_eq!(event.flow.transaction_id, Some(ack.transaction_id));
        assert_eq!(event.flow.user_id, command.user_id);
        assert_eq!(event.flow.account_id, command.account_id);
        assert_eq!(event.amount, command.amount);
    }

    #[tokio::test]
    async fn each_dispatch_mints_a_new_correlation_id() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let first = dispatcher.deposit(deposit_command()).await.unwrap();
        let second = dispatcher.deposit(deposit_command()).await.unwrap();

        assert_ne!(first.correlation_id, second.correlation_id);
        assert_ne!(first.transaction_id, second.transaction_id);
    }

    #[tokio::test]
    async fn deposit_rejects_nil_user() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let mut command = deposit_command();
        command.user_id = Uuid::nil();

        assert!(matches!(
            dispatcher.deposit(command).await,
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deposit_rejects_non_positive_amount() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let mut command = deposit_command();
        command.amount = usd(0);

        assert!(matches!(
            dispatcher.deposit(command).await,
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn withdraw_requires_an_external_target() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let command = WithdrawCommand {
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            amount: usd(2_500),
            target: ExternalTarget::default(),
        };

        assert!(matches!(
            dispatcher.withdraw(command).await,
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn withdraw_accepts_any_single_target_field() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let command = WithdrawCommand {
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            amount: usd(2_500),
            target: ExternalTarget {
                wallet_address: Some("0xabc".to_string()),
                ..ExternalTarget::default()
            },
        };

        assert!(dispatcher.withdraw(command).await.is_ok());
    }

    #[tokio::test]
    async fn transfer_rejects_same_source_and_destination() {
        let bus: DynBus = Arc::new(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(bus);

        let account = Uuid::new_v4();
        let command = TransferCommand {
            user_id: Uuid::new_v4(),
            source_account_id: account,
            destination_account_id: account,
            amount: usd(3_000),
        };

        assert!(matches!(
            dispatcher.transfer(command).await,
            Err(CommandError::Validation(_))
        ));
    }
}
