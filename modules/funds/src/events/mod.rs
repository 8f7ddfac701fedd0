//! Flow events: the tagged event family driving every financial workflow.
//!
//! Each case is one registered event type; the envelope's `type` field is
//! the tag. Every event embeds the [`FlowContext`] base by value, so the
//! `correlation_id` minted at the originating command propagates unchanged
//! through every derived event of the flow.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use event_bus::{BusEvent, EventRegistry};

use crate::domain::{Currency, ExternalTarget, Money, MoneySource};

/// Event-type strings, `flow.step` shaped so stream and topic names derive
/// cleanly from them
pub mod types {
    pub const DEPOSIT_REQUESTED: &str = "deposit.requested";
    pub const DEPOSIT_COMPLETED: &str = "deposit.completed";
    pub const DEPOSIT_FAILED: &str = "deposit.failed";

    pub const WITHDRAW_REQUESTED: &str = "withdraw.requested";
    pub const WITHDRAW_COMPLETED: &str = "withdraw.completed";
    pub const WITHDRAW_FAILED: &str = "withdraw.failed";

    pub const TRANSFER_REQUESTED: &str = "transfer.requested";
    pub const TRANSFER_DOMAIN_DONE: &str = "transfer.domain_done";
    pub const TRANSFER_COMPLETED: &str = "transfer.completed";
    pub const TRANSFER_FAILED: &str = "transfer.failed";

    pub const CONVERSION_REQUESTED: &str = "conversion.requested";
    pub const CONVERSION_DONE: &str = "conversion.done";

    pub const PAYMENT_INITIATION: &str = "payment.initiation";
    pub const PAYMENT_INITIATED: &str = "payment.initiated";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_FAILED: &str = "payment.failed";

    pub const ALL: &[&str] = &[
        DEPOSIT_REQUESTED,
        DEPOSIT_COMPLETED,
        DEPOSIT_FAILED,
        WITHDRAW_REQUESTED,
        WITHDRAW_COMPLETED,
        WITHDRAW_FAILED,
        TRANSFER_REQUESTED,
        TRANSFER_DOMAIN_DONE,
        TRANSFER_COMPLETED,
        TRANSFER_FAILED,
        CONVERSION_REQUESTED,
        CONVERSION_DONE,
        PAYMENT_INITIATION,
        PAYMENT_INITIATED,
        PAYMENT_COMPLETED,
        PAYMENT_FAILED,
    ];
}

/// Which end-to-end operation a flow belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Deposit,
    Withdraw,
    Transfer,
}

impl FlowType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Deposit => "deposit",
            FlowType::Withdraw => "withdraw",
            FlowType::Transfer => "transfer",
        }
    }
}

/// Base fields carried by every flow event.
///
/// `correlation_id` is generated at the originating command and is the join
/// key for logging and reconciliation; `transaction_id` is minted alongside
/// it so redelivered `*Requested` events create the same transaction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub flow_type: FlowType,
    pub correlation_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
}

/// Flow-specific data threaded through the shared conversion and payment
/// steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FlowDetail {
    Deposit {
        source: MoneySource,
    },
    Withdraw {
        target: ExternalTarget,
    },
    Transfer {
        destination_account_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequested {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub source: MoneySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequested {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub target: ExternalTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequested {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub destination_account_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequested {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub to: Currency,
    pub detail: FlowDetail,
}

/// Rates are captured here, before any balance mutation, so replays settle
/// to identical balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionDone {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub original: Money,
    pub converted: Money,
    pub rate: Decimal,
    pub quoted_at: DateTime<Utc>,
    pub detail: FlowDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    #[serde(flatten)]
    pub flow: FlowContext,
    /// Converted, account-currency amount
    pub amount: Money,
    pub detail: FlowDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInitiated {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub payment_id: String,
    pub amount: Money,
}

/// Decoded from the provider webhook by an external component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub payment_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDomainOpDone {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub converted: Money,
    pub rate: Decimal,
    pub destination_account_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositCompleted {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositFailed {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawCompleted {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawFailed {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCompleted {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub amount: Money,
    pub converted: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFailed {
    #[serde(flatten)]
    pub flow: FlowContext,
    pub reason: String,
}

/// The event family: one case per registered event type
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    DepositRequested(DepositRequested),
    WithdrawRequested(WithdrawRequested),
    TransferRequested(TransferRequested),
    ConversionRequested(ConversionRequested),
    ConversionDone(ConversionDone),
    PaymentInitiation(PaymentInitiation),
    PaymentInitiated(PaymentInitiated),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    TransferDomainOpDone(TransferDomainOpDone),
    DepositCompleted(DepositCompleted),
    DepositFailed(DepositFailed),
    WithdrawCompleted(WithdrawCompleted),
    WithdrawFailed(WithdrawFailed),
    TransferCompleted(TransferCompleted),
    TransferFailed(TransferFailed),
}

impl FlowEvent {
    /// The flow base fields shared by every case
    pub fn context(&self) -> &FlowContext {
        match self {
            FlowEvent::DepositRequested(e) => &e.flow,
            FlowEvent::WithdrawRequested(e) => &e.flow,
            FlowEvent::TransferRequested(e) => &e.flow,
            FlowEvent::ConversionRequested(e) => &e.flow,
            FlowEvent::ConversionDone(e) => &e.flow,
            FlowEvent::PaymentInitiation(e) => &e.flow,
            FlowEvent::PaymentInitiated(e) => &e.flow,
            FlowEvent::PaymentCompleted(e) => &e.flow,
            FlowEvent::PaymentFailed(e) => &e.flow,
            FlowEvent::TransferDomainOpDone(e) => &e.flow,
            FlowEvent::DepositCompleted(e) => &e.flow,
            FlowEvent::DepositFailed(e) => &e.flow,
            FlowEvent::WithdrawCompleted(e) => &e.flow,
            FlowEvent::WithdrawFailed(e) => &e.flow,
            FlowEvent::TransferCompleted(e) => &e.flow,
            FlowEvent::TransferFailed(e) => &e.flow,
        }
    }
}

impl BusEvent for FlowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::DepositRequested(_) => types::DEPOSIT_REQUESTED,
            FlowEvent::WithdrawRequested(_) => types::WITHDRAW_REQUESTED,
            FlowEvent::TransferRequested(_) => types::TRANSFER_REQUESTED,
            FlowEvent::ConversionRequested(_) => types::CONVERSION_REQUESTED,
            FlowEvent::ConversionDone(_) => types::CONVERSION_DONE,
            FlowEvent::PaymentInitiation(_) => types::PAYMENT_INITIATION,
            FlowEvent::PaymentInitiated(_) => types::PAYMENT_INITIATED,
            FlowEvent::PaymentCompleted(_) => types::PAYMENT_COMPLETED,
            FlowEvent::PaymentFailed(_) => types::PAYMENT_FAILED,
            FlowEvent::TransferDomainOpDone(_) => types::TRANSFER_DOMAIN_DONE,
            FlowEvent::DepositCompleted(_) => types::DEPOSIT_COMPLETED,
            FlowEvent::DepositFailed(_) => types::DEPOSIT_FAILED,
            FlowEvent::WithdrawCompleted(_) => types::WITHDRAW_COMPLETED,
            FlowEvent::WithdrawFailed(_) => types::WITHDRAW_FAILED,
            FlowEvent::TransferCompleted(_) => types::TRANSFER_COMPLETED,
            FlowEvent::TransferFailed(_) => types::TRANSFER_FAILED,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            FlowEvent::DepositRequested(e) => serde_json::to_value(e),
            FlowEvent::WithdrawRequested(e) => serde_json::to_value(e),
            FlowEvent::TransferRequested(e) => serde_json::to_value(e),
            FlowEvent::ConversionRequested(e) => serde_json::to_value(e),
            FlowEvent::ConversionDone(e) => serde_json::to_value(e),
            FlowEvent::PaymentInitiation(e) => serde_json::to_value(e),
            FlowEvent::PaymentInitiated(e) => serde_json::to_value(e),
            FlowEvent::PaymentCompleted(e) => serde_json::to_value(e),
            FlowEvent::PaymentFailed(e) => serde_json::to_value(e),
            FlowEvent::TransferDomainOpDone(e) => serde_json::to_value(e),
            FlowEvent::DepositCompleted(e) => serde_json::to_value(e),
            FlowEvent::DepositFailed(e) => serde_json::to_value(e),
            FlowEvent::WithdrawCompleted(e) => serde_json::to_value(e),
            FlowEvent::WithdrawFailed(e) => serde_json::to_value(e),
            FlowEvent::TransferCompleted(e) => serde_json::to_value(e),
            FlowEvent::TransferFailed(e) => serde_json::to_value(e),
        }
    }
}

/// Build the registry of decoders for the full event family.
///
/// Passed to every bus constructor; lookup failure on the wire marks a
/// message as malformed.
pub fn flow_event_registry() -> EventRegistry<FlowEvent> {
    let mut registry = EventRegistry::new();
    registry.register_as(types::DEPOSIT_REQUESTED, FlowEvent::DepositRequested);
    registry.register_as(types::WITHDRAW_REQUESTED, FlowEvent::WithdrawRequested);
    registry.register_as(types::TRANSFER_REQUESTED, FlowEvent::TransferRequested);
    registry.register_as(types::CONVERSION_REQUESTED, FlowEvent::ConversionRequested);
    registry.register_as(types::CONVERSION_DONE, FlowEvent::ConversionDone);
    registry.register_as(types::PAYMENT_INITIATION, FlowEvent::PaymentInitiation);
    registry.register_as(types::PAYMENT_INITIATED, FlowEvent::PaymentInitiated);
    registry.register_as(types::PAYMENT_COMPLETED, FlowEvent::PaymentCompleted);
    registry.register_as(types::PAYMENT_FAILED, FlowEvent::PaymentFailed);
    registry.register_as(types::TRANSFER_DOMAIN_DONE, FlowEvent::TransferDomainOpDone);
    registry.register_as(types::DEPOSIT_COMPLETED, FlowEvent::DepositCompleted);
    registry.register_as(types::DEPOSIT_FAILED, FlowEvent::DepositFailed);
    registry.register_as(types::WITHDRAW_COMPLETED, FlowEvent::WithdrawCompleted);
    registry.register_as(types::WITHDRAW_FAILED, FlowEvent::WithdrawFailed);
    registry.register_as(types::TRANSFER_COMPLETED, FlowEvent::TransferCompleted);
    registry.register_as(types::TRANSFER_FAILED, FlowEvent::TransferFailed);
    registry
}

/// The terminal failure event for the given flow
pub fn flow_failed(flow: &FlowContext, reason: impl Into<String>) -> FlowEvent {
    let reason = reason.into();
    match flow.flow_type {
        FlowType::Deposit => FlowEvent::DepositFailed(DepositFailed {
            flow: flow.clone(),
            reason,
        }),
        FlowType::Withdraw => FlowEvent::WithdrawFailed(WithdrawFailed {
            flow: flow.clone(),
            reason,
        }),
        FlowType::Transfer => FlowEvent::TransferFailed(TransferFailed {
            flow: flow.clone(),
            reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::Envelope;
    use rust_decimal_macros::dec;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    fn eur(minor: i64) -> Money {
        Money::new(minor, Currency::get("EUR").unwrap())
    }

    fn context(flow_type: FlowType) -> FlowContext {
        FlowContext {
            flow_type,
            correlation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            transaction_id: Some(Uuid::new_v4()),
        }
    }

    fn sample_events() -> Vec<FlowEvent> {
        let deposit = context(FlowType::Deposit);
        let withdraw = context(FlowType::Withdraw);
        let transfer = context(FlowType::Transfer);
        let target = ExternalTarget {
            bank_account: Some("DE89370400440532013000".to_string()),
            routing_number: None,
            wallet_address: None,
        };
        let destination = Uuid::new_v4();

        vec![
            FlowEvent::DepositRequested(DepositRequested {
                flow: deposit.clone(),
                amount: usd(10_000),
                source: MoneySource::Cash,
            }),
            FlowEvent::WithdrawRequested(WithdrawRequested {
                flow: withdraw.clone(),
                amount: usd(2_500),
                target: target.clone(),
            }),
            FlowEvent::TransferRequested(TransferRequested {
                flow: transfer.clone(),
                amount: usd(3_000),
                destination_account_id: destination,
            }),
            FlowEvent::ConversionRequested(ConversionRequested {
                flow: deposit.clone(),
                amount: usd(10_000),
                to: Currency::get("EUR").unwrap(),
                detail: FlowDetail::Deposit {
                    source: MoneySource::Cash,
                },
            }),
            FlowEvent::ConversionDone(ConversionDone {
                flow: deposit.clone(),
                original: usd(10_000),
                converted: eur(9_000),
                rate: dec!(0.90),
                quoted_at: Utc::now(),
                detail: FlowDetail::Deposit {
                    source: MoneySource::Cash,
                },
            }),
            FlowEvent::PaymentInitiation(PaymentInitiation {
                flow: deposit.clone(),
                amount: eur(9_000),
                detail: FlowDetail::Deposit {
                    source: MoneySource::Cash,
                },
            }),
            FlowEvent::PaymentInitiated(PaymentInitiated {
                flow: deposit.clone(),
                payment_id: "pay_0001".to_string(),
                amount: eur(9_000),
            }),
            FlowEvent::PaymentCompleted(PaymentCompleted {
                flow: deposit.clone(),
                payment_id: "pay_0001".to_string(),
            }),
            FlowEvent::PaymentFailed(PaymentFailed {
                flow: withdraw.clone(),
                payment_id: "pay_0002".to_string(),
                reason: "card declined".to_string(),
            }),
            FlowEvent::TransferDomainOpDone(TransferDomainOpDone {
                flow: transfer.clone(),
                amount: usd(3_000),
                converted: usd(3_000),
                rate: Decimal::ONE,
                destination_account_id: destination,
            }),
            FlowEvent::DepositCompleted(DepositCompleted {
                flow: deposit.clone(),
                amount: usd(10_000),
            }),
            FlowEvent::DepositFailed(DepositFailed {
                flow: deposit,
                reason: "account not found".to_string(),
            }),
            FlowEvent::WithdrawCompleted(WithdrawCompleted {
                flow: withdraw.clone(),
                amount: usd(2_500),
            }),
            FlowEvent::WithdrawFailed(WithdrawFailed {
                flow: withdraw,
                reason: "insufficient funds".to_string(),
            }),
            FlowEvent::TransferCompleted(TransferCompleted {
                flow: transfer.clone(),
                amount: usd(3_000),
                converted: usd(3_000),
            }),
            FlowEvent::TransferFailed(TransferFailed {
                flow: transfer,
                reason: "self transfer".to_string(),
            }),
        ]
    }

    #[test]
    fn every_event_type_is_registered() {
        let registry = flow_event_registry();
        for event_type in types::ALL {
            assert!(registry.contains(event_type), "missing {event_type}");
        }
        assert_eq!(registry.known_types().len(), types::ALL.len());
    }

    #[test]
    fn envelope_round_trip_is_identity_for_every_type() {
        let registry = flow_event_registry();

        let samples = sample_events();
        assert_eq!(samples.len(), types::ALL.len());

        for event in samples {
            let envelope = Envelope::from_event(&event).unwrap();
            assert_eq!(envelope.event_type, event.event_type());

            let decoded_envelope = Envelope::decode(&envelope.encode().unwrap()).unwrap();
            let decoded = registry
                .decode(&decoded_envelope.event_type, decoded_envelope.payload)
                .unwrap();

            assert_eq!(decoded, event, "round trip broke {}", event.event_type());
        }
    }

    #[test]
    fn base_fields_are_flattened_into_the_payload() {
        let event = FlowEvent::DepositRequested(DepositRequested {
            flow: context(FlowType::Deposit),
            amount: usd(100),
            source: MoneySource::Card,
        });

        let payload = event.payload().unwrap();
        assert_eq!(payload["flow_type"], "deposit");
        assert!(payload["correlation_id"].is_string());
        assert!(payload["user_id"].is_string());
        assert!(payload["account_id"].is_string());
        assert!(payload["transaction_id"].is_string());
    }

    #[test]
    fn flow_failed_targets_the_right_flow() {
        let deposit = context(FlowType::Deposit);
        assert!(matches!(
            flow_failed(&deposit, "nope"),
            FlowEvent::DepositFailed(_)
        ));

        let withdraw = context(FlowType::Withdraw);
        assert!(matches!(
            flow_failed(&withdraw, "nope"),
            FlowEvent::WithdrawFailed(_)
        ));

        let transfer = context(FlowType::Transfer);
        let failed = flow_failed(&transfer, "insufficient funds");
        let FlowEvent::TransferFailed(inner) = &failed else {
            panic!("expected transfer failure");
        };
        assert_eq!(inner.reason, "insufficient funds");
        assert_eq!(failed.context().correlation_id, transfer.correlation_id);
    }
}
