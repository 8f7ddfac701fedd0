//! Currency conversion sub-flow, shared by all three operations.
//!
//! `conversion.requested` asks the exchange-rate provider for a quote and
//! emits `conversion.done` with the rate captured in the event, so replays
//! settle to identical balances. `conversion.done` routes to the next stage
//! of whichever flow requested the conversion.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use event_bus::{EventHandler, HandlerError};

use crate::events::{
    flow_failed, ConversionDone, ConversionRequested, FlowDetail, FlowEvent, PaymentInitiation,
    TransferDomainOpDone,
};
use crate::providers::ExchangeRateProvider;

use super::{emit, DynBus};

pub struct ConversionRequestedHandler {
    rates: Arc<dyn ExchangeRateProvider>,
    bus: DynBus,
}

impl ConversionRequestedHandler {
    pub fn new(rates: Arc<dyn ExchangeRateProvider>, bus: DynBus) -> Self {
        Self { rates, bus }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for ConversionRequestedHandler {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::ConversionRequested(request) = event else {
            debug!("conversion handler ignoring unrelated event");
            return Ok(());
        };
        let flow = request.flow.clone();

        // Same-currency short-circuit: the provider is not consulted
        if request.amount.currency() == request.to {
            return emit(
                &self.bus,
                FlowEvent::ConversionDone(ConversionDone {
                    flow,
                    original: request.amount,
                    converted: request.amount,
                    rate: Decimal::ONE,
                    quoted_at: Utc::now(),
                    detail: request.detail,
                }),
            )
            .await;
        }

        let quote = match self
            .rates
            .fetch_rate(request.amount.currency(), request.to)
            .await
        {
            Ok(quote) => quote,
            Err(e) if e.is_transient() => {
                return Err(HandlerError::transient(format!(
                    "exchange rate fetch failed: {e}"
                )));
            }
            Err(e) => {
                warn!(
                    correlation_id = %flow.correlation_id,
                    from = %request.amount.currency(),
                    to = %request.to,
                    error = %e,
                    "conversion rejected"
                );
                return emit(&self.bus, flow_failed(&flow, e.to_string())).await;
            }
        };

        let converted = match request.amount.convert(quote.rate, request.to) {
            Ok(converted) => converted,
            Err(e) => {
                return emit(
                    &self.bus,
                    flow_failed(&flow, format!("conversion failed: {e}")),
                )
                .await;
            }
        };

        info!(
            correlation_id = %flow.correlation_id,
            original = %request.amount,
            converted = %converted,
            rate = %quote.rate,
            "conversion done"
        );

        emit(
            &self.bus,
            FlowEvent::ConversionDone(ConversionDone {
                flow,
                original: request.amount,
                converted,
                rate: quote.rate,
                quoted_at: quote.quoted_at,
                detail: request.detail,
            }),
        )
        .await
    }
}

/// Routes `conversion.done` to the next stage of its flow: payment
/// initiation for deposits and withdrawals, the domain operation for
/// transfers.
pub struct ConversionDoneRouter {
    bus: DynBus,
}

impl ConversionDoneRouter {
    pub fn new(bus: DynBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventHandler<FlowEvent> for ConversionDoneRouter {
    async fn handle(&self, event: FlowEvent) -> Result<(), HandlerError> {
        let FlowEvent::ConversionDone(done) = event else {
            debug!("conversion router ignoring unrelated event");
            return Ok(());
        };

        match done.detail {
            FlowDetail::Transfer {
                destination_account_id,
            } => {
                emit(
                    &self.bus,
                    FlowEvent::TransferDomainOpDone(TransferDomainOpDone {
                        flow: done.flow,
                        amount: done.original,
                        converted: done.converted,
                        rate: done.rate,
                        destination_account_id,
                    }),
                )
                .await
            }
            detail @ (FlowDetail::Deposit { .. } | FlowDetail::Withdraw { .. }) => {
                emit(
                    &self.bus,
                    FlowEvent::PaymentInitiation(PaymentInitiation {
                        flow: done.flow,
                        amount: done.converted,
                        detail,
                    }),
                )
                .await
            }
        }
    }
}
