//! Outbound provider ports: exchange rates and payment initiation.
//!
//! Each port is a trait with an HTTP implementation for production and an
//! in-memory implementation used by tests and single-node installs.

pub mod exchange;
pub mod payment;

pub use exchange::{ExchangeError, ExchangeRateProvider, FixedRates, HttpExchangeRateProvider, RateQuote};
pub use payment::{HttpPaymentProvider, MockPaymentProvider, PaymentError, PaymentProvider};
