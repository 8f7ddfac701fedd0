use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::Currency;

/// Errors from the exchange-rate provider
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("conversion {from}->{to} is not supported")]
    Unsupported {
        from: &'static str,
        to: &'static str,
    },

    #[error("exchange rate provider transport error: {0}")]
    Transport(String),

    #[error("exchange rate provider returned status {status}")]
    Upstream { status: u16 },

    #[error("exchange rate provider returned an invalid body: {0}")]
    InvalidBody(String),
}

impl ExchangeError {
    /// Transient errors propagate out of the handler so the message is
    /// retried via the DLQ; the rest terminate the flow with a `*Failed`
    /// event.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Upstream { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A quoted rate and when it was quoted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateQuote {
    pub rate: Decimal,
    pub quoted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    async fn fetch_rate(&self, from: Currency, to: Currency) -> Result<RateQuote, ExchangeError>;

    async fn fetch_rates(
        &self,
        from: Currency,
        to: &[Currency],
    ) -> Result<HashMap<Currency, RateQuote>, ExchangeError>;

    async fn is_supported(&self, from: Currency, to: Currency) -> bool;

    async fn check_health(&self) -> Result<(), ExchangeError>;
}

/// HTTP exchange-rate client.
///
/// Expects `GET {base}/rates/{from}/{to}` to answer
/// `{"rate": "0.90", "timestamp": "..."}` and `GET {base}/health` to answer
/// 2xx.
pub struct HttpExchangeRateProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    rate: Decimal,
    timestamp: DateTime<Utc>,
}

impl HttpExchangeRateProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ExchangeRateProvider for HttpExchangeRateProvider {
    async fn fetch_rate(&self, from: Currency, to: Currency) -> Result<RateQuote, ExchangeError> {
        let url = format!("{}/rates/{}/{}", self.base_url, from.code(), to.code());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ExchangeError::Unsupported {
                from: from.code(),
                to: to.code(),
            });
        }
        if !status.is_success() {
            return Err(ExchangeError::Upstream {
                status: status.as_u16(),
            });
        }

        let body: RateResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidBody(e.to_string()))?;

        Ok(RateQuote {
            rate: body.rate,
            quoted_at: body.timestamp,
        })
    }

    async fn fetch_rates(
        &self,
        from: Currency,
        to: &[Currency],
    ) -> Result<HashMap<Currency, RateQuote>, ExchangeError> {
        let mut rates = HashMap::with_capacity(to.len());
        for target in to {
            match self.fetch_rate(from, *target).await {
                Ok(quote) => {
                    rates.insert(*target, quote);
                }
                // Unsupported pairs are simply absent from the map
                Err(ExchangeError::Unsupported { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(rates)
    }

    async fn is_supported(&self, from: Currency, to: Currency) -> bool {
        from == to || self.fetch_rate(from, to).await.is_ok()
    }

    async fn check_health(&self) -> Result<(), ExchangeError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExchangeError::Upstream {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// In-memory rate table for tests and single-node installs
#[derive(Debug, Default)]
pub struct FixedRates {
    rates: HashMap<(&'static str, &'static str), Decimal>,
}

impl FixedRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: Currency, to: Currency, rate: Decimal) -> Self {
        self.rates.insert((from.code(), to.code()), rate);
        self
    }
}

#[async_trait]
impl ExchangeRateProvider for FixedRates {
    async fn fetch_rate(&self, from: Currency, to: Currency) -> Result<RateQuote, ExchangeError> {
        let rate = if from == to {
            Decimal::ONE
        } else {
            *self
                .rates
                .get(&(from.code(), to.code()))
                .ok_or(ExchangeError::Unsupported {
                    from: from.code(),
                    to: to.code(),
                })?
        };

        Ok(RateQuote {
            rate,
            quoted_at: Utc::now(),
        })
    }

    async fn fetch_rates(
        &self,
        from: Currency,
        to: &[Currency],
    ) -> Result<HashMap<Currency, RateQuote>, ExchangeError> {
        let mut rates = HashMap::new();
        for target in to {
            if let Ok(quote) = self.fetch_rate(from, *target).await {
                rates.insert(*target, quote);
            }
        }
        Ok(rates)
    }

    async fn is_supported(&self, from: Currency, to: Currency) -> bool {
        from == to || self.rates.contains_key(&(from.code(), to.code()))
    }

    async fn check_health(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn currency(code: &str) -> Currency {
        Currency::get(code).unwrap()
    }

    #[tokio::test]
    async fn fixed_rates_answer_configured_pairs() {
        let rates = FixedRates::new().with_rate(currency("USD"), currency("EUR"), dec!(0.90));

        let quote = rates
            .fetch_rate(currency("USD"), currency("EUR"))
            .await
            .unwrap();
        assert_eq!(quote.rate, dec!(0.90));
        assert!(rates.is_supported(currency("USD"), currency("EUR")).await);
    }

    #[tokio::test]
    async fn same_currency_rate_is_one_without_configuration() {
        let rates = FixedRates::new();
        let quote = rates
            .fetch_rate(currency("USD"), currency("USD"))
            .await
            .unwrap();
        assert_eq!(quote.rate, Decimal::ONE);
    }

    #[tokio::test]
    async fn unknown_pair_is_unsupported() {
        let rates = FixedRates::new();
        assert!(matches!(
            rates.fetch_rate(currency("USD"), currency("EUR")).await,
            Err(ExchangeError::Unsupported { from: "USD", to: "EUR" })
        ));
        assert!(!rates.is_supported(currency("USD"), currency("EUR")).await);
    }

    #[tokio::test]
    async fn fetch_rates_skips_unsupported_targets() {
        let rates = FixedRates::new().with_rate(currency("USD"), currency("EUR"), dec!(0.90));

        let quotes = rates
            .fetch_rates(currency("USD"), &[currency("EUR"), currency("GBP")])
            .await
            .unwrap();

        assert_eq!(quotes.len(), 1);
        assert!(quotes.contains_key(&currency("EUR")));
    }

    #[test]
    fn transience_follows_the_error_taxonomy() {
        assert!(ExchangeError::Transport("timeout".to_string()).is_transient());
        assert!(ExchangeError::Upstream { status: 503 }.is_transient());
        assert!(ExchangeError::Upstream { status: 429 }.is_transient());
        assert!(!ExchangeError::Upstream { status: 400 }.is_transient());
        assert!(!ExchangeError::Unsupported { from: "USD", to: "EUR" }.is_transient());
    }
}
