use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Money;

/// Errors from the payment provider
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment rejected: {reason}")]
    Rejected { reason: String },

    #[error("payment provider transport error: {0}")]
    Transport(String),

    #[error("payment provider returned status {status}")]
    Upstream { status: u16 },

    #[error("payment provider returned an invalid body: {0}")]
    InvalidBody(String),
}

impl PaymentError {
    pub fn is_transient(&self) -> bool {
        match self {
            PaymentError::Transport(_) => true,
            PaymentError::Upstream { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Ask the provider to move the money; returns the provider payment id.
    ///
    /// Completion arrives later through the provider webhook, which an
    /// external component decodes into `payment.completed` /
    /// `payment.failed` events.
    async fn initiate_payment(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        amount: Money,
    ) -> Result<String, PaymentError>;

    async fn check_health(&self) -> Result<(), PaymentError>;
}

/// HTTP payment client.
///
/// Expects `POST {base}/payments` to answer `{"payment_id": "..."}`.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct InitiateRequest {
    user_id: Uuid,
    account_id: Uuid,
    amount_minor: i64,
    currency: &'static str,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    payment_id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    message: Option<String>,
}

impl HttpPaymentProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn initiate_payment(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        amount: Money,
    ) -> Result<String, PaymentError> {
        let url = format!("{}/payments", self.base_url);
        let request = InitiateRequest {
            user_id,
            account_id,
            amount_minor: amount.minor(),
            currency: amount.currency().code(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let reason = response
                .json::<ProviderErrorBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| format!("status {status}"));
            return Err(PaymentError::Rejected { reason });
        }
        if !status.is_success() {
            return Err(PaymentError::Upstream {
                status: status.as_u16(),
            });
        }

        let body: InitiateResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::InvalidBody(e.to_string()))?;

        Ok(body.payment_id)
    }

    async fn check_health(&self) -> Result<(), PaymentError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PaymentError::Upstream {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Scriptable in-memory provider for tests and single-node installs.
///
/// `fail_times(n)` makes the next `n` initiations fail with a 503 (the
/// transient path); `reject_with` makes every initiation a domain rejection.
#[derive(Debug, Default)]
pub struct MockPaymentProvider {
    counter: AtomicU64,
    failures_remaining: AtomicU32,
    reject_reason: Mutex<Option<String>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, failures: u32) {
        self.failures_remaining.store(failures, Ordering::SeqCst);
    }

    pub fn reject_with(&self, reason: impl Into<String>) {
        *self.reject_reason.lock().expect("reject lock poisoned") = Some(reason.into());
    }

    /// How many payments were successfully initiated
    pub fn initiated_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn initiate_payment(
        &self,
        _user_id: Uuid,
        _account_id: Uuid,
        _amount: Money,
    ) -> Result<String, PaymentError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(PaymentError::Upstream { status: 503 });
        }

        if let Some(reason) = self.reject_reason.lock().expect("reject lock poisoned").clone() {
            return Err(PaymentError::Rejected { reason });
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("pay_{seq:08}"))
    }

    async fn check_health(&self) -> Result<(), PaymentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Currency;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    #[tokio::test]
    async fn mock_issues_sequential_payment_ids() {
        let provider = MockPaymentProvider::new();

        let first = provider
            .initiate_payment(Uuid::new_v4(), Uuid::new_v4(), usd(100))
            .await
            .unwrap();
        let second = provider
            .initiate_payment(Uuid::new_v4(), Uuid::new_v4(), usd(100))
            .await
            .unwrap();

        assert_eq!(first, "pay_00000001");
        assert_eq!(second, "pay_00000002");
        assert_eq!(provider.initiated_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_transient_then_clear() {
        let provider = MockPaymentProvider::new();
        provider.fail_times(1);

        let first = provider
            .initiate_payment(Uuid::new_v4(), Uuid::new_v4(), usd(100))
            .await;
        assert!(matches!(first, Err(PaymentError::Upstream { status: 503 })));
        assert!(first.unwrap_err().is_transient());

        let second = provider
            .initiate_payment(Uuid::new_v4(), Uuid::new_v4(), usd(100))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn scripted_rejection_is_a_domain_failure() {
        let provider = MockPaymentProvider::new();
        provider.reject_with("card declined");

        let result = provider
            .initiate_payment(Uuid::new_v4(), Uuid::new_v4(), usd(100))
            .await;
        let err = result.unwrap_err();
        assert!(matches!(&err, PaymentError::Rejected { reason } if reason == "card declined"));
        assert!(!err.is_transient());
    }
}
