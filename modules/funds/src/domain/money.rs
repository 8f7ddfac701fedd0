//! Immutable monetary values in the smallest unit of their currency.
//!
//! All arithmetic happens on integer minor units; cross-currency math goes
//! through [`Money::convert`], which rounds half-to-even at the target
//! currency's decimals. Operations on mismatched currencies fail instead of
//! guessing.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// ISO 4217 currencies with their minor-unit decimals
const CURRENCIES: &[(&str, u32)] = &[
    ("AED", 2),
    ("ARS", 2),
    ("AUD", 2),
    ("BGN", 2),
    ("BHD", 3),
    ("BRL", 2),
    ("CAD", 2),
    ("CHF", 2),
    ("CLP", 0),
    ("CNY", 2),
    ("COP", 2),
    ("CZK", 2),
    ("DKK", 2),
    ("EGP", 2),
    ("EUR", 2),
    ("GBP", 2),
    ("GHS", 2),
    ("HKD", 2),
    ("HUF", 2),
    ("IDR", 2),
    ("ILS", 2),
    ("INR", 2),
    ("ISK", 0),
    ("JOD", 3),
    ("JPY", 0),
    ("KES", 2),
    ("KRW", 0),
    ("KWD", 3),
    ("MXN", 2),
    ("MYR", 2),
    ("NGN", 2),
    ("NOK", 2),
    ("NZD", 2),
    ("OMR", 3),
    ("PEN", 2),
    ("PHP", 2),
    ("PLN", 2),
    ("RON", 2),
    ("RSD", 2),
    ("SAR", 2),
    ("SEK", 2),
    ("SGD", 2),
    ("THB", 2),
    ("TND", 3),
    ("TRY", 2),
    ("TWD", 2),
    ("UAH", 2),
    ("USD", 2),
    ("VND", 0),
    ("ZAR", 2),
];

/// Errors from monetary arithmetic and currency resolution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("unknown currency code: {0}")]
    UnknownCurrency(String),

    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("monetary amount overflow")]
    Overflow,
}

/// A registry-validated ISO 4217 currency code with known decimals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Currency {
    code: &'static str,
    decimals: u32,
}

impl Currency {
    /// Resolve a code against the currency registry (case-insensitive)
    pub fn get(code: &str) -> Result<Self, MoneyError> {
        let upper = code.to_uppercase();
        CURRENCIES
            .iter()
            .find(|(known, _)| *known == upper)
            .map(|(code, decimals)| Currency {
                code,
                decimals: *decimals,
            })
            .ok_or(MoneyError::UnknownCurrency(upper))
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    fn minor_factor(&self) -> i64 {
        10i64.pow(self.decimals)
    }
}

impl std::str::FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::get(s)
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code)
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code)
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Currency::get(&code).map_err(D::Error::custom)
    }
}

/// An immutable (integer minor units, currency) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    minor: i64,
    currency: Currency,
}

impl Money {
    pub fn new(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    pub fn minor(&self) -> i64 {
        self.minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    pub fn is_negative(&self) -> bool {
        self.minor < 0
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    fn same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.code,
                right: other.currency.code,
            });
        }
        Ok(())
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.same_currency(&other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency))
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.same_currency(&other)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency))
    }

    /// The opposite-sign amount
    pub fn negate(self) -> Result<Money, MoneyError> {
        let minor = self.minor.checked_neg().ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency))
    }

    pub fn abs(self) -> Result<Money, MoneyError> {
        if self.minor < 0 {
            self.negate()
        } else {
            Ok(self)
        }
    }

    /// Convert into `to` at the given rate, rounding half-to-even at the
    /// target currency's decimals
    pub fn convert(self, rate: Decimal, to: Currency) -> Result<Money, MoneyError> {
        let major = Decimal::new(self.minor, self.currency.decimals);
        let converted = (major * rate)
            .round_dp_with_strategy(to.decimals, RoundingStrategy::MidpointNearestEven);
        let minor = (converted * Decimal::from(to.minor_factor()))
            .to_i64()
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, to))
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let decimals = self.currency.decimals as usize;
        if decimals == 0 {
            return write!(f, "{} {}", self.minor, self.currency.code);
        }
        let sign = if self.minor < 0 { "-" } else { "" };
        let abs = self.minor.unsigned_abs();
        let factor = self.currency.minor_factor() as u64;
        write!(
            f,
            "{sign}{}.{:0width$} {}",
            abs / factor,
            abs % factor,
            self.currency.code,
            width = decimals
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::get("USD").unwrap())
    }

    fn eur(minor: i64) -> Money {
        Money::new(minor, Currency::get("EUR").unwrap())
    }

    #[test]
    fn currency_lookup_is_case_insensitive() {
        assert_eq!(Currency::get("usd").unwrap().code(), "USD");
        assert_eq!(Currency::get("USD").unwrap().decimals(), 2);
        assert_eq!(Currency::get("JPY").unwrap().decimals(), 0);
        assert_eq!(Currency::get("KWD").unwrap().decimals(), 3);
    }

    #[test]
    fn unknown_currency_is_rejected() {
        assert_eq!(
            Currency::get("XXX"),
            Err(MoneyError::UnknownCurrency("XXX".to_string()))
        );
    }

    #[test]
    fn addition_preserves_currency() {
        let sum = usd(1000).checked_add(usd(250)).unwrap();
        assert_eq!(sum, usd(1250));
    }

    #[test]
    fn arithmetic_on_different_currencies_fails() {
        assert_eq!(
            usd(100).checked_add(eur(100)),
            Err(MoneyError::CurrencyMismatch {
                left: "USD",
                right: "EUR"
            })
        );
        assert!(usd(100).checked_sub(eur(100)).is_err());
    }

    #[test]
    fn addition_overflow_is_detected() {
        assert_eq!(
            usd(i64::MAX).checked_add(usd(1)),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn negate_flips_sign() {
        assert_eq!(usd(2500).negate().unwrap(), usd(-2500));
        assert_eq!(usd(-2500).negate().unwrap(), usd(2500));
        assert_eq!(usd(i64::MIN).negate(), Err(MoneyError::Overflow));
    }

    #[test]
    fn positivity_requires_strictly_positive_amount() {
        assert!(usd(1).is_positive());
        assert!(!usd(0).is_positive());
        assert!(!usd(-1).is_positive());
    }

    #[test]
    fn convert_applies_rate() {
        let converted = usd(10_000)
            .convert(dec!(0.90), Currency::get("EUR").unwrap())
            .unwrap();
        assert_eq!(converted, eur(9_000));
    }

    #[test]
    fn convert_rounds_half_to_even() {
        let eur_currency = Currency::get("EUR").unwrap();
        // 1.01 USD * 0.5 = 0.505 -> banker's rounding gives 0.50
        assert_eq!(usd(101).convert(dec!(0.5), eur_currency).unwrap(), eur(50));
        // 1.03 USD * 0.5 = 0.515 -> banker's rounding gives 0.52
        assert_eq!(usd(103).convert(dec!(0.5), eur_currency).unwrap(), eur(52));
    }

    #[test]
    fn convert_respects_target_decimals() {
        let jpy = Currency::get("JPY").unwrap();
        // $100.00 at 147.123 -> 14712.3 JPY -> 14712 (0 decimals)
        assert_eq!(
            usd(10_000).convert(dec!(147.123), jpy).unwrap(),
            Money::new(14_712, jpy)
        );

        let kwd = Currency::get("KWD").unwrap();
        // $100.00 at 0.3072 -> 30.720 KWD in mils
        assert_eq!(
            usd(10_000).convert(dec!(0.3072), kwd).unwrap(),
            Money::new(30_720, kwd)
        );
    }

    #[test]
    fn convert_at_rate_one_is_identity_in_value() {
        let eur_currency = Currency::get("EUR").unwrap();
        assert_eq!(
            eur(4_211).convert(Decimal::ONE, eur_currency).unwrap(),
            eur(4_211)
        );
    }

    #[test]
    fn display_renders_major_units() {
        assert_eq!(usd(10_000).to_string(), "100.00 USD");
        assert_eq!(usd(-2_550).to_string(), "-25.50 USD");
        assert_eq!(usd(-50).to_string(), "-0.50 USD");
        assert_eq!(usd(5).to_string(), "0.05 USD");
        assert_eq!(
            Money::new(14_712, Currency::get("JPY").unwrap()).to_string(),
            "14712 JPY"
        );
        assert_eq!(
            Money::new(30_720, Currency::get("KWD").unwrap()).to_string(),
            "30.720 KWD"
        );
    }

    #[test]
    fn serde_uses_currency_code_strings() {
        let value = serde_json::to_value(usd(1_234)).unwrap();
        assert_eq!(value, serde_json::json!({"minor": 1234, "currency": "USD"}));

        let parsed: Money = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, usd(1_234));
    }

    #[test]
    fn serde_rejects_unknown_currency() {
        let result: Result<Money, _> =
            serde_json::from_value(serde_json::json!({"minor": 1, "currency": "ZZZ"}));
        assert!(result.is_err());
    }
}
