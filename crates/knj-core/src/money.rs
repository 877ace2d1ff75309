// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decimal money with explicit currency and FX provenance.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors from monetary parsing and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    /// The currency code is not a three-letter ISO 4217 code.
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
    /// The amount string did not parse as a decimal.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    /// Arithmetic on two different currencies.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Left operand currency.
        left: Currency,
        /// Right operand currency.
        right: Currency,
    },
    /// Decimal overflow during arithmetic.
    #[error("amount overflow")]
    Overflow,
}

/// Three-letter ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// The euro, the home currency of every deployment so far.
    #[must_use]
    pub fn eur() -> Self {
        Currency("EUR".to_string())
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_uppercase()) {
            Ok(Currency(trimmed.to_string()))
        } else {
            Err(MoneyError::InvalidCurrency(s.to_string()))
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decimal amount in a single currency.
///
/// Cross-currency amounts carry the FX date that selects the conversion
/// rate in force on the posting date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Exact decimal amount. Serialises as a string.
    pub amount: Decimal,
    /// ISO 4217 currency.
    pub currency: Currency,
    /// Date of the FX rate applied, present iff the currency is not the
    /// home currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_date: Option<NaiveDate>,
}

impl Money {
    /// A home-currency amount with no FX provenance.
    #[must_use]
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self {
            amount,
            currency,
            fx_date: None,
        }
    }

    /// A cross-currency amount carrying its FX date.
    #[must_use]
    pub fn with_fx_date(mut self, date: NaiveDate) -> Self {
        self.fx_date = Some(date);
        self
    }

    /// Checked addition. Both operands must share a currency.
    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money {
            amount,
            currency: self.currency.clone(),
            fx_date: self.fx_date,
        })
    }

    /// Absolute difference from `other`, ignoring FX dates.
    pub fn abs_diff(&self, other: &Money) -> Result<Decimal, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok((self.amount - other.amount).abs())
    }

    /// Fixed two-decimal rendering used by every export artifact.
    #[must_use]
    pub fn format_2dp(&self) -> String {
        format!("{:.2}", self.amount.round_dp(2))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.format_2dp(), self.currency)
    }
}

/// Parse a decimal that may use either `1.234,56` or `1,234.56` grouping.
///
/// Both separators present disambiguates by position; a single separator
/// followed by exactly two digits is treated as the decimal mark.
pub fn parse_localized_decimal(raw: &str) -> Result<Decimal, MoneyError> {
    let s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if s.is_empty() {
        return Err(MoneyError::InvalidAmount(raw.to_string()));
    }

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            // The rightmost separator is the decimal mark.
            let (dec_mark, group_mark) = if d > c { ('.', ',') } else { (',', '.') };
            let cleaned: String = s.chars().filter(|ch| *ch != group_mark).collect();
            cleaned.replace(dec_mark, ".")
        }
        (None, Some(c)) => {
            let frac_len = s.len() - c - 1;
            if frac_len == 3 {
                // `1,000` style grouping with no decimal part.
                s.replace(',', "")
            } else {
                s.replace(',', ".")
            }
        }
        (Some(d), None) => {
            let frac_len = s.len() - d - 1;
            if frac_len == 3 && s.matches('.').count() >= 2 {
                // `1.000.000` style grouping.
                s.replace('.', "")
            } else if frac_len == 3 && s.matches('.').count() == 1 {
                // Ambiguous `1.000`: a single dot with three digits is
                // grouping in the locales we ingest.
                s.replace('.', "")
            } else {
                s
            }
        }
        (None, None) => s,
    };

    Decimal::from_str(&normalized).map_err(|_| MoneyError::InvalidAmount(raw.to_string()))
}
