use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rates::RateProvider;
use crate::db::utils::normalize_code;
use crate::error::{ExchangeError, ExchangeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub from_currency: String,
    pub to_currency: String,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub rate: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

/// Converted amount, fee and net total for a single rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakdown {
    pub to_amount: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

pub fn calculate_with_rate(
    amount: Decimal,
    rate: Decimal,
    fee_rate: Decimal,
) -> ExchangeResult<Breakdown> {
    if amount <= Decimal::ZERO {
        return Err(ExchangeError::InvalidAmount);
    }
    let fee = amount * fee_rate;
    let to_amount = amount * rate;
    if fee > to_amount {
        return Err(ExchangeError::FeeExceedsAmount);
    }
    Ok(Breakdown {
        to_amount,
        fee,
        total: to_amount - fee,
    })
}

pub struct ExchangeCalculator {
    rates: Arc<RateProvider>,
    fee_rate: Decimal,
}

impl ExchangeCalculator {
    pub fn new(rates: Arc<RateProvider>, fee_rate: Decimal) -> Self {
        Self { rates, fee_rate }
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    pub async fn calculate(&self, amount: Decimal, from: &str, to: &str) -> ExchangeResult<Quote> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount);
        }
        let from = normalize_code(from);
        let to = normalize_code(to);

        let rate = self.rates.get_rate(&from, &to).await;
        if rate.is_zero() {
            tracing::warn!("Quote refused, no rate for {from}/{to}");
            return Err(ExchangeError::RateUnavailable { from, to });
        }

        let breakdown = calculate_with_rate(amount, rate, self.fee_rate)?;
        Ok(Quote {
            from_currency: from,
            to_currency: to,
            from_amount: amount,
            to_amount: breakdown.to_amount,
            rate,
            fee: breakdown.fee,
            total: breakdown.total,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::config::ExchangeSettings;

    fn calculator() -> ExchangeCalculator {
        // no remote sources, static table only
        let settings = ExchangeSettings::default();
        let rates = Arc::new(RateProvider::new(&settings, vec![]));
        ExchangeCalculator::new(rates, settings.fee_rate)
    }

    #[tokio::test]
    async fn fee_is_exactly_amount_times_fee_rate() {
        let calculator = calculator();
        for raw in ["0.01", "1", "250.75", "10000", "123456.789"] {
            let amount = Decimal::from_str(raw).unwrap();
            let quote = calculator.calculate(amount, "USD", "NGN").await.unwrap();
            assert_eq!(quote.fee, amount * Decimal::new(1, 2));
            assert_eq!(quote.to_amount, amount * quote.rate);
            assert_eq!(quote.total, quote.to_amount - quote.fee);
        }
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let calculator = calculator();
        assert!(matches!(
            calculator.calculate(Decimal::ZERO, "USD", "NGN").await,
            Err(ExchangeError::InvalidAmount)
        ));
        assert!(matches!(
            calculator.calculate(Decimal::from(-5), "USD", "NGN").await,
            Err(ExchangeError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn missing_rate_is_never_quoted() {
        let calculator = calculator();
        match calculator.calculate(Decimal::from(100), "XOF", "JPY").await {
            Err(ExchangeError::RateUnavailable { from, to }) => {
                assert_eq!(from, "XOF");
                assert_eq!(to, "JPY");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn fee_larger_than_converted_amount_is_refused() {
        // 100 NGN at 0.0006 USD/NGN is 0.06 USD, the 1 NGN fee is larger
        let result = calculate_with_rate(Decimal::from(100), Decimal::new(6, 4), Decimal::new(1, 2));
        assert!(matches!(result, Err(ExchangeError::FeeExceedsAmount)));
    }

    #[test]
    fn breakdown_arithmetic() {
        let breakdown =
            calculate_with_rate(Decimal::from(10000), Decimal::new(15, 1), Decimal::new(1, 2))
                .unwrap();
        assert_eq!(breakdown.to_amount, Decimal::from(15000));
        assert_eq!(breakdown.fee, Decimal::from(100));
        assert_eq!(breakdown.total, Decimal::from(14900));
    }
}
