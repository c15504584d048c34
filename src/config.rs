use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::{ExchangeError, ExchangeResult};

pub const DEFAULT_PRIMARY_RATE_URL: &str = "https://open.er-api.com/v6/latest/{base}";
pub const DEFAULT_SECONDARY_RATE_URL: &str = "https://api.exchangerate-api.com/v4/latest/{base}";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt_secret: String,
    pub max_connection_pooling: u32,
    pub port: u16,
    pub log_file: String,
    pub exchange: ExchangeSettings,
}

/// Tunables shared by the rate provider, calculator, offer manager and
/// offline queue.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub fee_rate: Decimal,
    pub base_currency: String,
    pub base_spread: Decimal,
    pub low_liquidity: Vec<String>,
    pub rate_ttl: Duration,
    pub primary_rate_url: String,
    pub secondary_rate_url: String,
    pub request_timeout: Duration,
    pub max_offline_retries: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            // 1%
            fee_rate: Decimal::new(1, 2),
            base_currency: "USD".to_string(),
            // 2%, elevated to 3% for low-liquidity pairs
            base_spread: Decimal::new(2, 2),
            low_liquidity: ["XAF", "CDF", "GNF", "MGA", "SLL", "MWK"]
                .iter()
                .map(|code| code.to_string())
                .collect(),
            rate_ttl: Duration::from_secs(5 * 60),
            primary_rate_url: DEFAULT_PRIMARY_RATE_URL.to_string(),
            secondary_rate_url: DEFAULT_SECONDARY_RATE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            max_offline_retries: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> ExchangeResult<Self> {
        // mandatory fields
        let database_url = dotenv::var("DATABASE_URL")
            .map_err(|_| ExchangeError::Config("DATABASE_URL must be set".to_string()))?;
        // optional fields
        let jwt_secret = dotenv::var("JWT_SECRET").unwrap_or("your-jwt-secret".to_string());
        let max_connection_pooling = env_or("MAX_CONNECTION_POOLING", 5u32)?;
        let port = env_or("PORT", 3000u16)?;
        let log_file = dotenv::var("LOG_FILE").unwrap_or("app.log".to_string());

        Ok(Self {
            database_url,
            jwt_secret,
            max_connection_pooling,
            port,
            log_file,
            exchange: ExchangeSettings::from_env()?,
        })
    }
}

impl ExchangeSettings {
    pub fn from_env() -> ExchangeResult<Self> {
        let defaults = Self::default();

        let low_liquidity = match dotenv::var("LOW_LIQUIDITY_CURRENCIES") {
            Ok(list) => list
                .split(',')
                .map(|code| code.trim().to_ascii_uppercase())
                .filter(|code| !code.is_empty())
                .collect(),
            Err(_) => defaults.low_liquidity,
        };

        let settings = Self {
            fee_rate: env_or("FEE_RATE", defaults.fee_rate)?,
            base_currency: dotenv::var("BASE_CURRENCY")
                .map(|code| code.to_ascii_uppercase())
                .unwrap_or(defaults.base_currency),
            base_spread: env_or("BASE_SPREAD", defaults.base_spread)?,
            low_liquidity,
            rate_ttl: Duration::from_secs(env_or("RATE_TTL_SECS", defaults.rate_ttl.as_secs())?),
            primary_rate_url: dotenv::var("PRIMARY_RATE_URL").unwrap_or(defaults.primary_rate_url),
            secondary_rate_url: dotenv::var("SECONDARY_RATE_URL")
                .unwrap_or(defaults.secondary_rate_url),
            request_timeout: Duration::from_millis(env_or(
                "REQUEST_TIMEOUT_MS",
                u64::try_from(defaults.request_timeout.as_millis()).unwrap_or(u64::MAX),
            )?),
            max_offline_retries: env_or("OFFLINE_MAX_RETRIES", defaults.max_offline_retries)?,
        };

        if settings.fee_rate < Decimal::ZERO || settings.fee_rate >= Decimal::ONE {
            return Err(ExchangeError::Config(format!(
                "FEE_RATE must be within [0, 1), got {}",
                settings.fee_rate
            )));
        }
        if settings.base_spread < Decimal::ZERO || settings.base_spread >= Decimal::ONE {
            return Err(ExchangeError::Config(format!(
                "BASE_SPREAD must be within [0, 1), got {}",
                settings.base_spread
            )));
        }

        Ok(settings)
    }
}

fn env_or<T>(key: &str, default: T) -> ExchangeResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| ExchangeError::Config(format!("{key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_policy() {
        let settings = ExchangeSettings::default();
        assert_eq!(settings.fee_rate, Decimal::new(1, 2));
        assert_eq!(settings.base_spread, Decimal::new(2, 2));
        assert_eq!(settings.rate_ttl, Duration::from_secs(300));
        assert_eq!(settings.max_offline_retries, 3);
        assert_eq!(settings.base_currency, "USD");
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let value: u32 = env_or("P2P_EXCHANGE_SURELY_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
