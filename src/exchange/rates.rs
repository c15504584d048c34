use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::registry::is_african;
use crate::config::ExchangeSettings;
use crate::db::utils::normalize_code;
use crate::error::{ExchangeError, ExchangeResult};

/// Currency code -> units of that currency per one unit of the table's base.
pub type RateTable = HashMap<String, Decimal>;

// Approximate USD rates used when every remote source is down.
const STATIC_USD_RATES: &[(&str, i64, u32)] = &[
    ("USD", 1, 0),
    ("EUR", 92, 2),
    ("GBP", 79, 2),
    ("XOF", 6055, 1),
    ("XAF", 6055, 1),
    ("NGN", 1550, 0),
    ("GHS", 152, 1),
    ("KES", 1295, 1),
    ("ZAR", 183, 1),
    ("EGP", 485, 1),
    ("MAD", 995, 2),
    ("TZS", 2650, 0),
    ("UGX", 3750, 0),
    ("RWF", 1320, 0),
    ("ETB", 120, 0),
    ("DZD", 1345, 1),
    ("TND", 312, 2),
    ("CDF", 2850, 0),
    ("GNF", 8600, 0),
    ("MGA", 4550, 0),
    ("SLL", 22500, 0),
    ("MWK", 1735, 0),
];

pub fn static_rates(base: &str) -> RateTable {
    let usd: RateTable = STATIC_USD_RATES
        .iter()
        .map(|(code, mantissa, scale)| (code.to_string(), Decimal::new(*mantissa, *scale)))
        .collect();

    let base = normalize_code(base);
    if base == "USD" {
        return usd;
    }
    match usd.get(&base) {
        Some(base_rate) => usd
            .iter()
            .filter_map(|(code, rate)| {
                rate.checked_div(*base_rate)
                    .map(|rebased| (code.clone(), rebased))
            })
            .collect(),
        None => {
            tracing::warn!("No static rates for base currency {base}");
            HashMap::from([(base, Decimal::ONE)])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn between(previous: Option<Decimal>, current: Decimal) -> Self {
        match previous {
            Some(previous) if current > previous => Trend::Up,
            Some(previous) if current < previous => Trend::Down,
            _ => Trend::Stable,
        }
    }
}

/// Directional rate quoted to users, spread already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from_currency: String,
    pub to_currency: String,
    pub rate: Decimal,
    pub spread: Decimal,
    pub last_updated_at: DateTime<Utc>,
    pub trend: Trend,
}

#[async_trait]
pub trait RateSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, base: &str) -> ExchangeResult<RateTable>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

/// Third-party REST endpoint answering `{"rates": {"CCY": number}}`.
/// `{base}` in the URL template is replaced by the requested base currency.
pub struct HttpRateSource {
    name: String,
    url_template: String,
    client: reqwest::Client,
}

impl HttpRateSource {
    pub fn new(name: &str, url_template: &str, timeout: Duration) -> ExchangeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ExchangeError::Config(format!("unable to build http client: {err}")))?;
        Ok(Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            client,
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, base: &str) -> ExchangeResult<RateTable> {
        let url = self.url_template.replace("{base}", base);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExchangeError::BackendError {
                status: status.as_u16(),
                message: format!("{} answered {status}", self.name),
            });
        }

        let body: RatesResponse = response.json().await?;
        let rates: RateTable = body
            .rates
            .into_iter()
            .filter_map(|(code, rate)| {
                Decimal::from_f64(rate)
                    .filter(|rate| *rate > Decimal::ZERO)
                    .map(|rate| (normalize_code(&code), rate))
            })
            .collect();
        Ok(rates)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: RateTable,
    pub fetched_at: DateTime<Utc>,
    // table this entry replaced, kept for trend only
    pub previous: Option<RateTable>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.fetched_at) >= ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateOrigin {
    Cache,
    Remote(String),
    Static,
}

#[derive(Debug, Clone)]
pub struct RateSnapshot {
    pub base: String,
    pub rates: RateTable,
    pub fetched_at: DateTime<Utc>,
    pub previous: Option<RateTable>,
    pub origin: RateOrigin,
}

pub struct RateProvider {
    sources: Vec<Arc<dyn RateSource>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    base_currency: String,
    base_spread: Decimal,
    low_liquidity: HashSet<String>,
    ttl: Duration,
    timeout: Duration,
    // one remote refresh at a time
    refresh: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl RateProvider {
    /// Sources are tried in order; an empty list goes straight to the
    /// static table.
    pub fn new(settings: &ExchangeSettings, sources: Vec<Arc<dyn RateSource>>) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
            base_currency: normalize_code(&settings.base_currency),
            base_spread: settings.base_spread,
            low_liquidity: settings
                .low_liquidity
                .iter()
                .map(|code| normalize_code(code))
                .collect(),
            ttl: settings.rate_ttl,
            timeout: settings.request_timeout,
            refresh: Mutex::new(()),
            last_error: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &ExchangeSettings) -> ExchangeResult<Self> {
        let primary = HttpRateSource::new(
            "primary",
            &settings.primary_rate_url,
            settings.request_timeout,
        )?;
        let secondary = HttpRateSource::new(
            "secondary",
            &settings.secondary_rate_url,
            settings.request_timeout,
        )?;
        Ok(Self::new(
            settings,
            vec![Arc::new(primary), Arc::new(secondary)],
        ))
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    pub async fn get_rates(&self, base: &str) -> RateTable {
        self.snapshot(base).await.rates
    }

    /// Never fails: cache, then each remote source, then the static table.
    pub async fn snapshot(&self, base: &str) -> RateSnapshot {
        let base = normalize_code(base);
        if let Some(snapshot) = self.cached(&base).await {
            return snapshot;
        }

        // callers that missed together wait here and reuse the winner's fetch
        let _refresh = self.refresh.lock().await;
        if let Some(snapshot) = self.cached(&base).await {
            return snapshot;
        }
        let now = Utc::now();

        for source in &self.sources {
            let fetched = tokio::time::timeout(self.timeout, source.fetch(&base))
                .await
                .map_err(ExchangeError::from)
                .and_then(|result| result);

            match fetched {
                Ok(mut rates) if !rates.is_empty() => {
                    rates.entry(base.clone()).or_insert(Decimal::ONE);

                    let mut cache = self.cache.write().await;
                    let previous = cache.remove(&base).map(|entry| entry.value);
                    cache.insert(
                        base.clone(),
                        CacheEntry {
                            value: rates.clone(),
                            fetched_at: now,
                            previous: previous.clone(),
                        },
                    );
                    tracing::info!(
                        "Fetched {} rates for {base} from {} source",
                        rates.len(),
                        source.name()
                    );
                    return RateSnapshot {
                        base,
                        rates,
                        fetched_at: now,
                        previous,
                        origin: RateOrigin::Remote(source.name().to_string()),
                    };
                }
                Ok(_) => {
                    tracing::warn!("{} source returned no rates for {base}", source.name());
                }
                Err(err) => {
                    tracing::warn!("{} source failed for {base}: {err}", source.name());
                }
            }
        }

        tracing::error!("All rate sources failed for {base}, using static fallback rates");
        self.record_error(format!("rate sources unavailable for {base}"))
            .await;

        RateSnapshot {
            rates: static_rates(&base),
            base,
            fetched_at: now,
            previous: None,
            origin: RateOrigin::Static,
        }
    }

    async fn cached(&self, base: &str) -> Option<RateSnapshot> {
        let cache = self.cache.read().await;
        let entry = cache.get(base)?;
        if entry.is_expired(Utc::now(), self.ttl) {
            return None;
        }
        Some(RateSnapshot {
            base: base.to_string(),
            rates: entry.value.clone(),
            fetched_at: entry.fetched_at,
            previous: entry.previous.clone(),
            origin: RateOrigin::Cache,
        })
    }

    /// Cross rate `rates[to] / rates[from]`. Zero means "no rate", never a
    /// real price; the reason is kept in `last_error`.
    pub async fn get_rate(&self, from: &str, to: &str) -> Decimal {
        let from = normalize_code(from);
        let to = normalize_code(to);
        if from == to {
            return Decimal::ONE;
        }

        let snapshot = self.snapshot(&self.base_currency).await;
        match cross_rate(&snapshot.rates, &from, &to) {
            Some(rate) => rate,
            None => {
                tracing::error!("Exchange rate unavailable for {from}/{to}");
                self.record_error(format!("exchange rate unavailable for {from}/{to}"))
                    .await;
                Decimal::ZERO
            }
        }
    }

    pub fn spread_for(&self, from: &str, to: &str) -> Decimal {
        let from = normalize_code(from);
        let to = normalize_code(to);
        if self.low_liquidity.contains(&from) || self.low_liquidity.contains(&to) {
            self.base_spread * Decimal::new(15, 1)
        } else {
            self.base_spread
        }
    }

    /// Platform margin: the quoted rate is the market rate minus the spread.
    pub fn apply_spread(&self, rate: Decimal, from: &str, to: &str) -> Decimal {
        rate * (Decimal::ONE - self.spread_for(from, to))
    }

    pub async fn african_rates(&self, base: &str) -> RateTable {
        self.get_rates(base)
            .await
            .into_iter()
            .filter(|(code, _)| is_african(code))
            .collect()
    }

    pub async fn quote(&self, from: &str, to: &str) -> ExchangeResult<ExchangeRate> {
        let from = normalize_code(from);
        let to = normalize_code(to);
        let snapshot = self.snapshot(&self.base_currency).await;

        let rate = if from == to {
            Some(Decimal::ONE)
        } else {
            cross_rate(&snapshot.rates, &from, &to)
        };
        let Some(rate) = rate else {
            self.record_error(format!("exchange rate unavailable for {from}/{to}"))
                .await;
            return Err(ExchangeError::RateUnavailable { from, to });
        };

        let quoted = self.apply_spread(rate, &from, &to);
        let previous = snapshot
            .previous
            .as_ref()
            .and_then(|previous| cross_rate(previous, &from, &to))
            .map(|previous| self.apply_spread(previous, &from, &to));

        Ok(ExchangeRate {
            spread: self.spread_for(&from, &to),
            trend: Trend::between(previous, quoted),
            rate: quoted,
            last_updated_at: snapshot.fetched_at,
            from_currency: from,
            to_currency: to,
        })
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    pub async fn invalidate(&self, base: &str) {
        self.cache.write().await.remove(&normalize_code(base));
    }

    async fn record_error(&self, message: String) {
        *self.last_error.lock().await = Some(message);
    }
}

fn cross_rate(rates: &RateTable, from: &str, to: &str) -> Option<Decimal> {
    let from_rate = rates.get(from).filter(|rate| **rate > Decimal::ZERO)?;
    let to_rate = rates.get(to).filter(|rate| **rate > Decimal::ZERO)?;
    to_rate.checked_div(*from_rate)
}
