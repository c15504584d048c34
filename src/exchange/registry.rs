use std::collections::HashMap;

use crate::db::currency::Currency;
use crate::db::utils::normalize_code;
use crate::error::{ExchangeError, ExchangeResult};

pub const AFRICAN_CURRENCIES: &[&str] = &[
    "XOF", "XAF", "NGN", "GHS", "KES", "ZAR", "EGP", "MAD", "TZS", "UGX", "RWF", "ETB", "DZD",
    "TND", "CDF", "GNF", "MGA", "SLL", "MWK",
];

pub fn is_african(code: &str) -> bool {
    let code = normalize_code(code);
    AFRICAN_CURRENCIES.contains(&code.as_str())
}

/// Supported currencies keyed by code, kept in load order.
#[derive(Debug, Clone)]
pub struct CurrencyRegistry {
    currencies: Vec<Currency>,
    index: HashMap<String, usize>,
}

impl CurrencyRegistry {
    pub fn new(currencies: Vec<Currency>) -> ExchangeResult<Self> {
        let mut index = HashMap::with_capacity(currencies.len());
        let mut ordered = Vec::with_capacity(currencies.len());
        for mut currency in currencies {
            currency.code = normalize_code(&currency.code);
            if index.contains_key(&currency.code) {
                return Err(ExchangeError::DuplicateCurrency(currency.code));
            }
            index.insert(currency.code.clone(), ordered.len());
            ordered.push(currency);
        }
        Ok(Self {
            currencies: ordered,
            index,
        })
    }

    pub fn with_defaults() -> Self {
        let currencies = default_currencies();
        let index = currencies
            .iter()
            .enumerate()
            .map(|(position, currency)| (currency.code.clone(), position))
            .collect();
        Self { currencies, index }
    }

    pub fn lookup(&self, code: &str) -> ExchangeResult<&Currency> {
        let code = normalize_code(code);
        self.index
            .get(&code)
            .map(|position| &self.currencies[*position])
            .ok_or(ExchangeError::UnknownCurrency(code))
    }

    /// Like `lookup`, but inactive currencies count as unknown.
    pub fn require_active(&self, code: &str) -> ExchangeResult<&Currency> {
        let currency = self.lookup(code)?;
        if !currency.is_active {
            return Err(ExchangeError::UnknownCurrency(currency.code.clone()));
        }
        Ok(currency)
    }

    pub fn list_active(&self) -> impl Iterator<Item = &Currency> {
        self.currencies.iter().filter(|currency| currency.is_active)
    }

    pub fn len(&self) -> usize {
        self.currencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }
}

fn default_currencies() -> Vec<Currency> {
    vec![
        Currency::new("USD", "US Dollar", "$", "US", "🇺🇸"),
        Currency::new("EUR", "Euro", "€", "EU", "🇪🇺"),
        Currency::new("GBP", "British Pound", "£", "GB", "🇬🇧"),
        Currency::new("XOF", "West African CFA Franc", "CFA", "SN", "🇸🇳"),
        Currency::new("XAF", "Central African CFA Franc", "FCFA", "CM", "🇨🇲"),
        Currency::new("NGN", "Nigerian Naira", "₦", "NG", "🇳🇬"),
        Currency::new("GHS", "Ghanaian Cedi", "₵", "GH", "🇬🇭"),
        Currency::new("KES", "Kenyan Shilling", "KSh", "KE", "🇰🇪"),
        Currency::new("ZAR", "South African Rand", "R", "ZA", "🇿🇦"),
        Currency::new("EGP", "Egyptian Pound", "E£", "EG", "🇪🇬"),
        Currency::new("MAD", "Moroccan Dirham", "DH", "MA", "🇲🇦"),
        Currency::new("TZS", "Tanzanian Shilling", "TSh", "TZ", "🇹🇿"),
        Currency::new("UGX", "Ugandan Shilling", "USh", "UG", "🇺🇬"),
        Currency::new("RWF", "Rwandan Franc", "FRw", "RW", "🇷🇼"),
        Currency::new("ETB", "Ethiopian Birr", "Br", "ET", "🇪🇹"),
        Currency::new("CDF", "Congolese Franc", "FC", "CD", "🇨🇩"),
        Currency::new("GNF", "Guinean Franc", "FG", "GN", "🇬🇳").inactive(),
    ]
}
