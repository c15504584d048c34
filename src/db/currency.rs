use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Currency {
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub country_code: String,
    pub flag: String,
    pub is_active: bool,
}

impl Currency {
    pub fn new(code: &str, name: &str, symbol: &str, country_code: &str, flag: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            country_code: country_code.to_string(),
            flag: flag.to_string(),
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}
