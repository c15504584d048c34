pub mod calculator;
pub mod offers;
pub mod rates;
pub mod registry;

pub use calculator::{ExchangeCalculator, Quote};
pub use offers::OfferManager;
pub use rates::{ExchangeRate, RateProvider};
pub use registry::CurrencyRegistry;
