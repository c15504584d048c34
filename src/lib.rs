//! Peer-to-peer currency exchange: currency registry, cached market rates,
//! fee calculation, the offer lifecycle and an offline action queue, plus
//! the HTTP API that serves them and a client for it.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod offline;
pub mod routes;

pub use error::{ExchangeError, ExchangeResult};
