use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Insufficient {0} balance")]
    InsufficientFunds(String),

    #[error("No exchange rate available for {from}/{to}")]
    RateUnavailable { from: String, to: String },

    #[error("Fee exceeds the converted amount")]
    FeeExceedsAmount,

    #[error("Offer is no longer open")]
    OfferNotOpen,

    #[error("Not authorized to perform this operation")]
    NotAuthorized,

    #[error("Request timed out")]
    NetworkTimeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend error {status}: {message}")]
    BackendError { status: u16, message: String },

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Duplicate currency: {0}")]
    DuplicateCurrency(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid or missing token")]
    Unauthenticated,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

impl ExchangeError {
    /// Failures caused by not reaching the backend at all. Only these are
    /// worth deferring to the offline queue; everything else is an answer.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ExchangeError::NetworkTimeout | ExchangeError::Network(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::InvalidAmount => "invalid_amount",
            ExchangeError::InsufficientFunds(_) => "insufficient_funds",
            ExchangeError::RateUnavailable { .. } => "rate_unavailable",
            ExchangeError::FeeExceedsAmount => "fee_exceeds_amount",
            ExchangeError::OfferNotOpen => "offer_not_open",
            ExchangeError::NotAuthorized => "not_authorized",
            ExchangeError::NetworkTimeout => "network_timeout",
            ExchangeError::Network(_) => "network",
            ExchangeError::BackendError { .. } => "backend",
            ExchangeError::UnknownCurrency(_) => "unknown_currency",
            ExchangeError::DuplicateCurrency(_) => "duplicate_currency",
            ExchangeError::NotFound(_) => "not_found",
            ExchangeError::Unauthenticated => "unauthenticated",
            ExchangeError::InvalidCredentials => "invalid_credentials",
            ExchangeError::Validation(_) => "validation",
            ExchangeError::Storage(_) => "storage",
            ExchangeError::Serialization(_) => "serialization",
            ExchangeError::Config(_) => "config",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ExchangeError::InvalidAmount
            | ExchangeError::UnknownCurrency(_)
            | ExchangeError::DuplicateCurrency(_)
            | ExchangeError::Validation(_) => StatusCode::BAD_REQUEST,
            ExchangeError::InsufficientFunds(_) | ExchangeError::FeeExceedsAmount => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ExchangeError::RateUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::OfferNotOpen => StatusCode::CONFLICT,
            ExchangeError::NotAuthorized => StatusCode::FORBIDDEN,
            ExchangeError::Unauthenticated | ExchangeError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            ExchangeError::NotFound(_) => StatusCode::NOT_FOUND,
            ExchangeError::NetworkTimeout => StatusCode::GATEWAY_TIMEOUT,
            ExchangeError::Network(_) => StatusCode::BAD_GATEWAY,
            ExchangeError::BackendError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ExchangeError::Storage(_)
            | ExchangeError::Serialization(_)
            | ExchangeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn subject(&self) -> Option<String> {
        match self {
            ExchangeError::InsufficientFunds(currency)
            | ExchangeError::UnknownCurrency(currency)
            | ExchangeError::DuplicateCurrency(currency) => Some(currency.clone()),
            ExchangeError::NotFound(what) => Some(what.clone()),
            ExchangeError::RateUnavailable { from, to } => Some(format!("{from}/{to}")),
            _ => None,
        }
    }

    /// Rebuilds the typed error from a non-2xx API response body.
    pub fn from_body(status: u16, body: ErrorBody) -> Self {
        let subject = body.subject.unwrap_or_default();
        match body.code.as_deref() {
            Some("invalid_amount") => ExchangeError::InvalidAmount,
            Some("insufficient_funds") => ExchangeError::InsufficientFunds(subject),
            Some("rate_unavailable") => {
                let (from, to) = subject.split_once('/').unwrap_or((subject.as_str(), ""));
                ExchangeError::RateUnavailable {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            Some("fee_exceeds_amount") => ExchangeError::FeeExceedsAmount,
            Some("offer_not_open") => ExchangeError::OfferNotOpen,
            Some("not_authorized") => ExchangeError::NotAuthorized,
            Some("unknown_currency") => ExchangeError::UnknownCurrency(subject),
            Some("not_found") => ExchangeError::NotFound(subject),
            Some("unauthenticated") => ExchangeError::Unauthenticated,
            Some("invalid_credentials") => ExchangeError::InvalidCredentials,
            Some("validation") => ExchangeError::Validation(body.message),
            Some("network_timeout") => ExchangeError::NetworkTimeout,
            Some("network") => ExchangeError::Network(body.message),
            // a proxy in front of the API answers without our body
            None if status == 504 => ExchangeError::NetworkTimeout,
            None if status == 502 || status == 503 => ExchangeError::Network(body.message),
            _ => ExchangeError::BackendError {
                status,
                message: body.message,
            },
        }
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        let body = ErrorBody {
            message: self.to_string(),
            code: Some(self.code().to_string()),
            subject: self.subject(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ExchangeError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ExchangeError::NotFound("Record".to_string()),
            sqlx::Error::PoolTimedOut => ExchangeError::NetworkTimeout,
            sqlx::Error::Io(err) => ExchangeError::Network(err.to_string()),
            other => ExchangeError::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::NetworkTimeout
        } else if err.is_decode() {
            ExchangeError::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            ExchangeError::BackendError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(err: std::io::Error) -> Self {
        ExchangeError::Storage(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ExchangeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ExchangeError::NetworkTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_classified() {
        assert!(ExchangeError::NetworkTimeout.is_connectivity());
        assert!(ExchangeError::Network("refused".into()).is_connectivity());
        assert!(!ExchangeError::OfferNotOpen.is_connectivity());
        assert!(!ExchangeError::BackendError {
            status: 500,
            message: "boom".into()
        }
        .is_connectivity());
    }

    #[test]
    fn typed_errors_survive_the_wire() {
        let original = ExchangeError::InsufficientFunds("NGN".into());
        let body = ErrorBody {
            message: original.to_string(),
            code: Some(original.code().to_string()),
            subject: original.subject(),
        };
        let json = serde_json::to_string(&body).unwrap();
        let decoded: ErrorBody = serde_json::from_str(&json).unwrap();

        match ExchangeError::from_body(422, decoded) {
            ExchangeError::InsufficientFunds(currency) => assert_eq!(currency, "NGN"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_codes_become_backend_errors() {
        let body = ErrorBody {
            message: "handler exploded".into(),
            code: None,
            subject: None,
        };
        match ExchangeError::from_body(500, body) {
            ExchangeError::BackendError { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "handler exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn wire(err: &ExchangeError) -> ExchangeError {
        let body = ErrorBody {
            message: err.to_string(),
            code: Some(err.code().to_string()),
            subject: err.subject(),
        };
        ExchangeError::from_body(err.status().as_u16(), body)
    }

    #[test]
    fn connectivity_survives_the_wire() {
        assert!(matches!(
            wire(&ExchangeError::NetworkTimeout),
            ExchangeError::NetworkTimeout
        ));
        assert!(wire(&ExchangeError::Network("pool closed".into())).is_connectivity());
        assert!(!wire(&ExchangeError::OfferNotOpen).is_connectivity());
    }

    #[test]
    fn bare_gateway_failures_are_connectivity() {
        for status in [502, 503, 504] {
            let body = ErrorBody {
                message: "upstream unavailable".into(),
                code: None,
                subject: None,
            };
            let err = ExchangeError::from_body(status, body);
            assert!(err.is_connectivity(), "{status} gave {err:?}");
        }
    }

    #[test]
    fn rate_unavailable_round_trips_its_pair() {
        let body = ErrorBody {
            message: "no rate".into(),
            code: Some("rate_unavailable".into()),
            subject: Some("XOF/NGN".into()),
        };
        match ExchangeError::from_body(503, body) {
            ExchangeError::RateUnavailable { from, to } => {
                assert_eq!(from, "XOF");
                assert_eq!(to, "NGN");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
