use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::currency::Currency;
use crate::db::offer::{NewOffer, OfferView, P2POffer};
use crate::db::tx::Transaction;
use crate::db::wallet::Wallet;
use crate::db::ExchangeBackend;
use crate::error::{ErrorBody, ExchangeError, ExchangeResult};
use crate::exchange::calculator::Quote;
use crate::exchange::rates::ExchangeRate;
use crate::routes::auth::{AuthResponse, RefreshTokenRequest};
use crate::routes::exchange::{ExchangeRequest, RatesView};
use crate::routes::offers::CreateOfferRequest;
use crate::routes::wallet::{DepositRequest, KycRequest, ProfileRequest};

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_name: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: Uuid,
    access_token: String,
    refresh_token: String,
}

/// HTTP client for the `/v1` API. After `register` or `login` it acts as
/// that user, so it can stand in for the backend on a device.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ExchangeError::Config(format!("unable to build http client: {err}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            session: RwLock::new(None),
        })
    }

    pub async fn user_id(&self) -> Option<Uuid> {
        self.session.read().await.as_ref().map(|session| session.user_id)
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> ExchangeResult<AuthResponse> {
        let body = Credentials {
            email,
            password,
            full_name,
        };
        let response: AuthResponse = self
            .send(self.request(Method::POST, "/auth/register").json(&body))
            .await?;
        self.remember(&response).await;
        Ok(response)
    }

    pub async fn login(&self, email: &str, password: &str) -> ExchangeResult<AuthResponse> {
        let body = Credentials {
            email,
            password,
            full_name: None,
        };
        let response: AuthResponse = self
            .send(self.request(Method::POST, "/auth/login").json(&body))
            .await?;
        self.remember(&response).await;
        Ok(response)
    }

    pub async fn refresh(&self) -> ExchangeResult<AuthResponse> {
        let refresh_token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .ok_or(ExchangeError::Unauthenticated)?;
        let response: AuthResponse = self
            .send(
                self.request(Method::POST, "/auth/refresh")
                    .json(&RefreshTokenRequest { refresh_token }),
            )
            .await?;
        self.remember(&response).await;
        Ok(response)
    }

    pub async fn currencies(&self) -> ExchangeResult<Vec<Currency>> {
        self.send(self.request(Method::GET, "/currencies")).await
    }

    pub async fn rates(&self, base: &str) -> ExchangeResult<RatesView> {
        self.send(self.request(Method::GET, &format!("/rates/{base}")))
            .await
    }

    pub async fn african_rates(&self, base: &str) -> ExchangeResult<RatesView> {
        self.send(self.request(Method::GET, &format!("/rates/{base}/african")))
            .await
    }

    pub async fn rate(&self, from: &str, to: &str) -> ExchangeResult<ExchangeRate> {
        self.send(self.request(Method::GET, &format!("/rates/{from}/{to}")))
            .await
    }

    pub async fn quote(&self, amount: Decimal, from: &str, to: &str) -> ExchangeResult<Quote> {
        let body = ExchangeRequest {
            transaction_id: None,
            amount,
            from_currency: from.to_string(),
            to_currency: to.to_string(),
        };
        self.send(self.request(Method::POST, "/exchange/quote").json(&body))
            .await
    }

    async fn remember(&self, response: &AuthResponse) {
        *self.session.write().await = Some(Session {
            user_id: response.user_uid,
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
        });
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/v1{path}", self.base_url))
    }

    // the API only lets a user act on their own account
    async fn authorized(
        &self,
        user_id: Uuid,
        method: Method,
        path: &str,
    ) -> ExchangeResult<RequestBuilder> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(ExchangeError::Unauthenticated)?;
        if session.user_id != user_id {
            return Err(ExchangeError::NotAuthorized);
        }
        Ok(self
            .request(method, path)
            .bearer_auth(&session.access_token))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ExchangeResult<T> {
        let response = Self::checked(request).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> ExchangeResult<()> {
        Self::checked(request).await?;
        Ok(())
    }

    async fn checked(request: RequestBuilder) -> ExchangeResult<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let raw = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&raw).unwrap_or_else(|_| ErrorBody {
            message: if raw.is_empty() {
                status.to_string()
            } else {
                raw
            },
            code: None,
            subject: None,
        });
        tracing::warn!("API answered {status}: {}", body.message);
        Err(ExchangeError::from_body(status.as_u16(), body))
    }

    fn queued(status: StatusCode) -> ExchangeResult<()> {
        // a server never defers, so 202 on a settling call is a protocol error
        if status == StatusCode::ACCEPTED {
            return Err(ExchangeError::BackendError {
                status: status.as_u16(),
                message: "request was deferred by the server".to_string(),
            });
        }
        Ok(())
    }

    async fn send_confirmed<T: DeserializeOwned>(&self, request: RequestBuilder) -> ExchangeResult<T> {
        let response = Self::checked(request).await?;
        Self::queued(response.status())?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ExchangeBackend for ApiClient {
    async fn wallet(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Option<Wallet>> {
        let request = self
            .authorized(user_id, Method::GET, &format!("/wallets/{currency}"))
            .await?;
        match self.send(request).await {
            Ok(wallet) => Ok(Some(wallet)),
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn wallets(&self, user_id: Uuid) -> ExchangeResult<Vec<Wallet>> {
        let request = self.authorized(user_id, Method::GET, "/wallets").await?;
        self.send(request).await
    }

    async fn deposit(
        &self,
        user_id: Uuid,
        currency: &str,
        amount: Decimal,
    ) -> ExchangeResult<Transaction> {
        let body = DepositRequest {
            currency: currency.to_string(),
            amount,
        };
        let request = self
            .authorized(user_id, Method::POST, "/wallets/deposit")
            .await?
            .json(&body);
        self.send(request).await
    }

    async fn insert_offer(&self, offer: &NewOffer) -> ExchangeResult<P2POffer> {
        let body = CreateOfferRequest {
            offer_id: Some(offer.id),
            from_currency: offer.from_currency.clone(),
            from_amount: offer.from_amount,
            to_currency: offer.to_currency.clone(),
            to_amount: offer.to_amount,
        };
        let request = self
            .authorized(offer.creator_id, Method::POST, "/offers")
            .await?
            .json(&body);
        let view: OfferView = self.send_confirmed(request).await?;
        Ok(view.offer)
    }

    async fn offer(&self, offer_id: Uuid) -> ExchangeResult<Option<P2POffer>> {
        let request = self.request(Method::GET, &format!("/offers/{offer_id}"));
        match self.send::<OfferView>(request).await {
            Ok(view) => Ok(Some(view.offer)),
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn open_offers(&self) -> ExchangeResult<Vec<P2POffer>> {
        let views: Vec<OfferView> = self.send(self.request(Method::GET, "/offers")).await?;
        Ok(views.into_iter().map(|view| view.offer).collect())
    }

    async fn settle_offer(&self, offer_id: Uuid, accepter_id: Uuid) -> ExchangeResult<Transaction> {
        let request = self
            .authorized(accepter_id, Method::POST, &format!("/offers/{offer_id}/accept"))
            .await?;
        self.send_confirmed(request).await
    }

    async fn cancel_offer(&self, offer_id: Uuid, requester_id: Uuid) -> ExchangeResult<P2POffer> {
        let request = self
            .authorized(requester_id, Method::POST, &format!("/offers/{offer_id}/cancel"))
            .await?;
        let view: OfferView = self.send_confirmed(request).await?;
        Ok(view.offer)
    }

    // the server quotes again at its current rate
    async fn execute_exchange(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        quote: &Quote,
    ) -> ExchangeResult<Transaction> {
        let body = ExchangeRequest {
            transaction_id: Some(transaction_id),
            amount: quote.from_amount,
            from_currency: quote.from_currency.clone(),
            to_currency: quote.to_currency.clone(),
        };
        let request = self
            .authorized(user_id, Method::POST, "/exchange/execute")
            .await?
            .json(&body);
        self.send_confirmed(request).await
    }

    async fn transactions(&self, user_id: Uuid) -> ExchangeResult<Vec<Transaction>> {
        let request = self.authorized(user_id, Method::GET, "/transactions").await?;
        self.send(request).await
    }

    async fn submit_kyc(&self, user_id: Uuid, document: &serde_json::Value) -> ExchangeResult<()> {
        let request = self
            .authorized(user_id, Method::POST, "/kyc")
            .await?
            .json(&KycRequest {
                document: document.clone(),
            });
        self.send_empty(request).await
    }

    async fn update_profile(&self, user_id: Uuid, full_name: &str) -> ExchangeResult<()> {
        let request = self
            .authorized(user_id, Method::PUT, "/profile")
            .await?
            .json(&ProfileRequest {
                full_name: full_name.to_string(),
            });
        self.send_empty(request).await
    }
}
