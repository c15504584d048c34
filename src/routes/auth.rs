use std::sync::Arc;
use std::time::Duration;

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2, PasswordHash, PasswordVerifier,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_email::Email;
use uuid::Uuid;

use crate::db::UserStore;
use crate::error::{ExchangeError, ExchangeResult};

const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    sub: Uuid, // user_id
    exp: i64,  // expiration timestamp
    iat: i64,  // issued at timestamp
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    email: Email,
    password: String,
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: Email,
    password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user_uid: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

// Authentication service
pub struct AuthService {
    users: Arc<dyn UserStore>,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, jwt_secret: String) -> Self {
        Self { users, jwt_secret }
    }

    pub async fn register(&self, req: RegisterRequest) -> ExchangeResult<AuthResponse> {
        if self.users.find_user_by_email(req.email.as_str()).await?.is_some() {
            return Err(ExchangeError::Validation("User already exists".to_string()));
        }

        crate::routes::utils::check_password(&req.password)?;

        let salt = SaltString::generate(&mut rand::thread_rng());
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|err| ExchangeError::Storage(format!("unable to hash password: {err}")))?
            .to_string();

        let (user, email) = self
            .users
            .create_user(req.email.as_str(), &password_hash, req.full_name.as_deref())
            .await?;
        tracing::info!("user created with email: {}", email);

        self.issue(user).await
    }

    pub async fn login(&self, req: LoginRequest) -> ExchangeResult<AuthResponse> {
        tracing::info!("Attempting to log in user with email: {}", req.email);

        let (user, email, password) = self
            .users
            .find_user_by_email(req.email.as_str())
            .await?
            .ok_or(ExchangeError::InvalidCredentials)?;

        let parsed_hash = PasswordHash::new(&password)
            .map_err(|err| ExchangeError::Storage(format!("corrupt password hash: {err}")))?;
        if Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .is_err()
        {
            tracing::warn!("Invalid credentials for user: {}", email);
            return Err(ExchangeError::InvalidCredentials);
        }
        tracing::info!("Password verified for user: {}", email);

        self.issue(user).await
    }

    pub fn verify_token(&self, token: &str) -> ExchangeResult<Uuid> {
        let mut validation = jsonwebtoken::Validation::default();

        validation.leeway = 10;
        validation.validate_exp = true;
        validation.algorithms = vec![jsonwebtoken::Algorithm::HS256];

        let token_data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|err| {
            tracing::warn!("Error decoding token: {:?}", err);
            ExchangeError::Unauthenticated
        })?;

        Ok(token_data.claims.sub)
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> ExchangeResult<AuthResponse> {
        let user = self
            .users
            .verify_refresh_token(refresh_token)
            .await?
            .ok_or(ExchangeError::Unauthenticated)?;
        self.issue(user).await
    }

    // fresh access token plus a stored one-hour refresh token
    async fn issue(&self, user_id: Uuid) -> ExchangeResult<AuthResponse> {
        let (access_token, refresh_token) = self.generate_tokens(user_id)?;

        let expires_at = Utc::now() + REFRESH_TOKEN_TTL;
        self.users
            .store_refresh_token(user_id, &refresh_token, expires_at)
            .await?;
        tracing::info!("Stored refresh token for user: {}", user_id);

        Ok(AuthResponse {
            access_token,
            refresh_token,
            user_uid: user_id,
        })
    }

    fn generate_tokens(&self, user_id: Uuid) -> ExchangeResult<(String, String)> {
        let now = Utc::now();

        let access_claims = Claims {
            sub: user_id,
            exp: (now + ACCESS_TOKEN_TTL).timestamp(),
            iat: now.timestamp(),
        };

        let access_token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &access_claims,
            &jsonwebtoken::EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|err| ExchangeError::Config(format!("unable to sign token: {err}")))?;

        let refresh_token = Uuid::new_v4().to_string();

        Ok((access_token, refresh_token))
    }
}

// Route for handling new user registration
pub async fn register_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let response = service.register(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

// Route for handling user login
pub async fn login_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let response = service.login(req).await?;
    Ok((StatusCode::OK, Json(response)))
}

// Route for handling token refresh
pub async fn refresh_token_handler(
    State(service): State<Arc<AuthService>>,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let response = service.refresh_token(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(response)))
}

pub fn auth_routes(service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_token_handler))
        .with_state(service)
}
