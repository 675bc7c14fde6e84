//! Sense account authentication: password login (with optional MFA), token renewal,
//! and token sources for the realtime client.
//!
//! Sense uses its own OAuth-like flow: `POST authenticate` with form credentials returns
//! an access token, a refresh token and an account summary; `POST renew` exchanges the
//! refresh token (plus the user id) for a new access token.

mod expiry;

pub use expiry::{guess_expiry, ExpirySource, ASSUMED_LIFETIME_HOURS};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::wire::null_default;

pub const DEFAULT_API_URL: &str = "https://api.sense.com/apiservice/api/v1/";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_DELTA_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("MFA needed: {0}")]
    MfaNeeded(String),

    #[error("mfa: {0}")]
    Mfa(anyhow::Error),

    #[error("auth: HTTP {status}: {reason}")]
    Api { status: u16, reason: String },

    #[error("auth: {0}: not authorized")]
    NotAuthorized(String),

    /// The token has no user id, so the renew endpoint cannot be called.
    #[error("token cannot be renewed (no user id)")]
    NotRenewable,
}

impl AuthError {
    /// True when retrying with fresh credentials could help.
    pub fn is_authentication_needed(&self) -> bool {
        match self {
            AuthError::Api { status, .. } => *status == 401,
            AuthError::MfaNeeded(_) | AuthError::NotAuthorized(_) | AuthError::NotRenewable => true,
            _ => false,
        }
    }
}

/// OAuth-style bearer token plus the Sense user id needed to renew it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
    pub user_id: i64,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &redacted(&self.access_token))
            .field("refresh_token", &redacted(&self.refresh_token))
            .field("expiry", &self.expiry)
            .field("user_id", &self.user_id)
            .finish()
    }
}

fn redacted(s: &str) -> &'static str {
    if s.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl Token {
    /// Non-empty and not expiring within the next few seconds. No expiry means it never expires.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            None => true,
            Some(exp) => exp > now + Duration::seconds(EXPIRY_DELTA_SECS),
        }
    }
}

/// Supplies bearer tokens on demand.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token, AuthError>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(Token);

impl StaticTokenSource {
    pub fn new(token: Token) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token, AuthError> {
        Ok(self.0.clone())
    }
}

/// Supplies the MFA (TOTP) code when the account requires one.
#[async_trait]
pub trait MfaProvider: Send + Sync {
    async fn code(&self) -> anyhow::Result<String>;
}

/// A fixed, already-known MFA code.
#[derive(Debug, Clone)]
pub struct MfaCode(pub String);

#[async_trait]
impl MfaProvider for MfaCode {
    async fn code(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Default)]
pub struct PasswordCredentials {
    pub email: String,
    pub password: String,
    pub mfa: Option<Arc<dyn MfaProvider>>,
}

impl PasswordCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            mfa: None,
        }
    }

    pub fn with_mfa(mut self, mfa: Arc<dyn MfaProvider>) -> Self {
        self.mfa = Some(mfa);
        self
    }
}

impl std::fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("email", &self.email)
            .field("password", &redacted(&self.password))
            .field("mfa", &self.mfa.is_some())
            .finish()
    }
}

/// Account summary returned alongside the tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub user_id: i64,
    pub account_id: i64,
    pub monitors: Vec<Monitor>,
}

/// A physical Sense monitor. An account can have several.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Monitor {
    #[serde(default, deserialize_with = "null_default")]
    pub id: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub serial_number: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthenticateResponse {
    #[serde(deserialize_with = "null_default")]
    access_token: String,
    #[serde(deserialize_with = "null_default")]
    refresh_token: String,
    #[serde(deserialize_with = "null_default")]
    user_id: i64,
    #[serde(deserialize_with = "null_default")]
    account_id: i64,
    #[serde(deserialize_with = "null_default")]
    monitors: Vec<Monitor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    error_reason: Option<String>,
    mfa_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RenewResponse {
    #[serde(deserialize_with = "null_default")]
    access_token: String,
    #[serde(deserialize_with = "null_default")]
    refresh_token: String,
    expires: Option<DateTime<Utc>>,
}

/// Endpoints and HTTP client used for authentication.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    base_url: String,
    http: reqwest::Client,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl AuthConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}{}", self.base_url, name)
    }

    async fn post_authenticate(&self, form: &[(&str, &str)]) -> Result<reqwest::Response, AuthError> {
        Ok(self
            .http
            .post(self.endpoint("authenticate"))
            .form(form)
            .send()
            .await?)
    }

    /// Log in with email and password, answering an MFA challenge if the account asks for one.
    pub async fn password_credentials_token(
        &self,
        creds: &PasswordCredentials,
    ) -> Result<(Token, AccountInfo), AuthError> {
        let mut resp = self
            .post_authenticate(&[
                ("email", creds.email.as_str()),
                ("password", creds.password.as_str()),
            ])
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let status = resp.status().as_u16();
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            let Some(mfa_token) = body.mfa_token else {
                return Err(api_error(status, body.error_reason));
            };
            let Some(mfa) = &creds.mfa else {
                return Err(AuthError::MfaNeeded(creds.email.clone()));
            };
            log::debug!("auth: requesting MFA code for {}", creds.email);
            let totp = mfa.code().await.map_err(AuthError::Mfa)?;
            resp = self
                .post_authenticate(&[
                    ("email", creds.email.as_str()),
                    ("password", creds.password.as_str()),
                    ("mfa_token", mfa_token.as_str()),
                    ("totp", totp.trim()),
                ])
                .await?;
        }

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), body.error_reason));
        }
        let data: AuthenticateResponse = resp.json().await?;
        if data.access_token.is_empty() {
            return Err(AuthError::NotAuthorized(creds.email.clone()));
        }
        let (expiry, _) = guess_expiry(&data.access_token, Utc::now());
        log::debug!("auth: authenticated {} (user {})", creds.email, data.user_id);
        let token = Token {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expiry: Some(expiry),
            user_id: data.user_id,
        };
        let info = AccountInfo {
            user_id: data.user_id,
            account_id: data.account_id,
            monitors: data.monitors,
        };
        Ok((token, info))
    }

    /// Exchange `token`'s refresh token for a new token.
    pub async fn renew(&self, token: &Token) -> Result<Token, AuthError> {
        if token.user_id == 0 {
            return Err(AuthError::NotRenewable);
        }
        let user_id = token.user_id.to_string();
        let resp = self
            .http
            .post(self.endpoint("renew"))
            .form(&[
                ("user_id", user_id.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
                ("is_access_token", "true"),
            ])
            .send()
            .await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), body.error_reason));
        }
        let data: RenewResponse = resp.json().await?;
        log::debug!("auth: renewed token for user {}", token.user_id);
        Ok(Token {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expiry: data.expires,
            user_id: token.user_id,
        })
    }

    /// A token source that hands out `token` while valid and renews it afterwards.
    pub fn token_source(&self, token: Token) -> RenewingTokenSource {
        RenewingTokenSource {
            config: self.clone(),
            current: Mutex::new(token),
        }
    }
}

fn api_error(status: u16, reason: Option<String>) -> AuthError {
    AuthError::Api {
        status,
        reason: reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "unexpected response".to_string()),
    }
}

/// Reuses the current token until it is about to expire, then renews it.
/// Concurrent callers wait for a single renewal.
#[derive(Debug)]
pub struct RenewingTokenSource {
    config: AuthConfig,
    current: Mutex<Token>,
}

#[async_trait]
impl TokenSource for RenewingTokenSource {
    async fn token(&self) -> Result<Token, AuthError> {
        let mut current = self.current.lock().await;
        if current.is_valid() {
            log::trace!("auth: reusing valid token");
            return Ok(current.clone());
        }
        let renewed = self.config.renew(&current).await?;
        *current = renewed.clone();
        Ok(renewed)
    }
}
