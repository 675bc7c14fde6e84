//! High-level account client: authenticate once, then stream any of the account's monitors.

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthConfig, AuthError, Monitor, PasswordCredentials, TokenSource};
use crate::realtime::{Dialer, Handler, RealtimeClient, StreamError, DEFAULT_ORIGIN, DEFAULT_REALTIME_URL};

pub const USER_AGENT_VALUE: &str = concat!("sense-rs/", env!("CARGO_PKG_VERSION"));

// Header names must be lowercase here.
const DEVICE_ID_HEADER: &str = "x-sense-device-id";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("invalid device id {0:?}")]
    InvalidDeviceId(String),

    #[error("building HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// True when the failure is due to missing, rejected, or unrenewable credentials.
    pub fn is_authentication_needed(&self) -> bool {
        match self {
            ClientError::Auth(e) | ClientError::Stream(StreamError::Token(e)) => {
                e.is_authentication_needed()
            }
            _ => false,
        }
    }
}

/// Random id identifying this process to Sense, generated once.
pub fn process_device_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Endpoints and identity used by [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub api_url: String,
    pub realtime_url: String,
    pub origin: String,
    /// Sent as `X-Sense-Device-ID` and as the feed's `device_id`. Empty disables both.
    pub device_id: String,
    /// Used as-is when set; default headers are then the caller's responsibility.
    pub http_client: Option<reqwest::Client>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_url: crate::auth::DEFAULT_API_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            device_id: process_device_id().to_string(),
            http_client: None,
        }
    }
}

/// A Sense account. Unauthenticated until [`Client::authenticate`] succeeds.
#[derive(Debug, Clone)]
pub struct Client {
    user_id: i64,
    account_id: i64,
    monitors: Vec<Monitor>,
    auth: AuthConfig,
    realtime: RealtimeClient,
    authenticated: bool,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Result<Self, ClientError> {
        let http = match opts.http_client {
            Some(c) => c,
            None => build_http_client(&opts.device_id)?,
        };
        let auth = AuthConfig::new(opts.api_url).with_http_client(http);
        let realtime = RealtimeClient::new()
            .with_base_url(opts.realtime_url)
            .with_origin(opts.origin)
            .with_device_id(opts.device_id);
        Ok(Self {
            user_id: 0,
            account_id: 0,
            monitors: Vec::new(),
            auth,
            realtime,
            authenticated: false,
        })
    }

    /// [`Client::new`] followed by [`Client::authenticate`] when credentials are given.
    pub async fn connect(
        creds: Option<&PasswordCredentials>,
        opts: ClientOptions,
    ) -> Result<Self, ClientError> {
        let mut client = Self::new(opts)?;
        if let Some(creds) = creds {
            client.authenticate(creds).await?;
        }
        Ok(client)
    }

    /// Log in, replacing any previous account state.
    pub async fn authenticate(&mut self, creds: &PasswordCredentials) -> Result<(), ClientError> {
        self.logout();
        let (token, info) = self.auth.password_credentials_token(creds).await?;
        let source: Arc<dyn TokenSource> = Arc::new(self.auth.token_source(token));
        self.realtime = self.realtime.clone().with_token_source(source);
        self.user_id = info.user_id;
        self.account_id = info.account_id;
        self.monitors = info.monitors;
        self.authenticated = true;
        log::info!(
            "sense: authenticated {} ({} monitor(s))",
            creds.email,
            self.monitors.len()
        );
        Ok(())
    }

    /// Forget the account and its tokens.
    pub fn logout(&mut self) {
        self.user_id = 0;
        self.account_id = 0;
        self.monitors.clear();
        self.authenticated = false;
        self.realtime = self.realtime.clone().without_token_source();
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    /// Replace the transport used for realtime feeds.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.realtime = self.realtime.with_dialer(dialer);
        self
    }

    /// Stream realtime messages for `monitor_id`; see [`RealtimeClient::stream`].
    pub async fn stream<H: Handler>(
        &self,
        monitor_id: i64,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<(), ClientError> {
        Ok(self.realtime.stream(monitor_id, cancel, handler).await?)
    }
}

fn build_http_client(device_id: &str) -> Result<reqwest::Client, ClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    if !device_id.is_empty() {
        let value = HeaderValue::from_str(device_id)
            .map_err(|_| ClientError::InvalidDeviceId(device_id.to_string()))?;
        headers.insert(DEVICE_ID_HEADER, value);
    }
    Ok(reqwest::Client::builder().default_headers(headers).build()?)
}
