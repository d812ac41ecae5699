//! OAuth2 token lifecycle
//!
//! [`TokenManager::ensure_valid`] is called before every publish. It hands out
//! the stored access token while it is comfortably inside its lifetime and
//! otherwise refreshes it with the refresh-token grant.
//!
//! Refreshes are serialised by an async mutex and written back with a version
//! compare-and-swap, so concurrent publishes never refresh twice and never
//! overwrite each other's tokens.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::classify::{classify_transport, ApiCall, PublishError};
use crate::config::{PlatformConfig, PublishingConfig};
use crate::credentials::CredentialStore;
use crate::error::{ConfigError, Result, SyndicastError};
use crate::platform::client::error_from_response;
use crate::platform::wire::TokenResponse;
use crate::types::{clone_secret, PublishCredential, TokenUpdate};

/// Subtracted from `expires_in` so a token is never used right up to its expiry
const EXPIRY_SAFETY_MARGIN_SECS: i64 = 300;

pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    http: Client,
    oauth_base_url: String,
    redirect_uri: Option<String>,
    scopes: Vec<String>,
    refresh_buffer: Duration,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        platform: &PlatformConfig,
        publishing: &PublishingConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(platform.api_timeout)
            .user_agent(format!("syndicast/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "platform.api_timeout".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            store,
            http,
            oauth_base_url: platform.oauth_base_url.trim_end_matches('/').to_string(),
            redirect_uri: platform.redirect_uri.clone(),
            scopes: platform.scopes.clone(),
            refresh_buffer: publishing.token_refresh_buffer,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// A usable access token, refreshing it first when it is about to expire.
    ///
    /// Publish failures come back as [`SyndicastError::Publish`]; an
    /// `Auth { needs_reauth: true }` means a human has to authorise again.
    #[instrument(skip(self))]
    pub async fn ensure_valid(&self) -> Result<SecretString> {
        let credential = self.active_credential().await?;
        if let Some(token) = self.usable_token(&credential, Utc::now()) {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited for the lock
        let credential = self.active_credential().await?;
        if let Some(token) = self.usable_token(&credential, Utc::now()) {
            debug!("Token refreshed by a concurrent task");
            return Ok(token);
        }

        self.refresh(credential).await
    }

    /// Refresh after the platform rejected `rejected` as unauthorised.
    ///
    /// When a concurrent task already replaced that token, the replacement
    /// is returned without another refresh.
    pub async fn refresh_rejected(&self, rejected: &SecretString) -> Result<SecretString> {
        let _guard = self.refresh_lock.lock().await;

        let credential = self.active_credential().await?;
        if let Some(current) = credential.access_token.as_ref() {
            if credential.has_access_token() && current.expose_secret() != rejected.expose_secret()
            {
                return Ok(clone_secret(current));
            }
        }

        warn!("Access token rejected before expiry, refreshing");
        self.refresh(credential).await
    }

    /// Whether `credential` holds an access token valid past the refresh buffer
    pub fn is_fresh(&self, credential: &PublishCredential, now: DateTime<Utc>) -> bool {
        self.usable_token(credential, now).is_some()
    }

    fn usable_token(
        &self,
        credential: &PublishCredential,
        now: DateTime<Utc>,
    ) -> Option<SecretString> {
        if !credential.has_access_token() {
            return None;
        }
        let expires_at = credential.expires_at?;
        let buffer = chrono::Duration::from_std(self.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if expires_at - buffer <= now {
            return None;
        }
        credential.access_token.as_ref().map(clone_secret)
    }

    async fn active_credential(&self) -> Result<PublishCredential> {
        self.store.get_active().await?.ok_or_else(|| {
            SyndicastError::Publish(PublishError::Auth {
                message: "no active credential; run the authorization flow".to_string(),
                needs_reauth: true,
            })
        })
    }

    async fn refresh(&self, credential: PublishCredential) -> Result<SecretString> {
        let id = credential
            .id
            .ok_or_else(|| SyndicastError::InvalidInput("credential has no id".to_string()))?;

        let refresh_token = match &credential.refresh_token {
            Some(token) if !token.expose_secret().is_empty() => clone_secret(token),
            _ => {
                return Err(PublishError::Auth {
                    message: "access token expired and no refresh token is stored".to_string(),
                    needs_reauth: true,
                }
                .into())
            }
        };

        info!(credential_id = id, "Refreshing access token");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.expose_secret()),
        ];

        let response = match self.request_token(ApiCall::TokenRefresh, &params).await {
            Ok(response) => response,
            Err(e) if e.needs_reauth() => {
                warn!(credential_id = id, "Refresh token rejected, clearing tokens: {}", e);
                self.store.clear_tokens(id).await?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(credential_id = id, code = %e.code(), "Token refresh failed: {}", e);
                return Err(e.into());
            }
        };

        let update = token_update(&response, Utc::now());
        let access_token = clone_secret(&update.access_token);

        if self
            .store
            .update_tokens(id, credential.version, &update)
            .await?
        {
            info!(credential_id = id, expires_at = %update.expires_at, "Access token refreshed");
            return Ok(access_token);
        }

        // Lost the compare-and-swap: use whatever the winner stored
        warn!(credential_id = id, "Credential changed during refresh, re-reading");
        let current = self.active_credential().await?;
        match current.access_token.as_ref() {
            Some(token) if current.has_access_token() => Ok(clone_secret(token)),
            _ => Err(PublishError::Auth {
                message: "credential changed during refresh".to_string(),
                needs_reauth: false,
            }
            .into()),
        }
    }

    /// One-time exchange of an authorization code for tokens.
    ///
    /// The tokens are stored on the active credential, which is returned.
    #[instrument(skip(self, code))]
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<PublishCredential> {
        if code.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(
                "authorization code is empty".to_string(),
            ));
        }

        let credential = self.active_credential().await?;
        let id = credential
            .id
            .ok_or_else(|| SyndicastError::InvalidInput("credential has no id".to_string()))?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.expose_secret()),
        ];

        let _guard = self.refresh_lock.lock().await;
        let response = self.request_token(ApiCall::TokenExchange, &params).await?;
        let update = token_update(&response, Utc::now());

        if !self
            .store
            .update_tokens(id, credential.version, &update)
            .await?
        {
            return Err(PublishError::Auth {
                message: "credential changed during code exchange".to_string(),
                needs_reauth: true,
            }
            .into());
        }

        info!(credential_id = id, expires_at = %update.expires_at, "Authorization code exchanged");
        self.active_credential().await
    }

    /// Authorization URL the user opens to grant access
    pub async fn authorization_url(&self, state: &str) -> Result<String> {
        let credential = self.active_credential().await?;
        let redirect_uri = self
            .redirect_uri
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("platform.redirect_uri".to_string()))?;

        let base = format!("{}/oauth/v2/authorization", self.oauth_base_url);
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &base,
            &[
                ("response_type", "code"),
                ("client_id", credential.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| ConfigError::InvalidValue {
            field: "platform.oauth_base_url".to_string(),
            reason: e.to_string(),
        })?;

        Ok(url.into())
    }

    async fn request_token(
        &self,
        call: ApiCall,
        params: &[(&str, &str)],
    ) -> std::result::Result<TokenResponse, PublishError> {
        let url = format!("{}/oauth/v2/accessToken", self.oauth_base_url);
        let response = self
            .http
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|e| classify_transport(call, &e))?;

        if !response.status().is_success() {
            return Err(error_from_response(call, response).await);
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(call, &e))?;
        if parsed.access_token.is_empty() {
            return Err(PublishError::Auth {
                message: format!("{} returned an empty access token", call.as_str()),
                needs_reauth: false,
            });
        }
        Ok(parsed)
    }
}

/// Random CSRF state for the authorization redirect
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn token_update(response: &TokenResponse, now: DateTime<Utc>) -> TokenUpdate {
    let lifetime = (response.expires_in - EXPIRY_SAFETY_MARGIN_SECS).max(0);
    TokenUpdate {
        access_token: SecretString::from(response.access_token.clone()),
        refresh_token: response
            .refresh_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.clone())),
        expires_at: now + chrono::Duration::seconds(lifetime),
    }
}
