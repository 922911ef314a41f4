//! OAuth 2.0 authorization-code flow with PKCE (RFC 7636, S256).
//!
//! The browser step is owned by the host application: it receives the
//! authorization URL through a [`ConsentLauncher`] and hands back the URL
//! the provider redirected to. Everything else (code exchange, refresh,
//! revocation, account lookup) is plain HTTP.

use crate::config::OAuthConfig;
use crate::drive_store::map_status;
use crate::error::{CloudError, CloudResult};
use crate::types::CloudTokens;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::RngCore;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Authorization code plus the PKCE verifier that must accompany it.
#[derive(Clone, Debug)]
pub struct AuthorizationCode {
    pub code: String,
    pub code_verifier: String,
}

/// PKCE verifier/challenge pair.
#[derive(Clone, Debug)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// 32 random bytes as base64url (43 chars); challenge is
    /// `base64url(SHA-256(verifier))`.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = compute_code_challenge(&verifier);
        Self { verifier, challenge }
    }
}

pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` parameter (16 bytes, base64url).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Host hook that shows the consent page and returns the redirect URL.
#[async_trait]
pub trait ConsentLauncher: Send + Sync {
    async fn launch(&self, authorization_url: &str) -> CloudResult<String>;
}

/// OAuth provider operations used by the engine.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn launch_interactive_consent(&self) -> CloudResult<AuthorizationCode>;
    async fn exchange_code(&self, code: &AuthorizationCode) -> CloudResult<CloudTokens>;
    async fn refresh(&self, refresh_token: &str) -> CloudResult<CloudTokens>;
    async fn revoke(&self, token: &str) -> CloudResult<()>;
    async fn get_account_email(&self, access_token: &str) -> CloudResult<String>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

impl TokenResponse {
    fn into_tokens(self, fallback_refresh: Option<&str>) -> CloudResult<CloudTokens> {
        let refresh_token = match (self.refresh_token, fallback_refresh) {
            (Some(rt), _) => rt,
            (None, Some(old)) => old.to_string(),
            (None, None) => {
                return Err(CloudError::Auth(
                    "provider did not return a refresh token".to_string(),
                ));
            }
        };
        Ok(CloudTokens {
            access_token: self.access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(self.expires_in),
            scope: self.scope,
        })
    }
}

#[derive(Deserialize)]
struct UserInfo {
    email: String,
}

/// HTTP OAuth client.
pub struct HttpOAuthClient {
    client: Client,
    config: OAuthConfig,
    launcher: Arc<dyn ConsentLauncher>,
}

impl HttpOAuthClient {
    pub fn new(
        config: OAuthConfig,
        launcher: Arc<dyn ConsentLauncher>,
        timeout: Duration,
    ) -> CloudResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            launcher,
        })
    }

    /// Builds the consent URL for a given challenge and state.
    pub fn authorization_url(&self, pkce: &PkceChallenge, state: &str) -> CloudResult<Url> {
        Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.config.scope.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| CloudError::Config(format!("invalid auth_url: {e}")))
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        fallback_refresh: Option<&str>,
    ) -> CloudResult<CloudTokens> {
        let mut params: Vec<(&str, &str)> = form.to_vec();
        params.push(("client_id", self.config.client_id.as_str()));
        if let Some(ref secret) = self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(token_error(status, &body));
        }

        let parsed: TokenResponse = resp.json().await?;
        parsed.into_tokens(fallback_refresh)
    }
}

/// 400/401 from the token endpoint mean the grant is dead; anything else
/// is worth retrying.
fn token_error(status: StatusCode, body: &str) -> CloudError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
            CloudError::Auth(format!("token endpoint rejected grant (HTTP {})", status.as_u16()))
        }
        other => CloudError::Transient(map_status(other, body)),
    }
}

/// Pulls `code` out of a redirect URL after checking `state`.
pub fn parse_redirect(redirect_url: &str, expected_state: &str) -> CloudResult<String> {
    let url = Url::parse(redirect_url)
        .map_err(|e| CloudError::Validation(format!("invalid redirect URL: {e}")))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            _ => {}
        }
    }

    if let Some(err) = error {
        return Err(CloudError::Auth(format!("consent denied: {err}")));
    }
    if state.as_deref() != Some(expected_state) {
        return Err(CloudError::Auth("OAuth state mismatch".to_string()));
    }
    code.ok_or_else(|| CloudError::Auth("redirect carried no authorization code".to_string()))
}

#[async_trait]
impl OAuthProvider for HttpOAuthClient {
    async fn launch_interactive_consent(&self) -> CloudResult<AuthorizationCode> {
        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let url = self.authorization_url(&pkce, &state)?;

        let redirect = self.launcher.launch(url.as_str()).await?;
        let code = parse_redirect(&redirect, &state)?;
        debug!("received authorization code");

        Ok(AuthorizationCode {
            code,
            code_verifier: pkce.verifier,
        })
    }

    async fn exchange_code(&self, code: &AuthorizationCode) -> CloudResult<CloudTokens> {
        self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code.code.as_str()),
                ("code_verifier", code.code_verifier.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ],
            None,
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> CloudResult<CloudTokens> {
        self.token_request(
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            Some(refresh_token),
        )
        .await
    }

    async fn revoke(&self, token: &str) -> CloudResult<()> {
        let resp = self
            .client
            .post(&self.config.revoke_url)
            .form(&[("token", token)])
            .send()
            .await?;

        // 400 means the token was already invalid.
        if !resp.status().is_success() && resp.status() != StatusCode::BAD_REQUEST {
            warn!("token revocation returned HTTP {}", resp.status().as_u16());
            let body = resp.text().await.unwrap_or_default();
            return Err(CloudError::Transient(map_status(StatusCode::BAD_GATEWAY, &body)));
        }
        Ok(())
    }

    async fn get_account_email(&self, access_token: &str) -> CloudResult<String> {
        let resp = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(CloudError::Auth("userinfo rejected the access token".to_string()));
        }

        let info: UserInfo = resp
            .error_for_status()
            .map_err(|e| CloudError::Auth(e.to_string()))?
            .json()
            .await?;
        Ok(info.email)
    }
}
