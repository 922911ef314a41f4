//! Cloud sync configuration.

use serde::{Deserialize, Serialize};

/// OAuth client settings for the storage provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    /// Installed-app clients usually have none.
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: "http://127.0.0.1:8765/oauth/callback".to_string(),
            scope: "https://www.googleapis.com/auth/drive.appdata email".to_string(),
        }
    }
}

/// Backoff schedule for the retry queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    /// Failures after which an item is dropped.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            multiplier: 2.0,
            max_delay_secs: 3600, // 1 hour
            max_retries: 8,
        }
    }
}

/// Configuration for the cloud sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Provider label recorded in stored credentials (e.g., "google-drive").
    pub provider: String,

    /// Base URL for file metadata calls (e.g., "https://www.googleapis.com/drive/v3").
    pub drive_api_base_url: String,

    /// Base URL for media uploads (e.g., "https://www.googleapis.com/upload/drive/v3").
    pub drive_upload_base_url: String,

    pub oauth: OAuthConfig,

    /// Refresh tokens this many seconds before they expire.
    pub token_refresh_margin_secs: i64,

    /// How long tombstones are kept in the manifest.
    pub tombstone_retention_days: i64,

    /// Interval of the periodic background sync (seconds).
    pub sync_interval_secs: u64,

    /// Per-request HTTP timeout (seconds).
    pub http_timeout_secs: u64,

    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provider: "google-drive".to_string(),
            drive_api_base_url: "https://www.googleapis.com/drive/v3".to_string(),
            drive_upload_base_url: "https://www.googleapis.com/upload/drive/v3".to_string(),
            oauth: OAuthConfig::default(),
            token_refresh_margin_secs: 300, // 5 minutes before expiry
            tombstone_retention_days: 30,
            sync_interval_secs: 15 * 60,
            http_timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Tombstone retention window in milliseconds.
    pub fn tombstone_retention_ms(&self) -> i64 {
        self.tombstone_retention_days * 24 * 60 * 60 * 1000
    }

    /// Points every endpoint at a local mock server.
    pub fn with_base_url(base: &str) -> Self {
        Self {
            drive_api_base_url: format!("{base}/drive/v3"),
            drive_upload_base_url: format!("{base}/upload/drive/v3"),
            oauth: OAuthConfig {
                auth_url: format!("{base}/o/oauth2/auth"),
                token_url: format!("{base}/token"),
                revoke_url: format!("{base}/revoke"),
                userinfo_url: format!("{base}/userinfo"),
                client_id: "test-client".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:8765/oauth/callback".to_string(),
                scope: "drive.appdata email".to_string(),
            },
            ..Self::default()
        }
    }
}
