//! Shared helpers: a scripted OAuth provider and simulated devices sharing
//! one in-memory blob store.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tabsync_cloud::{
    AuthorizationCode, CloudError, CloudResult, CloudTokens, ManifestSyncEngine, MemoryBlobStore,
    OAuthProvider, SyncConfig,
};
use tabsync_storage::{KvSessionStore, MemoryKvStore, SavedSession, SessionStore, Tab};

pub const PASSWORD: &str = "correct horse";
pub const EMAIL: &str = "user@example.com";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tabsync_cloud=debug")
        .with_test_writer()
        .try_init();
}

pub fn tokens(generation: usize, expires_in: Duration) -> CloudTokens {
    CloudTokens {
        access_token: format!("at-{generation}"),
        refresh_token: format!("rt-{generation}"),
        expires_at: Utc::now() + expires_in,
        scope: "drive.appdata".into(),
    }
}

/// OAuth provider that rotates refresh tokens like real providers do:
/// refreshing with anything but the latest refresh token fails.
pub struct FakeOAuth {
    generation: AtomicUsize,
    refreshes: AtomicUsize,
    lifetime: Mutex<Duration>,
    fail_refresh: AtomicBool,
    pub revoked: Mutex<Vec<String>>,
}

impl FakeOAuth {
    pub fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            lifetime: Mutex::new(Duration::hours(1)),
            fail_refresh: AtomicBool::new(false),
            revoked: Mutex::new(Vec::new()),
        }
    }

    /// Lifetime of tokens issued from now on.
    pub fn set_lifetime(&self, lifetime: Duration) {
        *self.lifetime.lock().unwrap() = lifetime;
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn issue(&self) -> CloudTokens {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokens(generation, *self.lifetime.lock().unwrap())
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuth {
    async fn launch_interactive_consent(&self) -> CloudResult<AuthorizationCode> {
        Ok(AuthorizationCode {
            code: "auth-code".into(),
            code_verifier: "verifier".into(),
        })
    }

    async fn exchange_code(&self, code: &AuthorizationCode) -> CloudResult<CloudTokens> {
        assert_eq!(code.code, "auth-code");
        Ok(self.issue())
    }

    async fn refresh(&self, refresh_token: &str) -> CloudResult<CloudTokens> {
        // Widen the window for racing callers.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(CloudError::Auth("invalid_grant".into()));
        }
        let current = format!("rt-{}", self.generation.load(Ordering::SeqCst));
        if refresh_token != current {
            return Err(CloudError::Auth(format!(
                "refresh token {refresh_token} was rotated"
            )));
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.issue())
    }

    async fn revoke(&self, token: &str) -> CloudResult<()> {
        self.revoked.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn get_account_email(&self, _access_token: &str) -> CloudResult<String> {
        Ok(EMAIL.to_string())
    }
}

/// One simulated device.
pub struct Device {
    pub engine: Arc<ManifestSyncEngine>,
    pub kv: Arc<MemoryKvStore>,
    pub sessions: Arc<KvSessionStore>,
    pub oauth: Arc<FakeOAuth>,
}

impl Device {
    pub fn new(blobs: Arc<MemoryBlobStore>) -> Self {
        Self::with_config(blobs, SyncConfig::default())
    }

    pub fn with_config(blobs: Arc<MemoryBlobStore>, config: SyncConfig) -> Self {
        let kv = Arc::new(MemoryKvStore::default());
        let sessions = Arc::new(KvSessionStore::new(kv.clone()));
        let oauth = Arc::new(FakeOAuth::new());
        let engine = ManifestSyncEngine::new(
            config,
            kv.clone(),
            sessions.clone(),
            blobs,
            oauth.clone(),
        )
        .unwrap();
        Self {
            engine: Arc::new(engine),
            kv,
            sessions,
            oauth,
        }
    }

    /// Connects and sets up encryption. Returns the recovery key.
    pub async fn setup(&self, password: &str) -> String {
        self.engine.connect().await.unwrap();
        self.engine.complete_setup(password).await.unwrap()
    }

    /// Connects and joins an account set up elsewhere.
    pub async fn join(&self, password: &str) -> bool {
        self.engine.connect().await.unwrap();
        self.engine.complete_join(password).await.unwrap()
    }

    pub fn save(&self, id: &str, name: &str, updated_at: i64) -> SavedSession {
        let session = session(id, name, updated_at);
        self.sessions.put(&session).unwrap();
        session
    }

    pub fn local(&self, id: &str) -> Option<SavedSession> {
        self.sessions.get(id).unwrap()
    }

    pub fn local_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.list().unwrap().into_iter().map(|s| s.id).collect();
        ids.sort();
        ids
    }
}

pub fn session(id: &str, name: &str, updated_at: i64) -> SavedSession {
    SavedSession {
        id: id.to_string(),
        name: name.to_string(),
        created_at: 1,
        updated_at,
        tabs: vec![
            Tab {
                url: format!("https://example.com/{id}"),
                title: format!("{name} home"),
                pinned: true,
                group_name: None,
            },
            Tab {
                url: "https://docs.rs".into(),
                title: "Docs".into(),
                pinned: false,
                group_name: Some("reading".into()),
            },
        ],
    }
}
