//! Cloud sync for TabSync.
//!
//! Keeps saved tab sessions in step across devices through an
//! app-private blob namespace, with:
//! - A single encrypted manifest plus one encrypted blob per session
//! - Last-write-wins reconciliation with tombstones for deletes
//! - OAuth token refresh serialized behind one lock
//! - A durable retry queue with exponential backoff
//! - Password change and recovery-key flows that re-key remote data
//!
//! The engine never talks to a provider directly: [`BlobStore`] and
//! [`OAuthProvider`] are injected, with Drive-style HTTP implementations in
//! [`drive_store`] and [`oauth`].

pub mod account;
pub mod blob_store;
pub mod config;
pub mod drive_store;
pub mod error;
pub mod manifest;
pub mod oauth;
pub mod retry_queue;
pub mod scheduler;
pub mod session;
pub mod sync_engine;
pub mod token_manager;
pub mod types;

pub use blob_store::{BlobInfo, BlobOp, BlobStore, BlobStoreError, BlobStoreResult, MemoryBlobStore};
pub use config::{OAuthConfig, RetryConfig, SyncConfig};
pub use drive_store::DriveBlobStore;
pub use error::{CloudError, CloudResult};
pub use oauth::{AuthorizationCode, ConsentLauncher, HttpOAuthClient, OAuthProvider};
pub use retry_queue::{DrainReport, FailureOutcome, RetryQueue};
pub use scheduler::{create_configured_sync_scheduler, create_sync_scheduler, SyncHandle, SyncScheduler};
pub use session::UnlockedSession;
pub use sync_engine::ManifestSyncEngine;
pub use token_manager::TokenManager;
pub use types::*;
