//! Remote blob storage abstraction.
//!
//! The sync engine only needs opaque named objects in an app-private
//! namespace. Every call carries the OAuth access token so the store
//! itself holds no credentials. `upload` replaces any blob with the same
//! name under the same parent; the store offers no compare-and-swap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Result type for blob store calls.
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Transport error taxonomy.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BlobStoreError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden or rate limited: {0}")]
    ForbiddenOrRateLimited(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("storage full")]
    StorageFull,

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// A [`BlobStore`] call, for targeted failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobOp {
    Upload,
    Download,
    Delete,
    FindByName,
    List,
}

/// Listing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// Opaque remote object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates or replaces the blob called `name`; returns its id.
    async fn upload(
        &self,
        access_token: &str,
        name: &str,
        bytes: Vec<u8>,
        parent: Option<&str>,
    ) -> BlobStoreResult<String>;

    async fn download(&self, access_token: &str, id: &str) -> BlobStoreResult<Vec<u8>>;

    async fn delete(&self, access_token: &str, id: &str) -> BlobStoreResult<()>;

    async fn find_by_name(
        &self,
        access_token: &str,
        name: &str,
        parent: Option<&str>,
    ) -> BlobStoreResult<Option<String>>;

    async fn list(&self, access_token: &str, parent: Option<&str>) -> BlobStoreResult<Vec<BlobInfo>>;
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

struct MemoryBlob {
    name: String,
    parent: Option<String>,
    bytes: Vec<u8>,
}

/// In-process blob store shared by simulated devices.
///
/// Supports failure injection so callers can exercise retry paths.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, MemoryBlob>>,
    next_id: AtomicU64,
    failure: Mutex<Option<BlobStoreError>>,
    targeted: Mutex<Vec<(BlobOp, String, BlobStoreError)>>,
    rejected_tokens: Mutex<Vec<String>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `err` until cleared.
    pub fn fail_with(&self, err: BlobStoreError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(err);
        }
    }

    /// Makes `op` on the blob called `name` fail with `err` until cleared.
    pub fn fail_op(&self, op: BlobOp, name: &str, err: BlobStoreError) {
        if let Ok(mut targeted) = self.targeted.lock() {
            targeted.push((op, name.to_string(), err));
        }
    }

    /// Answers every call carrying `access_token` with `Unauthorized`.
    pub fn reject_token(&self, access_token: &str) {
        if let Ok(mut rejected) = self.rejected_tokens.lock() {
            rejected.push(access_token.to_string());
        }
    }

    /// Clears every injected failure, targeted ones and rejected tokens included.
    pub fn clear_failure(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
        if let Ok(mut targeted) = self.targeted.lock() {
            targeted.clear();
        }
        if let Ok(mut rejected) = self.rejected_tokens.lock() {
            rejected.clear();
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Names of all stored blobs, sorted.
    pub fn names(&self) -> Vec<String> {
        let blobs = match self.blobs.lock() {
            Ok(b) => b,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = blobs.values().map(|b| b.name.clone()).collect();
        names.sort();
        names
    }

    /// Raw bytes of the blob called `name`, if any.
    pub fn bytes_by_name(&self, name: &str) -> Option<Vec<u8>> {
        let blobs = self.blobs.lock().ok()?;
        blobs
            .values()
            .find(|b| b.name == name)
            .map(|b| b.bytes.clone())
    }

    fn check_failure(&self, access_token: &str) -> BlobStoreResult<()> {
        let rejected = self
            .rejected_tokens
            .lock()
            .map_err(|_| BlobStoreError::Other("memory store poisoned".to_string()))?;
        if rejected.iter().any(|t| t == access_token) {
            return Err(BlobStoreError::Unauthorized);
        }
        drop(rejected);

        let failure = self
            .failure
            .lock()
            .map_err(|_| BlobStoreError::Other("memory store poisoned".to_string()))?;
        match failure.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_targeted(&self, op: BlobOp, name: &str) -> BlobStoreResult<()> {
        let targeted = self
            .targeted
            .lock()
            .map_err(|_| BlobStoreError::Other("memory store poisoned".to_string()))?;
        match targeted.iter().find(|(o, n, _)| *o == op && n == name) {
            Some((_, _, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn lock_blobs(&self) -> BlobStoreResult<std::sync::MutexGuard<'_, BTreeMap<String, MemoryBlob>>> {
        self.blobs
            .lock()
            .map_err(|_| BlobStoreError::Other("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        access_token: &str,
        name: &str,
        bytes: Vec<u8>,
        parent: Option<&str>,
    ) -> BlobStoreResult<String> {
        // Yield so concurrent callers can interleave like real network I/O.
        tokio::task::yield_now().await;
        self.check_failure(access_token)?;
        self.check_targeted(BlobOp::Upload, name)?;

        let mut blobs = self.lock_blobs()?;
        let existing = blobs
            .iter()
            .find(|(_, b)| b.name == name && b.parent.as_deref() == parent)
            .map(|(id, _)| id.clone());

        let id = existing
            .unwrap_or_else(|| format!("blob-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        blobs.insert(
            id.clone(),
            MemoryBlob {
                name: name.to_string(),
                parent: parent.map(str::to_string),
                bytes,
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn download(&self, access_token: &str, id: &str) -> BlobStoreResult<Vec<u8>> {
        tokio::task::yield_now().await;
        self.check_failure(access_token)?;

        let blobs = self.lock_blobs()?;
        let blob = blobs
            .get(id)
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))?;
        self.check_targeted(BlobOp::Download, &blob.name)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(blob.bytes.clone())
    }

    async fn delete(&self, access_token: &str, id: &str) -> BlobStoreResult<()> {
        tokio::task::yield_now().await;
        self.check_failure(access_token)?;

        let mut blobs = self.lock_blobs()?;
        if let Some(blob) = blobs.get(id) {
            self.check_targeted(BlobOp::Delete, &blob.name)?;
        }
        blobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))
    }

    async fn find_by_name(
        &self,
        access_token: &str,
        name: &str,
        parent: Option<&str>,
    ) -> BlobStoreResult<Option<String>> {
        tokio::task::yield_now().await;
        self.check_failure(access_token)?;
        self.check_targeted(BlobOp::FindByName, name)?;

        let blobs = self.lock_blobs()?;
        Ok(blobs
            .iter()
            .find(|(_, b)| b.name == name && b.parent.as_deref() == parent)
            .map(|(id, _)| id.clone()))
    }

    async fn list(&self, access_token: &str, parent: Option<&str>) -> BlobStoreResult<Vec<BlobInfo>> {
        tokio::task::yield_now().await;
        self.check_failure(access_token)?;
        self.check_targeted(BlobOp::List, parent.unwrap_or_default())?;

        let blobs = self.lock_blobs()?;
        Ok(blobs
            .iter()
            .filter(|(_, b)| b.parent.as_deref() == parent)
            .map(|(id, b)| BlobInfo {
                id: id.clone(),
                name: b.name.clone(),
                size: b.bytes.len() as u64,
            })
            .collect())
    }
}
