//! Object storage adapters for evidence photos and signatures

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use super::{EvidenceStorage, LogisticsError, Result};

/// Reject keys that could escape the storage root
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(LogisticsError::InvalidInput("empty object key".to_string()));
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(LogisticsError::InvalidInput(format!(
            "object key must be a relative path: {key}"
        )));
    }
    Ok(())
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

/// Objects stored as files under a root directory
pub struct LocalObjectStorage {
    root: PathBuf,
    public_url: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl EvidenceStorage for LocalObjectStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LogisticsError::UploadFailure(format!("{key}: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| LogisticsError::UploadFailure(format!("{key}: {e}")))?;
        Ok(join_url(&self.public_url, key))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogisticsError::UploadFailure(format!(
                "delete {key}: {e}"
            ))),
        }
    }
}

/// A stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object storage held in memory, with failure injection for tests
pub struct InMemoryObjectStorage {
    public_url: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    /// Number of puts that succeed before every later put fails
    fail_puts_after: AtomicUsize,
    puts: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl InMemoryObjectStorage {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            objects: RwLock::new(HashMap::new()),
            fail_puts_after: AtomicUsize::new(usize::MAX),
            puts: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Let `n` more puts succeed, then fail the rest
    pub fn fail_puts_after(&self, n: usize) {
        let done = self.puts.load(Ordering::SeqCst);
        self.fail_puts_after
            .store(done.saturating_add(n), Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("memory://evidence")
    }
}

#[async_trait]
impl EvidenceStorage for InMemoryObjectStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        validate_key(key)?;
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.fail_puts_after.load(Ordering::SeqCst) {
            return Err(LogisticsError::UploadFailure(format!(
                "{key}: storage unavailable"
            )));
        }
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(join_url(&self.public_url, key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(LogisticsError::UploadFailure(format!(
                "delete {key}: storage unavailable"
            )));
        }
        self.objects.write().await.remove(key);
        Ok(())
    }
}
