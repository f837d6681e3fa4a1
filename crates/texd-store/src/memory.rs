// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store twins for tests and single-process deployments.
//!
//! Both stores support failure injection so the runtime suite can exercise
//! transport faults and per-asset download failures without a backend.

use crate::{BlobStore, RecordStore, Result, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use texd_types::{CompilationPatch, CompilationRecord, SourcePayload};

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BlobInner {
    objects: HashMap<String, (Vec<u8>, String)>,
    poisoned: HashSet<String>,
}

/// Hash-map-backed [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    inner: Mutex<BlobInner>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an object (e.g. a project asset).
    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>, content_type: &str) {
        self.inner
            .lock()
            .expect("blob lock poisoned")
            .objects
            .insert(key.into(), (bytes.into(), content_type.to_string()));
    }

    /// Make every download of `key` fail with a transport error.
    pub fn poison(&self, key: impl Into<String>) {
        self.inner
            .lock()
            .expect("blob lock poisoned")
            .poisoned
            .insert(key.into());
    }

    /// Make every operation fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Bytes stored under `key`, if present (test assertion helper).
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("blob lock poisoned")
            .objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("blob lock poisoned").objects.len()
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport {
                reason: "blob store offline".into(),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        let inner = self.inner.lock().expect("blob lock poisoned");
        if inner.poisoned.contains(blob_ref) {
            return Err(StoreError::Transport {
                reason: format!("injected failure for {blob_ref}"),
                source: None,
            });
        }
        inner
            .objects
            .get(blob_ref)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: blob_ref.to_string(),
            })
    }

    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.check_online()?;
        self.put(key, bytes.to_vec(), content_type);
        Ok(())
    }

    async fn sign(&self, key: &str, ttl: Duration) -> Result<String> {
        self.check_online()?;
        let inner = self.inner.lock().expect("blob lock poisoned");
        if !inner.objects.contains_key(key) {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RecordInner {
    payloads: HashMap<String, SourcePayload>,
    compilations: HashMap<String, CompilationRecord>,
    patch_log: Vec<(String, CompilationPatch)>,
}

/// Hash-map-backed [`RecordStore`] that additionally records every patch,
/// so tests can assert the at-most-one-terminal-update invariant.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<RecordInner>,
    offline: AtomicBool,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the payload served for `project_id`.
    pub fn put_payload(&self, project_id: impl Into<String>, payload: SourcePayload) {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .payloads
            .insert(project_id.into(), payload);
    }

    /// Insert a compilation row (as the external enqueuer would).
    pub fn insert(&self, record: CompilationRecord) {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .compilations
            .insert(record.id.clone(), record);
    }

    /// Make every operation fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every patch applied to `id`, in order.
    #[must_use]
    pub fn patches_for(&self, id: &str) -> Vec<CompilationPatch> {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .patch_log
            .iter()
            .filter(|(pid, _)| pid == id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Patches for `id` that set a terminal status.
    #[must_use]
    pub fn terminal_patches_for(&self, id: &str) -> Vec<CompilationPatch> {
        self.patches_for(id)
            .into_iter()
            .filter(|p| p.status.is_some_and(|s| s.is_terminal()))
            .collect()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport {
                reason: "record store offline".into(),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn project_payload(&self, project_id: &str) -> Result<SourcePayload> {
        self.check_online()?;
        self.inner
            .lock()
            .expect("record lock poisoned")
            .payloads
            .get(project_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: project_id.to_string(),
            })
    }

    async fn compilation(&self, id: &str) -> Result<Option<CompilationRecord>> {
        self.check_online()?;
        Ok(self
            .inner
            .lock()
            .expect("record lock poisoned")
            .compilations
            .get(id)
            .cloned())
    }

    async fn update_compilation(&self, id: &str, patch: CompilationPatch) -> Result<()> {
        self.check_online()?;
        let mut inner = self.inner.lock().expect("record lock poisoned");
        let Some(record) = inner.compilations.get_mut(id) else {
            return Err(StoreError::NotFound {
                key: id.to_string(),
            });
        };
        patch.apply_to(record);
        inner.patch_log.push((id.to_string(), patch));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use texd_types::{CompileStatus, TexEngine};

    fn record(id: &str) -> CompilationRecord {
        CompilationRecord {
            id: id.into(),
            project_id: "p".into(),
            triggered_by: None,
            status: CompileStatus::Queued,
            pdf_url: None,
            synctex_url: None,
            log: None,
            duration_ms: None,
            engine: TexEngine::Pdflatex,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn blob_roundtrip_and_not_found() {
        let store = MemoryBlobStore::new();
        store.put("a", b"bytes".to_vec(), "application/octet-stream");
        assert_eq!(store.download("a").await.unwrap(), b"bytes");
        assert!(store.download("b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn poisoned_blob_fails_with_transport() {
        let store = MemoryBlobStore::new();
        store.put("a", b"x".to_vec(), "image/png");
        store.poison("a");
        let err = store.download("a").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn offline_blob_store_fails_everything() {
        let store = MemoryBlobStore::new();
        store.put("a", b"x".to_vec(), "image/png");
        store.set_offline(true);
        assert!(store.download("a").await.is_err());
        assert!(store.upload("b", b"y", "t").await.is_err());
        assert!(store.sign("a", Duration::from_secs(1)).await.is_err());
        store.set_offline(false);
        assert!(store.download("a").await.is_ok());
    }

    #[tokio::test]
    async fn record_patch_merges_and_logs() {
        let store = MemoryRecordStore::new();
        store.insert(record("c-1"));
        store
            .update_compilation("c-1", CompilationPatch::status(CompileStatus::Compiling))
            .await
            .unwrap();
        store
            .update_compilation(
                "c-1",
                CompilationPatch {
                    status: Some(CompileStatus::Success),
                    pdf_url: Some("url".into()),
                    ..CompilationPatch::default()
                },
            )
            .await
            .unwrap();

        let rec = store.compilation("c-1").await.unwrap().unwrap();
        assert_eq!(rec.status, CompileStatus::Success);
        assert_eq!(rec.pdf_url.as_deref(), Some("url"));
        assert_eq!(store.patches_for("c-1").len(), 2);
        assert_eq!(store.terminal_patches_for("c-1").len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_compilation_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_compilation("ghost", CompilationPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn payload_lookup() {
        let store = MemoryRecordStore::new();
        store.put_payload("p", SourcePayload::default());
        assert!(store.project_payload("p").await.is_ok());
        assert!(store.project_payload("q").await.unwrap_err().is_not_found());
    }
}
