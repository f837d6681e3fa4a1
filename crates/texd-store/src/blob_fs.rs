// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directory-backed blob store with HMAC-signed URLs.
//!
//! Objects live at `<root>/<key>`; a `<key>.meta` JSON sidecar records the
//! content type. Signed URLs use the `texd-blob://` scheme and carry an
//! expiry plus a hex HMAC-SHA256 token over `key|expiry_unix`; the HTTP
//! layer that serves artifact downloads verifies them with
//! [`FsBlobStore::verify_url_token`].

use crate::{BlobStore, Result, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::time::Duration;
use texd_types::is_safe_relative_path;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    content_type: String,
    size: u64,
    uploaded_at: chrono::DateTime<Utc>,
}

/// Filesystem-backed [`BlobStore`].
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    signing_secret: String,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transport`] if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>, signing_secret: impl Into<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::transport(format!("create blob root {}", root.display()), e))?;
        Ok(Self {
            root,
            signing_secret: signing_secret.into(),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys come from job ids and fixed artifact names, but a store
        // must not trust its callers with path semantics.
        if !is_safe_relative_path(key) {
            return Err(StoreError::Transport {
                reason: format!("invalid blob key: {key}"),
                source: None,
            });
        }
        Ok(self.root.join(key))
    }

    /// HMAC-SHA256 over `key|expiry_unix` with the store's secret.
    fn mac_for(&self, key: &str, expires_unix: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(key.as_bytes());
        mac.update(b"|");
        mac.update(expires_unix.to_string().as_bytes());
        mac
    }

    fn token_for(&self, key: &str, expires_unix: i64) -> String {
        hex_encode(&self.mac_for(key, expires_unix).finalize().into_bytes())
    }

    /// Verify a token minted by [`BlobStore::sign`] for `key`.
    ///
    /// Returns `false` for wrong tokens and for expired URLs. The tag
    /// comparison is constant-time.
    #[must_use]
    pub fn verify_url_token(&self, key: &str, expires_unix: i64, token: &str) -> bool {
        if expires_unix < Utc::now().timestamp() {
            return false;
        }
        let Some(tag) = hex_decode(token) else {
            return false;
        };
        self.mac_for(key, expires_unix).verify_slice(&tag).is_ok()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.object_path(blob_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: blob_ref.to_string(),
            }),
            Err(e) => Err(StoreError::transport(format!("read {}", path.display()), e)),
        }
    }

    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::transport(format!("create {}", parent.display()), e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::transport(format!("write {}", path.display()), e))?;

        let meta = BlobMeta {
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            uploaded_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec(&meta)
            .map_err(|e| StoreError::transport("encode blob metadata", e))?;
        let meta_path = path.with_extension(meta_extension(&path));
        tokio::fs::write(&meta_path, meta_json)
            .await
            .map_err(|e| StoreError::transport(format!("write {}", meta_path.display()), e))?;

        debug!(target: "texd.store", key, size = bytes.len(), "blob uploaded");
        Ok(())
    }

    async fn sign(&self, key: &str, ttl: Duration) -> Result<String> {
        // Reject signing keys that could never resolve.
        let path = self.object_path(key)?;
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::transport(format!("stat {}", path.display()), e))?
        {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = self.token_for(key, expires);
        Ok(format!("texd-blob:///{key}?expires={expires}&token={token}"))
    }
}

fn meta_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.meta"),
        None => "meta".to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
