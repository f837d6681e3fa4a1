// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob and record store adapters for texd.
//!
//! The orchestrator never talks to storage backends directly; it receives
//! [`BlobStore`] and [`RecordStore`] trait objects at construction time.
//! This keeps the runtime testable with the in-memory twins in this crate
//! and leaves the production wiring to the daemon.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob_fs;
mod memory;

pub use blob_fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryRecordStore};

use async_trait::async_trait;
use std::time::Duration;
use texd_types::{CompilationPatch, CompilationRecord, SourcePayload};

/// Errors surfaced by store adapters.
///
/// `NotFound` is a definitive answer; `Transport` is a transient backend
/// failure the caller may retry or surrender to the queue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object or row does not exist.
    #[error("not found: {key}")]
    NotFound {
        /// Key or id that was requested.
        key: String,
    },

    /// Talking to the backend failed.
    #[error("store transport failure: {reason}")]
    Transport {
        /// Human-readable failure detail.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Build a transport error from any cause.
    pub fn transport(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// `true` for [`StoreError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Opaque object store with signed-URL issuance.
///
/// Operations are independently retryable; there is no cross-operation
/// transactionality. Uploads overwrite.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the bytes stored under `blob_ref`.
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, overwriting any existing object.
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Issue a URL for `key` valid for at most `ttl`.
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Durable store holding project payloads and compilation rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Assemble the source payload for a project.
    async fn project_payload(&self, project_id: &str) -> Result<SourcePayload>;

    /// Read one compilation row, if it exists.
    async fn compilation(&self, id: &str) -> Result<Option<CompilationRecord>>;

    /// Merge `patch` into the compilation row.
    ///
    /// The store applies fields mechanically; status monotonicity is the
    /// orchestrator's responsibility.
    async fn update_compilation(&self, id: &str, patch: CompilationPatch) -> Result<()>;
}
