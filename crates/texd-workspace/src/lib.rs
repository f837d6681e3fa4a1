// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ephemeral compilation workspaces.
//!
//! A [`CompileWorkspace`] is a private temp directory with two subtrees:
//! `source/` (payload text files plus downloaded assets) and `output/`
//! (empty at creation, written by the sandboxed engine). The backing
//! directory is removed when the workspace is dropped, so cleanup holds on
//! every exit path including panics; [`CompileWorkspace::destroy`] exists
//! for callers that want the removal error.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use texd_store::BlobStore;
use texd_types::{PayloadError, SourcePayload};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Errors fatal to workspace construction or staging.
///
/// Per-asset download failures are *not* errors; they surface as warnings
/// in the [`StageReport`].
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The payload violates an invariant (traversal, duplicates, empty).
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// Filesystem operation failed.
    #[error("workspace I/O failed: {context}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> WorkspaceError {
    let context = context.into();
    move |source| WorkspaceError::Io { context, source }
}

/// Outcome of staging a payload into a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Workspace-relative entrypoint handed to the engine.
    pub entrypoint: String,
    /// Number of assets successfully downloaded.
    pub assets_fetched: usize,
    /// Number of assets in the payload.
    pub assets_total: usize,
    /// One human-readable line per failed asset.
    pub warnings: Vec<String>,
}

/// A private directory tree for one compilation.
#[derive(Debug)]
pub struct CompileWorkspace {
    root: TempDir,
}

impl CompileWorkspace {
    /// Create an empty workspace with `source/` and `output/` subtrees.
    ///
    /// The tree lives under `parent` when given, otherwise under the
    /// system temp directory. Access is restricted to the owning user.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] if directory creation fails.
    pub fn create(parent: Option<&Path>) -> Result<Self, WorkspaceError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("texd-ws-");
        let root = match parent {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(io_err("create workspace root"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(root.path(), std::fs::Permissions::from_mode(0o700))
                .map_err(io_err("restrict workspace permissions"))?;
        }

        std::fs::create_dir(root.path().join("source")).map_err(io_err("create source/"))?;
        std::fs::create_dir(root.path().join("output")).map_err(io_err("create output/"))?;

        debug!(target: "texd.workspace", root = %root.path().display(), "workspace created");
        Ok(Self { root })
    }

    /// Root of the workspace tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// The `source/` subtree (bind-mounted read-write into the sandbox).
    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.root.path().join("source")
    }

    /// The `output/` subtree the engine writes artifacts into.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.path().join("output")
    }

    /// Materialize `payload` into `source/`.
    ///
    /// Text files are written first; any traversal or duplicate fails the
    /// whole stage before a single byte lands on disk. Asset downloads
    /// run afterwards and fail soft: each failure becomes a warning line
    /// in the report and staging continues.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::InvalidPayload`] or
    /// [`WorkspaceError::Io`].
    pub async fn stage(
        &self,
        payload: &SourcePayload,
        blobs: &dyn BlobStore,
    ) -> Result<StageReport, WorkspaceError> {
        payload.validate()?;

        let source = self.source_dir();
        for file in &payload.files {
            let dest = source.join(&file.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_err(format!("create parent of {}", file.path)))?;
            }
            tokio::fs::write(&dest, file.content.as_bytes())
                .await
                .map_err(io_err(format!("write {}", file.path)))?;
        }

        let mut warnings = Vec::new();
        let mut fetched = 0usize;
        for asset in &payload.assets {
            match blobs.download(&asset.blob_ref).await {
                Ok(bytes) => {
                    let dest = source.join(&asset.path);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(io_err(format!("create parent of {}", asset.path)))?;
                    }
                    tokio::fs::write(&dest, &bytes)
                        .await
                        .map_err(io_err(format!("write {}", asset.path)))?;
                    fetched += 1;
                }
                Err(e) => {
                    warn!(
                        target: "texd.workspace",
                        asset = %asset.path,
                        blob_ref = %asset.blob_ref,
                        error = %e,
                        "asset download failed, continuing without it"
                    );
                    warnings.push(format!("Asset warning: {} unavailable ({e})", asset.path));
                }
            }
        }

        debug!(
            target: "texd.workspace",
            fetched,
            total = payload.assets.len(),
            "assets staged"
        );

        Ok(StageReport {
            entrypoint: payload.entrypoint().to_string(),
            assets_fetched: fetched,
            assets_total: payload.assets.len(),
            warnings,
        })
    }

    /// Artifact under `output/` whose name ends with `suffix`.
    ///
    /// The scan is recursive; among multiple matches the shallowest wins,
    /// with lexicographic path order as the tie-break, so repeated scans
    /// are deterministic.
    #[must_use]
    pub fn find_artifact(&self, suffix: &str) -> Option<PathBuf> {
        WalkDir::new(self.output_dir())
            .follow_links(false)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name.ends_with(suffix))
            })
            .min_by(|a, b| {
                a.depth()
                    .cmp(&b.depth())
                    .then_with(|| a.path().cmp(b.path()))
            })
            .map(|entry| entry.into_path())
    }

    /// Remove the workspace tree, surfacing the removal error.
    ///
    /// Dropping the workspace removes it too; this is for callers that
    /// want to log a failed removal.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] if the tree cannot be removed.
    pub fn destroy(self) -> Result<(), WorkspaceError> {
        self.root.close().map_err(io_err("remove workspace root"))
    }
}

/// Create a workspace and stage `payload` into it in one step.
///
/// On any fatal staging error the partially-built workspace is destroyed
/// before the error is returned.
///
/// # Errors
///
/// Returns [`WorkspaceError`] from creation or staging.
pub async fn build(
    parent: Option<&Path>,
    payload: &SourcePayload,
    blobs: &dyn BlobStore,
) -> Result<(CompileWorkspace, StageReport), WorkspaceError> {
    let workspace = CompileWorkspace::create(parent)?;
    match workspace.stage(payload, blobs).await {
        Ok(report) => Ok((workspace, report)),
        // Dropping `workspace` removes the tree before we return.
        Err(e) => Err(e),
    }
}
