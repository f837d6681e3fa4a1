// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the texd compilation service.
//!
//! Everything that crosses a process or adapter boundary lives here: the
//! [`CompileJob`] envelope consumed from the work queue, the
//! [`CompileStatus`] lifecycle, the [`LogEvent`] wire events fanned out to
//! subscribers, and the durable [`CompilationRecord`] row shape.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TexEngine
// ---------------------------------------------------------------------------

/// TeX engine selecting the sandbox image / command profile.
///
/// The engine is opaque to the orchestrator beyond image selection; the
/// container entrypoint receives the same single argument regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TexEngine {
    /// pdfTeX producing PDF output directly.
    Pdflatex,
    /// XeTeX with system font access.
    Xelatex,
    /// LuaTeX.
    Lualatex,
}

impl TexEngine {
    /// All known engines, for registry validation.
    pub const ALL: &[TexEngine] = &[Self::Pdflatex, Self::Xelatex, Self::Lualatex];

    /// Stable lowercase tag, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdflatex => "pdflatex",
            Self::Xelatex => "xelatex",
            Self::Lualatex => "lualatex",
        }
    }
}

impl std::fmt::Display for TexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CompileStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a compilation.
///
/// Legal transitions are `queued → compiling` and
/// `compiling → {success | error | timeout}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStatus {
    /// Enqueued, not yet picked up by a worker.
    Queued,
    /// A worker is actively building the project.
    Compiling,
    /// Build finished and produced a PDF.
    Success,
    /// Build failed (engine error, invalid payload, or missing PDF).
    Error,
    /// Build exceeded its deadline or the engine reported its own timeout.
    Timeout,
}

impl CompileStatus {
    /// Returns `true` for `success`, `error`, and `timeout`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: CompileStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Compiling)
                | (Self::Compiling, Self::Success)
                | (Self::Compiling, Self::Error)
                | (Self::Compiling, Self::Timeout)
        )
    }

    /// Stable lowercase tag, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Compiling => "compiling",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job envelope
// ---------------------------------------------------------------------------

/// A single text source file in the job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Workspace-relative path, e.g. `chapters/intro.tex`.
    pub path: String,
    /// UTF-8 file content.
    pub content: String,
    /// Whether this file is the compilation root.
    #[serde(default)]
    pub is_entrypoint: bool,
}

/// A binary asset referenced by blob key, downloaded at staging time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Workspace-relative path the asset is written to.
    pub path: String,
    /// Key into the project-assets blob namespace.
    pub blob_ref: String,
}

/// Fallback compilation root when no file is flagged as entrypoint.
pub const DEFAULT_ENTRYPOINT: &str = "main.tex";

/// The transient source payload of one compilation: the text files and
/// binary assets materialized into the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePayload {
    /// Ordered text files; exactly one should be the entrypoint.
    pub files: Vec<SourceFile>,
    /// Ordered binary assets.
    #[serde(default)]
    pub assets: Vec<AssetRef>,
}

impl SourcePayload {
    /// Entrypoint path: the flagged file, or [`DEFAULT_ENTRYPOINT`].
    #[must_use]
    pub fn entrypoint(&self) -> &str {
        self.files
            .iter()
            .find(|f| f.is_entrypoint)
            .map_or(DEFAULT_ENTRYPOINT, |f| f.path.as_str())
    }

    /// Validate the payload invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] when the file list is empty, a path is
    /// absolute / traversing / duplicated, or more than one entrypoint is
    /// flagged.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.files.is_empty() {
            return Err(PayloadError::NoFiles);
        }
        let mut seen = std::collections::HashSet::new();
        for path in self
            .files
            .iter()
            .map(|f| f.path.as_str())
            .chain(self.assets.iter().map(|a| a.path.as_str()))
        {
            if !is_safe_relative_path(path) {
                return Err(PayloadError::UnsafePath(path.to_string()));
            }
            if !seen.insert(path) {
                return Err(PayloadError::DuplicatePath(path.to_string()));
            }
        }
        let entrypoints = self.files.iter().filter(|f| f.is_entrypoint).count();
        if entrypoints > 1 {
            return Err(PayloadError::MultipleEntrypoints(entrypoints));
        }
        Ok(())
    }
}

/// The self-describing job envelope consumed from the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileJob {
    /// Unique compilation identifier (also the record row id).
    pub compilation_id: String,
    /// Owning project.
    pub project_id: String,
    /// Engine tag selecting the sandbox image.
    pub engine: TexEngine,
    /// Source files and assets, flattened into the envelope.
    #[serde(flatten)]
    pub payload: SourcePayload,
}

impl CompileJob {
    /// Entrypoint path: the flagged file, or [`DEFAULT_ENTRYPOINT`].
    #[must_use]
    pub fn entrypoint(&self) -> &str {
        self.payload.entrypoint()
    }

    /// Validate the payload invariants; see [`SourcePayload::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] on any violated invariant.
    pub fn validate(&self) -> Result<(), PayloadError> {
        self.payload.validate()
    }
}

/// Payload invariant violations surfaced by [`CompileJob::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The file list is empty.
    #[error("payload contains no source files")]
    NoFiles,
    /// A path is absolute, traverses upward, or is otherwise unsafe.
    #[error("unsafe path in payload: {0}")]
    UnsafePath(String),
    /// The same path appears more than once across files and assets.
    #[error("duplicate path in payload: {0}")]
    DuplicatePath(String),
    /// More than one file is flagged as entrypoint.
    #[error("payload flags {0} entrypoints, expected at most one")]
    MultipleEntrypoints(usize),
}

/// Whether `path` is a plain relative path that stays inside its root.
///
/// Rejects empty paths, absolute paths, `..` segments, backslash
/// separators, and NUL bytes. `.` segments and a leading `./` are allowed.
#[must_use]
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return false;
    }
    path.split('/').all(|seg| !seg.is_empty() && seg != "..")
}

// ---------------------------------------------------------------------------
// Log events
// ---------------------------------------------------------------------------

/// A transient event on a compilation's log channel.
///
/// The only legal sequence on a channel is `status → log* → done`; the
/// `done` event is always last and appears exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// One line of engine output.
    Log {
        /// Line text without the trailing newline.
        text: String,
        /// Publish timestamp.
        ts: DateTime<Utc>,
    },
    /// Mirror of the durable status transition.
    Status {
        /// The status just persisted.
        status: CompileStatus,
    },
    /// Final event on the channel; carries artifact URLs when present.
    Done {
        /// Signed URL of the produced PDF, if any.
        pdf_url: Option<String>,
        /// Signed URL of the decompressed position map, if any.
        synctex_url: Option<String>,
        /// Wall-clock duration of the attempt.
        duration_ms: u64,
    },
}

impl LogEvent {
    /// Convenience constructor stamping the current time.
    #[must_use]
    pub fn line(text: impl Into<String>) -> Self {
        Self::Log {
            text: text.into(),
            ts: Utc::now(),
        }
    }

    /// Returns `true` for the terminal [`LogEvent::Done`] variant.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

// ---------------------------------------------------------------------------
// Durable record
// ---------------------------------------------------------------------------

/// Durable compilation row, the source of truth for terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationRecord {
    /// Row id; equals the job's `compilation_id`.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Principal that triggered the build, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// Current lifecycle state.
    pub status: CompileStatus,
    /// Signed URL of the produced PDF.
    #[serde(default)]
    pub pdf_url: Option<String>,
    /// Signed URL of the decompressed position map.
    #[serde(default)]
    pub synctex_url: Option<String>,
    /// Full captured engine log, populated on terminal states.
    #[serde(default)]
    pub log: Option<String>,
    /// Wall-clock duration of the attempt.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Engine the build ran with.
    pub engine: TexEngine,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Partial update merged into a [`CompilationRecord`].
///
/// `None` fields are left untouched by the merge; monotonicity of status
/// transitions is the orchestrator's responsibility, not the store's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationPatch {
    /// New status, if changing.
    pub status: Option<CompileStatus>,
    /// PDF URL to set.
    pub pdf_url: Option<String>,
    /// Position-map URL to set.
    pub synctex_url: Option<String>,
    /// Full log text to set.
    pub log: Option<String>,
    /// Duration to set.
    pub duration_ms: Option<u64>,
}

impl CompilationPatch {
    /// A patch that only moves the status.
    #[must_use]
    pub fn status(status: CompileStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply this patch to a record in place.
    pub fn apply_to(&self, record: &mut CompilationRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref url) = self.pdf_url {
            record.pdf_url = Some(url.clone());
        }
        if let Some(ref url) = self.synctex_url {
            record.synctex_url = Some(url.clone());
        }
        if let Some(ref log) = self.log {
            record.log = Some(log.clone());
        }
        if let Some(ms) = self.duration_ms {
            record.duration_ms = Some(ms);
        }
    }
}
