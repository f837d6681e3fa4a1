// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy with stable error codes for texd.
//!
//! Error kinds are contracts, not concrete types: every failure anywhere
//! in the service maps to one [`ErrorCode`] whose [`Disposition`] decides
//! how the worker reacts: suppress and log, fail the attempt terminally,
//! or hand the job back to the queue for redelivery. [`TexdError`] is the
//! carrier: code, message, optional cause, structured context.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use texd_types::CompileStatus;

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// How the worker reacts to an error of a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Log a warning line and carry on; the compilation can still succeed.
    Recoverable,
    /// Return the attempt to the queue; redelivery will retry it.
    Transient,
    /// End the job in a terminal record state.
    Fatal,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Serialises to `SCREAMING_SNAKE_CASE`; the string form is part of the
/// service's observable surface and must not change across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed job envelope: missing fields, traversal, duplicates.
    InvalidPayload,
    /// Failure talking to the blob store, record store, or queue backend.
    Transport,
    /// A single asset download failed; staging continues without it.
    AssetUnavailable,
    /// The sandbox container could not be created or started.
    SandboxStart,
    /// The engine ran and failed, or succeeded without producing a PDF.
    BuildFailure,
    /// The hard deadline expired or the engine reported its own timeout.
    Timeout,
    /// Position map absent, corrupt, or failed to decompress.
    PositionMapUnavailable,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// How the worker must react to this code.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::AssetUnavailable | Self::PositionMapUnavailable => Disposition::Recoverable,
            Self::Transport => Disposition::Transient,
            Self::InvalidPayload
            | Self::SandboxStart
            | Self::BuildFailure
            | Self::Timeout
            | Self::Internal => Disposition::Fatal,
        }
    }

    /// Terminal record status for fatal codes; `None` otherwise.
    #[must_use]
    pub fn terminal_status(&self) -> Option<CompileStatus> {
        match self.disposition() {
            Disposition::Fatal => Some(match self {
                Self::Timeout => CompileStatus::Timeout,
                _ => CompileStatus::Error,
            }),
            _ => None,
        }
    }

    /// Stable string form (e.g. `"INVALID_PAYLOAD"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::Transport => "TRANSPORT",
            Self::AssetUnavailable => "ASSET_UNAVAILABLE",
            Self::SandboxStart => "SANDBOX_START",
            Self::BuildFailure => "BUILD_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::PositionMapUnavailable => "POSITION_MAP_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TexdError
// ---------------------------------------------------------------------------

/// Unified service error carrying a stable code, message, optional cause,
/// and structured diagnostic context.
///
/// ```
/// use texd_error::{ErrorCode, TexdError};
///
/// let err = TexdError::new(ErrorCode::Transport, "blob download failed")
///     .with_context("blob_ref", "assets/p1/logo.png")
///     .with_context("attempt", 2);
/// assert!(err.is_transient());
/// ```
pub struct TexdError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Structured context for diagnostics (deterministic ordering).
    pub context: BTreeMap<String, serde_json::Value>,
}

impl TexdError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// Values that fail to serialise are skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.disposition()`.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        self.code.disposition()
    }

    /// `true` when the attempt should go back to the queue.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Transient
    }

    /// `true` when the job must end in a terminal record state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }
}

impl fmt::Debug for TexdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TexdError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for TexdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TexdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the service crates.
pub type Result<T> = std::result::Result<T, TexdError>;
