// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and defaults for texd.
//!
//! [`TexdConfig`] is the top-level runtime configuration, loaded from TOML.
//! Validation distinguishes hard [`ConfigError`]s from advisory
//! [`ConfigWarning`]s: a warning never prevents startup.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use texd_types::TexEngine;

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors that prevent the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was being read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that deserve an operator's attention but do not block
/// startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The sandbox deadline is unusually generous.
    LargeDeadline {
        /// Configured deadline in seconds.
        secs: u64,
    },
    /// Signed URLs expire very quickly.
    ShortSignedUrlTtl {
        /// Configured TTL in seconds.
        secs: u64,
    },
    /// The rate limit admits more jobs than concurrency can absorb.
    RateExceedsConcurrency {
        /// Sliding-window cap.
        rate_max: u32,
        /// Concurrency bound.
        concurrency: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeDeadline { secs } => {
                write!(f, "sandbox deadline of {secs}s is unusually large")
            }
            ConfigWarning::ShortSignedUrlTtl { secs } => {
                write!(f, "signed URL TTL of {secs}s may expire before clients fetch artifacts")
            }
            ConfigWarning::RateExceedsConcurrency {
                rate_max,
                concurrency,
            } => write!(
                f,
                "rate limit {rate_max}/window exceeds what concurrency {concurrency} can absorb"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Queue consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum jobs in flight.
    pub concurrency: usize,
    /// Sliding-window cap: at most this many job starts per window.
    pub rate_limit_max: u32,
    /// Sliding-window length in seconds.
    pub rate_limit_window_secs: u64,
    /// Seconds without progress before a leased job is reclaimed.
    pub stall_grace_secs: u64,
    /// Seconds in-flight jobs get to finish after a shutdown signal.
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            stall_grace_secs: 120,
            shutdown_grace_secs: 30,
        }
    }
}

impl QueueConfig {
    /// Sliding-window length as a [`Duration`].
    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    /// Stall grace as a [`Duration`].
    #[must_use]
    pub fn stall_grace(&self) -> Duration {
        Duration::from_secs(self.stall_grace_secs)
    }

    /// Shutdown grace as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Sandbox resource caps and engine image registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container memory cap in MiB.
    pub memory_mib: u64,
    /// CPU cap in vCPU-equivalents.
    pub cpus: f64,
    /// Maximum process count inside the container.
    pub pids_limit: i64,
    /// Writable tmpfs scratch size in MiB.
    pub tmpfs_mib: u64,
    /// Hard wall-clock deadline in seconds.
    pub deadline_secs: u64,
    /// Engine tag → container image.
    pub images: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let images = TexEngine::ALL
            .iter()
            .map(|e| (e.as_str().to_string(), format!("texd/texlive:{e}")))
            .collect();
        Self {
            memory_mib: 512,
            cpus: 1.0,
            pids_limit: 100,
            tmpfs_mib: 50,
            deadline_secs: 90,
            images,
        }
    }
}

impl SandboxConfig {
    /// Deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Image for the given engine, if registered.
    #[must_use]
    pub fn image_for(&self, engine: TexEngine) -> Option<&str> {
        self.images.get(engine.as_str()).map(String::as_str)
    }
}

/// Blob storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the filesystem blob store.
    pub root: String,
    /// Secret used to sign artifact URLs.
    pub signing_secret: String,
    /// Signed URL lifetime in seconds.
    pub signed_url_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/texd/blobs".into(),
            signing_secret: String::new(),
            signed_url_ttl_secs: 3600,
        }
    }
}

impl StorageConfig {
    /// Signed URL TTL as a [`Duration`].
    #[must_use]
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for texd.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TexdConfig {
    /// Log level override (e.g. `"debug"`, `"info"`).
    pub log_level: Option<String>,
    /// Queue consumer settings.
    pub queue: QueueConfig,
    /// Sandbox settings.
    pub sandbox: SandboxConfig,
    /// Blob storage settings.
    pub storage: StorageConfig,
}

impl TexdConfig {
    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is missing, unreadable, not
    /// valid TOML, or semantically invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] or
    /// [`ConfigError::ValidationError`].
    pub fn from_toml(text: &str) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Validate semantics, returning advisory warnings on success.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every problem.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.queue.concurrency == 0 {
            reasons.push("queue.concurrency must be at least 1".to_string());
        }
        if self.queue.rate_limit_max == 0 {
            reasons.push("queue.rate_limit_max must be at least 1".to_string());
        }
        if self.queue.rate_limit_window_secs == 0 {
            reasons.push("queue.rate_limit_window_secs must be at least 1".to_string());
        }
        if self.sandbox.deadline_secs == 0 {
            reasons.push("sandbox.deadline_secs must be at least 1".to_string());
        }
        if self.sandbox.memory_mib == 0 {
            reasons.push("sandbox.memory_mib must be at least 1".to_string());
        }
        if !(self.sandbox.cpus > 0.0) {
            reasons.push("sandbox.cpus must be positive".to_string());
        }
        if self.storage.signing_secret.is_empty() {
            reasons.push("storage.signing_secret must not be empty".to_string());
        }
        for engine in TexEngine::ALL {
            if self.sandbox.image_for(*engine).is_none() {
                reasons.push(format!("sandbox.images is missing engine '{engine}'"));
            }
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.sandbox.deadline_secs > 600 {
            warnings.push(ConfigWarning::LargeDeadline {
                secs: self.sandbox.deadline_secs,
            });
        }
        if self.storage.signed_url_ttl_secs < 60 {
            warnings.push(ConfigWarning::ShortSignedUrlTtl {
                secs: self.storage.signed_url_ttl_secs,
            });
        }
        let absorbable = self.queue.concurrency as u32 * 4;
        if self.queue.rate_limit_max > absorbable {
            warnings.push(ConfigWarning::RateExceedsConcurrency {
                rate_max: self.queue.rate_limit_max,
                concurrency: self.queue.concurrency,
            });
        }
        Ok(warnings)
    }
}
