// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hardened sandbox execution for TeX builds.
//!
//! The orchestrator talks to a [`SandboxExecutor`]: give it a
//! [`SandboxSpec`] (image, entrypoint, bind mounts, resource caps), a
//! line callback, and a hard deadline; get back a [`SandboxOutcome`].
//! The production implementation is [`DockerExecutor`]; tests script
//! their own executor against the same trait.
//!
//! Exit-code conventions from the sandbox image contract: `0` means the
//! engine finished (a PDF may still be missing), [`EXIT_ENGINE_TIMEOUT`]
//! is the wrapper's own timeout sentinel, anything else is a build
//! failure. Mapping those onto job status is the orchestrator's concern,
//! with one exception: an executor-level deadline expiry is reported as
//! [`ExitDisposition::DeadlineExceeded`] no matter what the container
//! would have exited with, and always maps to a timeout.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod frame;

mod docker;

pub use cancel::CancelToken;
pub use docker::DockerExecutor;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use texd_config::SandboxConfig;
use texd_types::TexEngine;

/// Exit code the engine wrapper uses for its own internal timeout.
pub const EXIT_ENGINE_TIMEOUT: i64 = 3;

/// Fixed path the workspace `source/` tree is mounted at.
pub const MOUNT_SOURCE: &str = "/work/source";

/// Fixed path the workspace `output/` tree is mounted at.
pub const MOUNT_OUTPUT: &str = "/work/output";

/// Errors from sandbox lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// No image is registered for the requested engine.
    #[error("no sandbox image registered for engine '{0}'")]
    UnknownEngine(TexEngine),

    /// The container could not be created or started.
    #[error("sandbox start failed: {0}")]
    Start(String),

    /// The container ran but its lifecycle could not be observed.
    #[error("sandbox runtime failure: {0}")]
    Runtime(String),
}

/// Everything needed to run one build in a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    /// Container image to run.
    pub image: String,
    /// Entrypoint file, relative to the mounted source tree; the image's
    /// single argument.
    pub entrypoint: String,
    /// Host path bound read-write at [`MOUNT_SOURCE`].
    pub source_dir: PathBuf,
    /// Host path bound read-write at [`MOUNT_OUTPUT`].
    pub output_dir: PathBuf,
    /// Memory cap in MiB.
    pub memory_mib: u64,
    /// CPU cap in vCPU-equivalents.
    pub cpus: f64,
    /// Maximum process count.
    pub pids_limit: i64,
    /// Writable tmpfs scratch size in MiB.
    pub tmpfs_mib: u64,
}

impl SandboxSpec {
    /// Build a spec from the sandbox configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::UnknownEngine`] when the config registers
    /// no image for `engine`.
    pub fn from_config(
        config: &SandboxConfig,
        engine: TexEngine,
        entrypoint: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, SandboxError> {
        let image = config
            .image_for(engine)
            .ok_or(SandboxError::UnknownEngine(engine))?
            .to_string();
        Ok(Self {
            image,
            entrypoint: entrypoint.into(),
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            memory_mib: config.memory_mib,
            cpus: config.cpus,
            pids_limit: config.pids_limit,
            tmpfs_mib: config.tmpfs_mib,
        })
    }
}

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The container exited on its own with this code.
    Exited(i64),
    /// The executor's hard deadline fired first; the container was
    /// forcibly terminated. Takes precedence over any exit code.
    DeadlineExceeded,
}

/// Result of one sandbox execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxOutcome {
    /// How the process ended.
    pub exit: ExitDisposition,
    /// Wall-clock time the execution took.
    pub wall_time: Duration,
}

impl SandboxOutcome {
    /// `true` when the engine itself reported success (exit code 0).
    #[must_use]
    pub fn engine_succeeded(&self) -> bool {
        matches!(self.exit, ExitDisposition::Exited(0))
    }

    /// `true` when the outcome maps to the `timeout` status: either the
    /// executor deadline fired or the engine wrapper returned its
    /// timeout sentinel.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        matches!(
            self.exit,
            ExitDisposition::DeadlineExceeded | ExitDisposition::Exited(EXIT_ENGINE_TIMEOUT)
        )
    }
}

/// Runs one build inside an ephemeral, resource-capped sandbox.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Run the sandbox to completion, deadline, or cancellation.
    ///
    /// Every completed output line is handed to `on_line` in arrival
    /// order; a partial trailing line is flushed when the stream closes.
    /// A fired `cancel` token is treated like a deadline expiry: the
    /// container is killed and the outcome is
    /// [`ExitDisposition::DeadlineExceeded`]. Implementations must
    /// destroy the container on every path.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Start`] when the container cannot be
    /// created or started, [`SandboxError::Runtime`] when its lifecycle
    /// cannot be observed afterwards.
    async fn execute(
        &self,
        spec: &SandboxSpec,
        on_line: &(dyn Fn(String) + Send + Sync),
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SandboxOutcome, SandboxError>;
}
