// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-job compile orchestration.
//!
//! One call to [`Orchestrator::run_job`] takes a job from `compiling` to a
//! terminal state:
//!
//! ```text
//! queued ──start──▶ compiling ──ok──▶ success
//!                       │ ├─no_pdf──▶ error
//!                       │ └─exit≠0──▶ error
//!                       └─deadline──▶ timeout
//! ```
//!
//! Invariants upheld here: exactly one terminal record update per job,
//! exactly one `done` event published *after* that update is acknowledged,
//! and workspace/container cleanup on every exit path (the workspace tree
//! is removed by drop even on panic).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use texd_bus::LogBus;
use texd_config::SandboxConfig;
use texd_error::{ErrorCode, TexdError};
use texd_sandbox::{CancelToken, SandboxExecutor, SandboxSpec};
use texd_store::{BlobStore, RecordStore};
use texd_synctex::PositionMap;
use texd_types::{CompilationPatch, CompileJob, CompileStatus, LogEvent};
use texd_workspace::CompileWorkspace;
use tracing::{debug, info, warn};

/// Blob key suffix for the produced PDF.
pub const ARTIFACT_PDF: &str = "output.pdf";

/// Blob key suffix for the decompressed position map.
pub const ARTIFACT_SYNCTEX: &str = "output.synctex";

/// How a job attempt concluded from the consumer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The attempt ran and reached this terminal status.
    Completed(CompileStatus),
    /// The record was already terminal; its `done` event was replayed.
    Replayed(CompileStatus),
    /// The job references no record row; nothing to do.
    Skipped,
}

/// Drives a single compilation end-to-end.
///
/// All collaborators are injected so the orchestrator can run against
/// in-memory stores and a scripted sandbox in tests.
pub struct Orchestrator {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<LogBus>,
    sandbox: Arc<dyn SandboxExecutor>,
    sandbox_config: SandboxConfig,
    signed_url_ttl: Duration,
    workspace_parent: Option<PathBuf>,
}

impl Orchestrator {
    /// Create an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<LogBus>,
        sandbox: Arc<dyn SandboxExecutor>,
        sandbox_config: SandboxConfig,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            records,
            blobs,
            bus,
            sandbox,
            sandbox_config,
            signed_url_ttl,
            workspace_parent: None,
        }
    }

    /// Put workspaces under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_workspace_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_parent = Some(dir.into());
        self
    }

    /// Run one job to a terminal state.
    ///
    /// Engine failures, invalid payloads, and timeouts are *successful*
    /// attempts: they settle the record and return `Ok`. Only
    /// transport-class faults (record store, blob store) escape as `Err`,
    /// telling the consumer to surrender the lease for redelivery.
    ///
    /// # Errors
    ///
    /// Returns a [`TexdError`] with code `TRANSPORT` when a store could
    /// not be reached; the job's record is left non-terminal.
    pub async fn run_job(
        &self,
        job: &CompileJob,
        cancel: &CancelToken,
    ) -> Result<JobOutcome, TexdError> {
        let id = job.compilation_id.as_str();
        let started = Instant::now();

        // At-least-once delivery: a replayed terminal job must not
        // recompile. Re-publish `done` from the record and stop.
        let existing = self
            .records
            .compilation(id)
            .await
            .map_err(|e| transport("read compilation record", e))?;
        let Some(existing) = existing else {
            warn!(target: "texd.runtime", compilation = id, "job references no record row, dropping");
            return Ok(JobOutcome::Skipped);
        };
        if existing.status.is_terminal() {
            debug!(target: "texd.runtime", compilation = id, status = %existing.status, "terminal record, replaying done");
            self.bus.publish(
                id,
                LogEvent::Done {
                    pdf_url: existing.pdf_url.clone(),
                    synctex_url: existing.synctex_url.clone(),
                    duration_ms: existing.duration_ms.unwrap_or(0),
                },
            );
            return Ok(JobOutcome::Replayed(existing.status));
        }

        info!(target: "texd.runtime", compilation = id, engine = %job.engine, "compilation starting");
        self.records
            .update_compilation(id, CompilationPatch::status(CompileStatus::Compiling))
            .await
            .map_err(|e| transport("persist compiling status", e))?;
        self.bus.publish(
            id,
            LogEvent::Status {
                status: CompileStatus::Compiling,
            },
        );

        // Stage the workspace. Invalid payloads and local I/O failures
        // are terminal errors; the partial tree is already gone when
        // `build` returns.
        let (workspace, stage) = match texd_workspace::build(
            self.workspace_parent.as_deref(),
            &job.payload,
            self.blobs.as_ref(),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.finalize(id, CompileStatus::Error, e.to_string(), elapsed_ms(started), None, None)
                    .await?;
                return Ok(JobOutcome::Completed(CompileStatus::Error));
            }
        };

        // Relay asset warnings to subscribers and keep them in the
        // durable log.
        let log_buffer = Mutex::new(String::new());
        for warning in &stage.warnings {
            self.bus.publish(id, LogEvent::line(warning.clone()));
            append_line(&log_buffer, warning);
        }
        debug!(
            target: "texd.runtime",
            compilation = id,
            fetched = stage.assets_fetched,
            total = stage.assets_total,
            "workspace staged"
        );

        let spec = match SandboxSpec::from_config(
            &self.sandbox_config,
            job.engine,
            &stage.entrypoint,
            workspace.source_dir(),
            workspace.output_dir(),
        ) {
            Ok(spec) => spec,
            Err(e) => {
                let message = e.to_string();
                self.finalize(id, CompileStatus::Error, message, elapsed_ms(started), None, None)
                    .await?;
                cleanup(workspace);
                return Ok(JobOutcome::Completed(CompileStatus::Error));
            }
        };

        let on_line = |line: String| {
            self.bus.publish(id, LogEvent::line(line.clone()));
            append_line(&log_buffer, &line);
        };
        let outcome = match self
            .sandbox
            .execute(&spec, &on_line, self.sandbox_config.deadline(), cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Container never ran (or could not be observed): fatal
                // to the job, not to the worker.
                append_line(&log_buffer, &e.to_string());
                let log = take_buffer(&log_buffer);
                self.finalize(id, CompileStatus::Error, log, elapsed_ms(started), None, None)
                    .await?;
                cleanup(workspace);
                return Ok(JobOutcome::Completed(CompileStatus::Error));
            }
        };

        let status = if outcome.timed_out() {
            self.finalize(
                id,
                CompileStatus::Timeout,
                take_buffer(&log_buffer),
                elapsed_ms(started),
                None,
                None,
            )
            .await?;
            CompileStatus::Timeout
        } else if !outcome.engine_succeeded() {
            self.finalize(
                id,
                CompileStatus::Error,
                take_buffer(&log_buffer),
                elapsed_ms(started),
                None,
                None,
            )
            .await?;
            CompileStatus::Error
        } else {
            match workspace.find_artifact(".pdf") {
                None => {
                    append_line(&log_buffer, "No PDF produced despite engine success");
                    self.finalize(
                        id,
                        CompileStatus::Error,
                        take_buffer(&log_buffer),
                        elapsed_ms(started),
                        None,
                        None,
                    )
                    .await?;
                    CompileStatus::Error
                }
                Some(pdf_path) => {
                    let pdf_url = self.publish_pdf(id, &pdf_path).await?;
                    let synctex_url = self.publish_position_map(id, &workspace, &log_buffer).await?;
                    self.finalize(
                        id,
                        CompileStatus::Success,
                        take_buffer(&log_buffer),
                        elapsed_ms(started),
                        Some(pdf_url),
                        synctex_url,
                    )
                    .await?;
                    CompileStatus::Success
                }
            }
        };

        cleanup(workspace);
        info!(target: "texd.runtime", compilation = id, status = %status, "compilation finished");
        Ok(JobOutcome::Completed(status))
    }

    /// Upload the PDF and mint its signed URL.
    async fn publish_pdf(&self, id: &str, pdf_path: &std::path::Path) -> Result<String, TexdError> {
        let bytes = tokio::fs::read(pdf_path)
            .await
            .map_err(|e| TexdError::new(ErrorCode::Internal, "read produced PDF").with_source(e))?;
        let key = format!("{id}/{ARTIFACT_PDF}");
        self.blobs
            .upload(&key, &bytes, "application/pdf")
            .await
            .map_err(|e| transport("upload PDF artifact", e))?;
        self.blobs
            .sign(&key, self.signed_url_ttl)
            .await
            .map_err(|e| transport("sign PDF artifact", e))
    }

    /// Decompress, validate, upload, and sign the position map.
    ///
    /// Absence or corruption is a warning, never a failure: the
    /// compilation still succeeds with a null position-map URL. Blob
    /// transport faults, in contrast, do escape.
    async fn publish_position_map(
        &self,
        id: &str,
        workspace: &CompileWorkspace,
        log_buffer: &Mutex<String>,
    ) -> Result<Option<String>, TexdError> {
        let Some(gz_path) = workspace.find_artifact(".synctex.gz") else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(&gz_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.position_map_warning(id, log_buffer, &format!("unreadable ({e})"));
                return Ok(None);
            }
        };
        let text = {
            use std::io::Read;
            let mut text = String::new();
            match flate2::read::GzDecoder::new(bytes.as_slice()).read_to_string(&mut text) {
                Ok(_) => text,
                Err(e) => {
                    self.position_map_warning(id, log_buffer, &format!("failed to decompress ({e})"));
                    return Ok(None);
                }
            }
        };
        if let Err(e) = PositionMap::parse(&text) {
            self.position_map_warning(id, log_buffer, &format!("failed to parse ({e})"));
            return Ok(None);
        }

        let key = format!("{id}/{ARTIFACT_SYNCTEX}");
        self.blobs
            .upload(&key, text.as_bytes(), "text/plain; charset=utf-8")
            .await
            .map_err(|e| transport("upload position map", e))?;
        let url = self
            .blobs
            .sign(&key, self.signed_url_ttl)
            .await
            .map_err(|e| transport("sign position map", e))?;
        Ok(Some(url))
    }

    fn position_map_warning(&self, id: &str, log_buffer: &Mutex<String>, detail: &str) {
        let line = format!("Position map warning: {detail}; forward/inverse sync disabled");
        warn!(target: "texd.runtime", compilation = id, detail, "position map unavailable");
        self.bus.publish(id, LogEvent::line(line.clone()));
        append_line(log_buffer, &line);
    }

    /// The single terminal step: persist the terminal patch, and only
    /// then publish `done`.
    async fn finalize(
        &self,
        id: &str,
        status: CompileStatus,
        log: String,
        duration_ms: u64,
        pdf_url: Option<String>,
        synctex_url: Option<String>,
    ) -> Result<(), TexdError> {
        self.records
            .update_compilation(
                id,
                CompilationPatch {
                    status: Some(status),
                    pdf_url: pdf_url.clone(),
                    synctex_url: synctex_url.clone(),
                    log: Some(log),
                    duration_ms: Some(duration_ms),
                },
            )
            .await
            .map_err(|e| transport("persist terminal status", e))?;
        self.bus.publish(
            id,
            LogEvent::Done {
                pdf_url,
                synctex_url,
                duration_ms,
            },
        );
        Ok(())
    }
}

fn transport(context: &str, source: texd_store::StoreError) -> TexdError {
    TexdError::new(ErrorCode::Transport, context.to_string()).with_source(source)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn append_line(buffer: &Mutex<String>, line: &str) {
    let mut buf = buffer.lock().expect("log buffer lock poisoned");
    buf.push_str(line);
    buf.push('\n');
}

fn take_buffer(buffer: &Mutex<String>) -> String {
    std::mem::take(&mut *buffer.lock().expect("log buffer lock poisoned"))
}

fn cleanup(workspace: CompileWorkspace) {
    if let Err(e) = workspace.destroy() {
        warn!(target: "texd.runtime", error = %e, "workspace removal failed");
    }
}
