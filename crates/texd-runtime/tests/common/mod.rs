// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures: in-memory stores, a scripted sandbox, and job
//! builders for orchestrator and consumer tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use texd_bus::LogBus;
use texd_config::SandboxConfig;
use texd_runtime::Orchestrator;
use texd_sandbox::{
    CancelToken, ExitDisposition, SandboxError, SandboxExecutor, SandboxOutcome, SandboxSpec,
};
use texd_store::{MemoryBlobStore, MemoryRecordStore};
use texd_types::{
    AssetRef, CompilationRecord, CompileJob, CompileStatus, SourceFile, SourcePayload, TexEngine,
};

/// What the scripted sandbox should do when executed.
#[derive(Debug, Clone)]
pub enum SandboxScript {
    /// Emit `lines`, write `outputs` into the output dir, exit with
    /// `exit_code`.
    Run {
        lines: Vec<String>,
        outputs: Vec<(String, Vec<u8>)>,
        exit_code: i64,
    },
    /// Never finish on its own; honors deadline and cancellation.
    Hang,
    /// Fail before the container starts.
    FailStart,
    /// Panic mid-execution (cleanup-under-panic tests).
    Panic,
}

/// [`SandboxExecutor`] driven by a [`SandboxScript`].
pub struct ScriptedSandbox {
    script: SandboxScript,
    executions: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new(script: SandboxScript) -> Self {
        Self {
            script,
            executions: AtomicUsize::new(0),
        }
    }

    /// How many times `execute` was called.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxExecutor for ScriptedSandbox {
    async fn execute(
        &self,
        spec: &SandboxSpec,
        on_line: &(dyn Fn(String) + Send + Sync),
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            SandboxScript::FailStart => {
                Err(SandboxError::Start("image not found locally".into()))
            }
            SandboxScript::Panic => panic!("injected sandbox panic"),
            SandboxScript::Hang => {
                tokio::select! {
                    biased;
                    () = tokio::time::sleep(deadline) => {}
                    () = cancel.cancelled() => {}
                }
                Ok(SandboxOutcome {
                    exit: ExitDisposition::DeadlineExceeded,
                    wall_time: deadline,
                })
            }
            SandboxScript::Run {
                lines,
                outputs,
                exit_code,
            } => {
                for line in lines {
                    on_line(line.clone());
                }
                for (name, bytes) in outputs {
                    let dest = spec.output_dir.join(name);
                    tokio::fs::write(&dest, bytes)
                        .await
                        .map_err(|e| SandboxError::Runtime(e.to_string()))?;
                }
                Ok(SandboxOutcome {
                    exit: ExitDisposition::Exited(*exit_code),
                    wall_time: Duration::from_millis(5),
                })
            }
        }
    }
}

/// Everything a test needs to run jobs.
pub struct Harness {
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub bus: Arc<LogBus>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub orchestrator: Arc<Orchestrator>,
    pub workspace_parent: tempfile::TempDir,
}

impl Harness {
    pub fn new(script: SandboxScript) -> Self {
        Self::with_deadline(script, Duration::from_secs(30))
    }

    pub fn with_deadline(script: SandboxScript, deadline: Duration) -> Self {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let bus = Arc::new(LogBus::new());
        let sandbox = Arc::new(ScriptedSandbox::new(script));
        let workspace_parent = tempfile::tempdir().expect("create workspace parent");

        let mut sandbox_config = SandboxConfig::default();
        sandbox_config.deadline_secs = deadline.as_secs().max(1);

        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&records) as Arc<dyn texd_store::RecordStore>,
                Arc::clone(&blobs) as Arc<dyn texd_store::BlobStore>,
                Arc::clone(&bus),
                Arc::clone(&sandbox) as Arc<dyn SandboxExecutor>,
                sandbox_config,
                Duration::from_secs(3600),
            )
            .with_workspace_parent(workspace_parent.path()),
        );

        Self {
            records,
            blobs,
            bus,
            sandbox,
            orchestrator,
            workspace_parent,
        }
    }

    /// Insert the queued record row the external enqueuer would create.
    pub fn enqueue_record(&self, id: &str) {
        self.records.insert(CompilationRecord {
            id: id.into(),
            project_id: "p-1".into(),
            triggered_by: Some("tester".into()),
            status: CompileStatus::Queued,
            pdf_url: None,
            synctex_url: None,
            log: None,
            duration_ms: None,
            engine: TexEngine::Pdflatex,
            created_at: Utc::now(),
        });
    }

    /// Leftover workspace directories (must be zero after every job).
    pub fn workspace_count(&self) -> usize {
        std::fs::read_dir(self.workspace_parent.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn simple_job(id: &str) -> CompileJob {
    job_with_payload(
        id,
        SourcePayload {
            files: vec![SourceFile {
                path: "main.tex".into(),
                content: "\\documentclass{article}\\begin{document}Hello\\end{document}".into(),
                is_entrypoint: true,
            }],
            assets: vec![],
        },
    )
}

pub fn job_with_payload(id: &str, payload: SourcePayload) -> CompileJob {
    CompileJob {
        compilation_id: id.into(),
        project_id: "p-1".into(),
        engine: TexEngine::Pdflatex,
        payload,
    }
}

pub fn asset(path: &str, blob_ref: &str) -> AssetRef {
    AssetRef {
        path: path.into(),
        blob_ref: blob_ref.into(),
    }
}

/// A minimal, valid, gzip-wrapped position map.
pub fn synctex_gz() -> Vec<u8> {
    let text = "Input:1:./main.tex\nContent:\n{1\nx1,1:4736286,4736286\nx1,2:4736286,9437184\n}\n";
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap()
}

/// The default success script: engine log, a PDF, and a position map.
pub fn success_script() -> SandboxScript {
    SandboxScript::Run {
        lines: vec![
            "This is pdfTeX, Version 3.141592653".into(),
            "Output written on main.pdf (1 page, 1234 bytes).".into(),
        ],
        outputs: vec![
            ("main.pdf".into(), b"%PDF-1.5 fake".to_vec()),
            ("main.synctex.gz".into(), synctex_gz()),
        ],
        exit_code: 0,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
