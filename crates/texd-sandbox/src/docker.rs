// SPDX-License-Identifier: MIT OR Apache-2.0
//! Docker-backed [`SandboxExecutor`] using the Engine API via bollard.
//!
//! Hardening applied to every build container: read-only root filesystem
//! with the workspace's `source/` and `output/` bind-mounted read-write at
//! fixed paths, networking disabled, all capabilities dropped, no
//! privilege escalation, and memory / CPU / pid caps from the sandbox
//! config. The only other writable path is a small memory-backed tmpfs at
//! `/tmp` for the engine's scratch files.

use crate::cancel::CancelToken;
use crate::frame::LineAssembler;
use crate::{
    ExitDisposition, MOUNT_OUTPUT, MOUNT_SOURCE, SandboxError, SandboxExecutor, SandboxOutcome,
    SandboxSpec,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// [`SandboxExecutor`] backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    docker: Docker,
}

impl DockerExecutor {
    /// Connect with the platform defaults and verify the daemon answers.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Start`] when the daemon is unreachable.
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Start(format!("connect to docker: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Start(format!("docker not available: {e}")))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client (tests, custom endpoints).
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn remove_quietly(&self, id: &str) {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(opts)).await {
            warn!(target: "texd.sandbox", container = %short_id(id), error = %e, "container removal failed");
        } else {
            debug!(target: "texd.sandbox", container = %short_id(id), "container removed");
        }
    }

    async fn run_to_completion(
        &self,
        id: &str,
        on_line: &(dyn Fn(String) + Send + Sync),
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        // Attach before starting so no early output is lost.
        let attach_opts = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let mut attached = self
            .docker
            .attach_container(id, Some(attach_opts))
            .await
            .map_err(|e| SandboxError::Start(format!("attach container: {e}")))?;

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start(format!("start container: {e}")))?;

        let started = Instant::now();
        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        let mut assembler = LineAssembler::new();
        let mut deadline_hit = false;
        loop {
            tokio::select! {
                // Deterministic tie-break: when the deadline and another
                // branch are both ready, the deadline wins. Cancellation
                // (worker shutdown grace expired) is handled the same way.
                biased;
                () = &mut deadline_sleep => {
                    deadline_hit = true;
                    break;
                }
                () = cancel.cancelled() => {
                    deadline_hit = true;
                    break;
                }
                chunk = attached.output.next() => match chunk {
                    Some(Ok(output)) => {
                        for line in assembler.push(&output.into_bytes()) {
                            on_line(line);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(target: "texd.sandbox", container = %short_id(id), error = %e, "output stream error");
                        break;
                    }
                    None => break,
                },
            }
        }
        if let Some(rest) = assembler.finish() {
            on_line(rest);
        }

        if deadline_hit {
            info!(target: "texd.sandbox", container = %short_id(id), "deadline expired, killing container");
            if let Err(e) = self
                .docker
                .kill_container(id, None::<KillContainerOptions<String>>)
                .await
            {
                debug!(target: "texd.sandbox", container = %short_id(id), error = %e, "kill after deadline failed");
            }
            return Ok(SandboxOutcome {
                exit: ExitDisposition::DeadlineExceeded,
                wall_time: started.elapsed(),
            });
        }

        // Output stream closed on its own; collect the exit code within
        // whatever deadline budget remains.
        let remaining = deadline.saturating_sub(started.elapsed());
        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        // None = deadline or cancellation; Some(item) = wait stream item.
        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = tokio::time::timeout(remaining, wait.next()) => res.ok(),
        };
        let code = match waited {
            None => {
                info!(target: "texd.sandbox", container = %short_id(id), "deadline expired waiting for exit");
                if let Err(e) = self
                    .docker
                    .kill_container(id, None::<KillContainerOptions<String>>)
                    .await
                {
                    debug!(target: "texd.sandbox", container = %short_id(id), error = %e, "kill after deadline failed");
                }
                return Ok(SandboxOutcome {
                    exit: ExitDisposition::DeadlineExceeded,
                    wall_time: started.elapsed(),
                });
            }
            Some(Some(Ok(response))) => response.status_code,
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Some(Some(Err(e))) => {
                return Err(SandboxError::Runtime(format!("wait container: {e}")));
            }
            Some(None) => {
                return Err(SandboxError::Runtime("wait stream ended without a status".into()));
            }
        };

        Ok(SandboxOutcome {
            exit: ExitDisposition::Exited(code),
            wall_time: started.elapsed(),
        })
    }
}

#[async_trait]
impl SandboxExecutor for DockerExecutor {
    async fn execute(
        &self,
        spec: &SandboxSpec,
        on_line: &(dyn Fn(String) + Send + Sync),
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let name = format!("texd-{}", uuid::Uuid::new_v4().as_simple());
        let create_opts = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(create_opts), container_config(spec))
            .await
            .map_err(|e| SandboxError::Start(format!("create container: {e}")))?;
        let id = response.id;
        info!(
            target: "texd.sandbox",
            container = %short_id(&id),
            image = %spec.image,
            entrypoint = %spec.entrypoint,
            "sandbox created"
        );

        let result = self.run_to_completion(&id, on_line, deadline, cancel).await;
        // Unconditional teardown; force-remove also reaps a still-running
        // container after a failed kill.
        self.remove_quietly(&id).await;
        result
    }
}

fn container_config(spec: &SandboxSpec) -> ContainerConfig<String> {
    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(vec![spec.entrypoint.clone()]),
        working_dir: Some(MOUNT_SOURCE.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config(spec)),
        ..Default::default()
    }
}

fn host_config(spec: &SandboxSpec) -> HostConfig {
    let binds = vec![
        format!("{}:{}:rw", spec.source_dir.display(), MOUNT_SOURCE),
        format!("{}:{}:rw", spec.output_dir.display(), MOUNT_OUTPUT),
    ];
    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,size={}m", spec.tmpfs_mib),
    );
    HostConfig {
        binds: Some(binds),
        memory: Some((spec.memory_mib * 1024 * 1024) as i64),
        nano_cpus: Some((spec.cpus * 1e9) as i64),
        pids_limit: Some(spec.pids_limit),
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        tmpfs: Some(tmpfs),
        ..Default::default()
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
