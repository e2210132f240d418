/// Container Runner - One Ephemeral Container Per Test Run
///
/// **Execution Rules:**
/// 1. The named image must pre-exist (images are built by out-of-scope
///    tooling; a missing image is a per-sample error, never a pull).
/// 2. One fresh container per call: `sh -s` with the script piped over an
///    attached stdin, network disabled, optional memory/CPU limits.
/// 3. Combined stdout + stderr is captured as one text blob. A failing
///    suite (non-zero exit) is tolerated; whatever output was produced is
///    still returned.
/// 4. Hard wall-clock timeout: the run is bounded by tokio::time::timeout;
///    on expiry the container is killed and partial output is kept.
/// 5. Guaranteed cleanup: the container is force-removed on every path via
///    a Drop guard, so cancelled tasks never leak containers.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use passbench_common::config::HarnessConfig;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Raw outcome of one container invocation, before any parsing.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// stdout followed by stderr, as one blob.
    pub output: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// Container cleanup guard - guarantees container removal on drop.
/// This ensures containers are cleaned up even if the owning task is
/// aborted during pool shutdown.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Best-effort cleanup - cannot be async in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

/// Docker-backed harness: runs one materialization + test script per call
/// inside a fresh, isolated, ephemeral container.
pub struct ContainerHarness {
    docker: Docker,
    config: HarnessConfig,
}

impl ContainerHarness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, config })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Pipe `script` into a non-interactive `sh -s` session inside a fresh
    /// container of `image` and capture combined output.
    ///
    /// Non-zero exit is not an error. Timeout kills the container and
    /// returns whatever output was accumulated, flagged `timed_out`.
    pub async fn run_script(&self, image: &str, script: &str) -> Result<RunOutput> {
        let container_name = format!("passbench-{}", uuid::Uuid::new_v4());

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sh".to_string(), "-s".to_string()]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: self.config.memory_limit_bytes(),
                nano_cpus: self.config.nano_cpus(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .with_context(|| format!("Failed to create container from image '{}'", image))?;

        let container_id = container.id.clone();
        // Guard set up immediately after creation: cleanup is guaranteed
        // even when this future is cancelled mid-run.
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .context("Failed to attach to container")?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        let start_time = Instant::now();

        // Shared buffers so partial output survives when the timeout drops
        // the execution future.
        let buffers: Arc<Mutex<(String, String)>> = Arc::new(Mutex::new(Default::default()));
        let task_buffers = Arc::clone(&buffers);

        let execution_future = async {
            // Feed the whole script, then EOF so `sh -s` terminates.
            input
                .write_all(script.as_bytes())
                .await
                .context("Failed to write script to container stdin")?;
            input
                .shutdown()
                .await
                .context("Failed to close container stdin")?;

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        let mut guard =
                            task_buffers.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.0.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        let mut guard =
                            task_buffers.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.1.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container output");
                        break;
                    }
                }
            }

            // Output stream closed; collect the exit code. A non-zero exit
            // surfaces as a wait error in bollard and is tolerated here.
            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => {
                    warn!(container_id = %container_id, error = %e, "Failed to get container exit code");
                    None
                }
                None => None,
            };

            Ok::<Option<i64>, anyhow::Error>(exit_code)
        };

        let timeout_duration = Duration::from_millis(self.config.timeout_ms);
        let mut timed_out = false;

        let exit_code = match tokio::time::timeout(timeout_duration, execution_future).await {
            Ok(Ok(code)) => {
                if let Some(code) = code {
                    if code != 0 {
                        debug!(container_id = %container_id, exit_code = code,
                               "Container exited non-zero (tolerated)");
                    }
                }
                code
            }
            Ok(Err(e)) => {
                // Stream-level failure: keep whatever output we have.
                warn!(container_id = %container_id, error = %e, "Container run failed mid-stream");
                None
            }
            Err(_) => {
                timed_out = true;
                warn!(container_id = %container_id, timeout_ms = self.config.timeout_ms,
                      "Execution timed out - killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                let mut guard = buffers.lock().unwrap_or_else(PoisonError::into_inner);
                guard.1.push_str(&format!(
                    "\n[Execution timed out after {}ms]",
                    self.config.timeout_ms
                ));
                None
            }
        };

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        let (stdout, stderr) = {
            let guard = buffers.lock().unwrap_or_else(PoisonError::into_inner);
            (guard.0.clone(), guard.1.clone())
        };

        // Same combined-blob shape the parsers expect: stdout then stderr.
        Ok(RunOutput {
            output: format!("{}{}", stdout, stderr),
            exit_code,
            timed_out,
            elapsed_ms,
        })
    }
}
