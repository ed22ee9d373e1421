/// Container Engine - Disposable Containers for Compile and Run Steps
///
/// **Core Responsibility:**
/// Start one short-lived container per step with the token's working
/// directory mounted, wait for it under a hard timeout, and report raw
/// telemetry (output, exit code, elapsed time).
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to run a command in isolation
/// - Engine does NOT know status codes or verdicts
/// - The runner turns a [`ContainerOutcome`] into a status
///
/// Every container is created fresh: no network, capped process count,
/// capped memory, CPU and file size, and force-removed afterwards, success or not.

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::ResourcesUlimits;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the working directory appears inside the container.
pub const SANDBOX_MOUNT: &str = "/sandbox";

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// DAC_OVERRIDE stays: the mounted working directory belongs to the host user.
const DROPPED_CAPABILITIES: [&str; 7] = [
    "NET_RAW",
    "NET_BIND_SERVICE",
    "MKNOD",
    "SYS_CHROOT",
    "SETFCAP",
    "AUDIT_WRITE",
    "KILL",
];

/// One container invocation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// Passed to `sh -c` with [`SANDBOX_MOUNT`] as working directory.
    pub command: String,
    pub workdir: PathBuf,
    pub memory_limit_bytes: i64,
    pub pids_limit: i64,
    /// CPU quota in units of 1e-9 cores.
    pub nano_cpus: i64,
    /// RLIMIT_FSIZE for every process in the container.
    pub file_size_limit_bytes: i64,
    /// Orchestrator-side kill deadline, counted from container start.
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Raw telemetry for one container invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Killed by the orchestrator after `timeout`.
    pub timed_out: bool,
    pub oom_killed: bool,
    pub cancelled: bool,
    /// Monotonic time from container start until it stopped.
    pub elapsed: Duration,
}

impl ContainerOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// stdout and stderr joined, the way a compiler's diagnostics are shown.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Isolation backend. Production uses [`DockerEngine`].
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Run `spec` to completion, timeout, or cancellation.
    ///
    /// Resource-limit outcomes are reported in the returned value; `Err`
    /// means the runtime itself failed.
    fn run(
        &self,
        spec: ContainerSpec,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ContainerOutcome>> + Send;
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Drop cannot be async; removal runs as a detached task.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Docker-backed [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), spec.command.clone()]),
            entrypoint: Some(vec![]),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{}", spec.workdir.display(), SANDBOX_MOUNT)]),
                network_mode: Some("none".to_string()),
                memory: Some(spec.memory_limit_bytes),
                memory_swap: Some(spec.memory_limit_bytes),
                pids_limit: Some(spec.pids_limit),
                nano_cpus: Some(spec.nano_cpus),
                ulimits: Some(vec![ResourcesUlimits {
                    name: Some("fsize".to_string()),
                    soft: Some(spec.file_size_limit_bytes),
                    hard: Some(spec.file_size_limit_bytes),
                }]),
                cap_drop: Some(DROPPED_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<Option<i64>> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(e).context("Failed waiting for container"),
            None => Ok(None),
        }
    }

    async fn collect_logs(&self, container_id: &str, max_bytes: usize) -> (String, String) {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });
        let mut stdout = CappedBuffer::new(max_bytes);
        let mut stderr = CappedBuffer::new(max_bytes);

        let mut logs_stream = self.docker.logs(container_id, logs_options);
        while let Some(output) = logs_stream.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }
        (stdout.finish(), stderr.finish())
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id, error = %e, "Failed to kill container");
        }
    }
}

impl ContainerRuntime for DockerEngine {
    async fn run(&self, spec: ContainerSpec, cancel: CancellationToken) -> Result<ContainerOutcome> {
        self.ensure_image(&spec.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", spec.image))?;

        let container_name = format!("atal-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(&spec))
            .await
            .context("Failed to create Docker container")?;
        let container_id = container.id;

        // Set up the guard before anything else can fail.
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let mut outcome = ContainerOutcome::default();
        tokio::select! {
            waited = tokio::time::timeout(spec.timeout, self.wait_for_exit(&container_id)) => {
                match waited {
                    Ok(exit) => outcome.exit_code = exit?,
                    Err(_) => {
                        warn!(container_id = %container_id, timeout_ms = spec.timeout.as_millis() as u64, "Container timed out, killing");
                        outcome.timed_out = true;
                        self.kill(&container_id).await;
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!(container_id = %container_id, "Execution cancelled, killing container");
                outcome.cancelled = true;
                self.kill(&container_id).await;
            }
        }
        outcome.elapsed = start_time.elapsed();

        let (stdout, stderr) = self.collect_logs(&container_id, spec.max_output_bytes).await;
        outcome.stdout = stdout;
        outcome.stderr = stderr;

        if let Ok(inspect) = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
        {
            outcome.oom_killed = inspect
                .state
                .and_then(|s| s.oom_killed)
                .unwrap_or(false);
        }

        debug!(
            container_id = %container_id,
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            timed_out = outcome.timed_out,
            oom_killed = outcome.oom_killed,
            "Container finished"
        );
        Ok(outcome)
    }
}

/// Accumulates log frames up to a byte cap.
struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capped_buffer_truncates() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        buf.push(b"defg");
        assert_eq!(buf.finish(), format!("abcde{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_capped_buffer_under_limit() {
        let mut buf = CappedBuffer::new(64);
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.finish(), "hello world");
    }

    #[test]
    fn test_combined_output() {
        let outcome = ContainerOutcome {
            stdout: "note: x\n".to_string(),
            stderr: "error: y\n".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.combined_output(), "note: x\nerror: y\n");

        let only_err = ContainerOutcome {
            stderr: "Main.java:3: error".to_string(),
            ..Default::default()
        };
        assert_eq!(only_err.combined_output(), "Main.java:3: error");
    }

    #[test]
    fn test_container_config_is_isolated() {
        let spec = ContainerSpec {
            image: "python:3.11-slim".to_string(),
            command: "python3 main.py".to_string(),
            workdir: PathBuf::from("/tmp/atal/abc"),
            memory_limit_bytes: 64 * 1024 * 1024,
            pids_limit: 32,
            nano_cpus: 500_000_000,
            file_size_limit_bytes: 1024 * 1024,
            timeout: Duration::from_secs(3),
            max_output_bytes: 1024,
        };
        let config = DockerEngine::container_config(&spec);
        assert_eq!(config.network_disabled, Some(true));
        let host = config.host_config.unwrap();
        assert_eq!(host.pids_limit, Some(32));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(
            host.ulimits.unwrap(),
            vec![ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(1024 * 1024),
                hard: Some(1024 * 1024),
            }]
        );
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.cap_drop.unwrap().contains(&"NET_RAW".to_string()));
        assert_eq!(host.binds.unwrap(), vec!["/tmp/atal/abc:/sandbox".to_string()]);
        assert_eq!(
            config.cmd.unwrap(),
            vec!["sh".to_string(), "-c".to_string(), "python3 main.py".to_string()]
        );
    }

    #[test]
    fn test_outcome_succeeded() {
        let ok = ContainerOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());
        let timed_out = ContainerOutcome {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.succeeded());
    }
}
