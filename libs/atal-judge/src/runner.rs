/// Isolated Runner - Background Execution of Submitted Code
///
/// **Responsibility:**
/// Take accepted requests off a bounded queue and drive each one to exactly
/// one terminal status:
/// 1. PROCESSING
/// 2. Private working directory with the source (and stdin) written out
/// 3. Optional compile step in its own disposable container
/// 4. Run step in a fresh disposable container under time/pid/memory caps
/// 5. Time adjustment and classification
/// 6. Working directory removed, success or not
/// 7. Terminal status written
///
/// Nothing escapes a worker: runtime failures and even panics inside a job
/// end up as INTERNAL_ERROR records.

use anyhow::Context;
use atal_common::{ExecutionRequest, StatusCode, StatusPatch, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::JudgeConfig;
use crate::engine::{ContainerOutcome, ContainerRuntime, ContainerSpec};
use crate::error::{JudgeError, Result};
use crate::metrics;
use crate::plan::ExecutionPlan;
use crate::registry::Registry;
use crate::verdict::outputs_match;

pub(crate) const STDIN_FILE: &str = "input.txt";

/// Compilers get at least this much memory regardless of the program's limit.
const COMPILE_MEMORY_FLOOR_BYTES: i64 = 512 * 1024 * 1024;

/// Exit codes of the in-container `timeout` wrapper (TERM, then KILL).
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

pub(crate) const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Accepted request waiting for a worker.
pub(crate) struct Job {
    pub token: Token,
    pub request: ExecutionRequest,
    pub plan: ExecutionPlan,
    pub cancel: CancellationToken,
}

/// Terminal status a run ends in.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Transition {
    pub code: StatusCode,
    pub patch: StatusPatch,
}

impl Transition {
    fn new(code: StatusCode, patch: StatusPatch) -> Self {
        Self { code, patch }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_ERROR, StatusPatch::message(message))
    }

    fn cancelled() -> Self {
        Self::internal(CANCELLED_MESSAGE)
    }
}

struct Shared<R> {
    runtime: R,
    registry: Arc<Registry>,
    config: JudgeConfig,
    active: Mutex<HashMap<Token, CancellationToken>>,
}

/// Fixed pool of workers fed by a bounded channel.
pub(crate) struct WorkerPool<R: ContainerRuntime> {
    shared: Arc<Shared<R>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl<R: ContainerRuntime> WorkerPool<R> {
    /// Spawns the workers; must be called inside a tokio runtime.
    pub fn start(runtime: R, registry: Arc<Registry>, config: JudgeConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(Shared {
            runtime,
            registry,
            config,
            active: Mutex::new(HashMap::new()),
        });

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared), Arc::clone(&receiver))))
            .collect();

        info!(workers = worker_count, queue_capacity = capacity, "Worker pool started");
        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            capacity,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender.lock().clone().ok_or(JudgeError::ShuttingDown)
    }

    fn register(&self, job: &Job) {
        self.shared.registry.initialize(job.token);
        self.shared.active.lock().insert(job.token, job.cancel.clone());
        metrics::QUEUE_DEPTH.inc();
    }

    fn forget(&self, token: &Token) {
        self.shared.registry.release(token);
        self.shared.active.lock().remove(token);
        metrics::QUEUE_DEPTH.dec();
    }

    /// Queue `job`, waiting for room if the queue is full.
    pub async fn dispatch(&self, job: Job) -> Result<Token> {
        let sender = self.sender()?;
        let token = job.token;
        self.register(&job);
        if sender.send(job).await.is_err() {
            self.forget(&token);
            return Err(JudgeError::ShuttingDown);
        }
        metrics::SUBMISSIONS_TOTAL.inc();
        debug!(token = %token, "Execution queued");
        Ok(token)
    }

    /// Queue `job` or fail immediately when the queue is full.
    pub fn try_dispatch(&self, job: Job) -> Result<Token> {
        let sender = self.sender()?;
        let token = job.token;
        self.register(&job);
        match sender.try_send(job) {
            Ok(()) => {
                metrics::SUBMISSIONS_TOTAL.inc();
                Ok(token)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.forget(&token);
                Err(JudgeError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.forget(&token);
                Err(JudgeError::ShuttingDown)
            }
        }
    }

    /// Signal a queued or running execution to stop. False when it already finished.
    pub fn cancel(&self, token: &Token) -> bool {
        match self.shared.active.lock().get(token) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop accepting work, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop<R: ContainerRuntime>(
    id: usize,
    shared: Arc<Shared<R>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    debug!(worker = id, "Worker started");
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else { break };
        metrics::QUEUE_DEPTH.dec();
        process_job(&shared, job).await;
    }
    debug!(worker = id, "Worker stopped");
}

async fn process_job<R: ContainerRuntime>(shared: &Arc<Shared<R>>, job: Job) {
    let token = job.token;
    let workdir = shared.config.work_root.join(token.to_string());
    let started = Instant::now();
    metrics::ACTIVE_EXECUTIONS.inc();

    // Own task, so a panic inside the job is observed here instead of
    // taking the worker down.
    let task = tokio::spawn(execute(Arc::clone(shared), job, workdir.clone()));
    let transition = match task.await {
        Ok(transition) => transition,
        Err(e) => {
            error!(token = %token, error = %e, "Execution task failed");
            Transition::internal(format!("execution task failed: {}", e))
        }
    };

    remove_workdir(&workdir).await;

    let description = transition.code.description();
    match shared
        .registry
        .update_status(token, transition.code, description, transition.patch)
    {
        Ok(()) => info!(
            token = %token,
            status = %transition.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        ),
        Err(JudgeError::NotFound(_)) => debug!(token = %token, "Record released before execution finished"),
        Err(e) => warn!(token = %token, error = %e, "Could not record final status"),
    }
    metrics::EXECUTIONS_TOTAL.with_label_values(&[description]).inc();
    metrics::EXECUTION_SECONDS.observe(started.elapsed().as_secs_f64());

    shared.active.lock().remove(&token);
    metrics::ACTIVE_EXECUTIONS.dec();
}

#[instrument(skip_all, fields(token = %job.token, language = %job.request.language))]
async fn execute<R: ContainerRuntime>(shared: Arc<Shared<R>>, job: Job, workdir: PathBuf) -> Transition {
    if job.cancel.is_cancelled() {
        return Transition::cancelled();
    }
    if let Err(e) = shared.registry.update_status(
        job.token,
        StatusCode::PROCESSING,
        StatusCode::PROCESSING.description(),
        StatusPatch::default(),
    ) {
        warn!(error = %e, "Could not mark execution as processing");
    }

    match run_steps(&shared, &job, &workdir).await {
        Ok(transition) => transition,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Execution failed");
            Transition::internal(format!("{:#}", e))
        }
    }
}

async fn run_steps<R: ContainerRuntime>(
    shared: &Shared<R>,
    job: &Job,
    workdir: &Path,
) -> anyhow::Result<Transition> {
    let config = &shared.config;
    let limits = &job.request.limits;
    prepare_workdir(workdir, &job.plan, &job.request).await?;

    if let Some(compile_command) = &job.plan.compile_command {
        debug!(command = %compile_command, "Compiling");
        let spec = ContainerSpec {
            image: job.plan.image.clone(),
            command: compile_command.clone(),
            workdir: workdir.to_path_buf(),
            memory_limit_bytes: limits.memory_limit_bytes().max(COMPILE_MEMORY_FLOOR_BYTES),
            pids_limit: config.pids_limit,
            nano_cpus: config.nano_cpus(),
            file_size_limit_bytes: config.max_file_bytes,
            timeout: config.compile_timeout,
            max_output_bytes: config.max_output_bytes,
        };
        let outcome = shared
            .runtime
            .run(spec, job.cancel.clone())
            .await
            .context("Compilation step failed")?;
        if let Some(transition) = classify_compile(&outcome, config) {
            return Ok(transition);
        }
    }

    // The in-container wrapper allows for the measured start overhead; the
    // orchestrator deadline allows for a cold container start on top.
    let program_timeout = limits.wall_time_limit() + config.container_overhead;
    let command = run_command(&job.plan.run_command, program_timeout, job.request.stdin.is_some());
    debug!(command = %command, "Running");
    let spec = ContainerSpec {
        image: job.plan.image.clone(),
        command,
        workdir: workdir.to_path_buf(),
        memory_limit_bytes: limits.memory_limit_bytes(),
        pids_limit: config.pids_limit,
        nano_cpus: config.nano_cpus(),
        file_size_limit_bytes: config.max_file_bytes,
        timeout: limits.wall_time_limit() + config.startup_buffer,
        max_output_bytes: config.max_output_bytes,
    };
    let outcome = shared
        .runtime
        .run(spec, job.cancel.clone())
        .await
        .context("Run step failed")?;

    Ok(classify_run(&outcome, &job.request, config))
}

async fn prepare_workdir(workdir: &Path, plan: &ExecutionPlan, request: &ExecutionRequest) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(workdir)
        .await
        .with_context(|| format!("Failed to create working directory {}", workdir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(workdir, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to restrict working directory")?;
    }

    tokio::fs::write(workdir.join(&plan.source_filename), &request.source_code)
        .await
        .context("Failed to write source file")?;
    if let Some(stdin) = &request.stdin {
        tokio::fs::write(workdir.join(STDIN_FILE), stdin)
            .await
            .context("Failed to write stdin file")?;
    }
    Ok(())
}

async fn remove_workdir(workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            metrics::CLEANUP_FAILURES_TOTAL.inc();
            warn!(workdir = %workdir.display(), error = %e, "Failed to remove working directory");
        }
    }
}

/// Shell command for the run container.
pub(crate) fn run_command(run: &str, timeout: Duration, has_stdin: bool) -> String {
    let input = if has_stdin { STDIN_FILE } else { "/dev/null" };
    format!("timeout -k 1 {:.3} {} < {}", timeout.as_secs_f64(), run, input)
}

/// Wall time attributable to the program: raw time minus the fixed container
/// overhead, never below `time_epsilon`.
///
/// A heuristic. Start latency varies per host and per run, so this is only
/// good enough for a limit comparison, not a benchmark.
pub(crate) fn adjusted_time(raw: Duration, config: &JudgeConfig) -> Duration {
    raw.saturating_sub(config.container_overhead).max(config.time_epsilon)
}

pub(crate) fn format_seconds(time: Duration) -> String {
    format!("{:.3}", time.as_secs_f64())
}

/// None when compilation succeeded and the run step should follow.
pub(crate) fn classify_compile(outcome: &ContainerOutcome, config: &JudgeConfig) -> Option<Transition> {
    if outcome.cancelled {
        return Some(Transition::cancelled());
    }
    if outcome.timed_out {
        let output = format!(
            "Compilation timed out after {}s",
            format_seconds(config.compile_timeout)
        );
        return Some(Transition::new(
            StatusCode::COMPILATION_ERROR,
            StatusPatch {
                compile_output: Some(output),
                ..Default::default()
            },
        ));
    }
    if outcome.succeeded() {
        return None;
    }
    let mut output = outcome.combined_output();
    if output.trim().is_empty() {
        output = match outcome.exit_code {
            Some(code) => format!("Compiler exited with code {}", code),
            None => "Compiler exited without a status".to_string(),
        };
    }
    Some(Transition::new(
        StatusCode::COMPILATION_ERROR,
        StatusPatch {
            compile_output: Some(output),
            ..Default::default()
        },
    ))
}

/// Terminal status for a finished run step.
pub(crate) fn classify_run(outcome: &ContainerOutcome, request: &ExecutionRequest, config: &JudgeConfig) -> Transition {
    if outcome.cancelled {
        return Transition::cancelled();
    }

    let time = adjusted_time(outcome.elapsed, config);
    let has_stderr = !outcome.stderr.trim().is_empty();
    let mut patch = StatusPatch {
        stdout: Some(outcome.stdout.clone()),
        stderr: has_stderr.then(|| outcome.stderr.clone()),
        time: Some(format_seconds(time)),
        memory: Some(0),
        ..Default::default()
    };

    if outcome.oom_killed {
        patch.message = Some("memory limit exceeded".to_string());
        return Transition::new(StatusCode::RUNTIME_ERROR_OTHER, patch);
    }
    // 124/137 only mean the wrapper fired once its deadline has passed.
    let wrapper_deadline = request.limits.wall_time_limit() + config.container_overhead;
    let killed_by_timeout = outcome.elapsed >= wrapper_deadline
        && outcome
            .exit_code
            .is_some_and(|code| TIMEOUT_EXIT_CODES.contains(&code));
    if outcome.timed_out || killed_by_timeout {
        return Transition::new(StatusCode::TIME_LIMIT_EXCEEDED, patch);
    }

    match outcome.exit_code {
        Some(0) => {}
        Some(code) => {
            let status = match code {
                139 => StatusCode::RUNTIME_ERROR_SIGSEGV,
                153 => StatusCode::RUNTIME_ERROR_SIGXFSZ,
                136 => StatusCode::RUNTIME_ERROR_SIGFPE,
                134 => StatusCode::RUNTIME_ERROR_SIGABRT,
                _ if has_stderr => StatusCode::RUNTIME_ERROR_NZEC,
                _ => {
                    patch.message = Some(format!("process exited with code {} and no diagnostics", code));
                    StatusCode::INTERNAL_ERROR
                }
            };
            return Transition::new(status, patch);
        }
        None => {
            patch.message = Some("container exit status unavailable".to_string());
            return Transition::new(StatusCode::INTERNAL_ERROR, patch);
        }
    }

    if time > request.limits.cpu_time_limit() {
        return Transition::new(StatusCode::TIME_LIMIT_EXCEEDED, patch);
    }

    if let Some(expected) = &request.expected_output {
        if !outputs_match(&outcome.stdout, expected) {
            return Transition::new(StatusCode::WRONG_ANSWER, patch);
        }
    }
    Transition::new(StatusCode::ACCEPTED, patch)
}
