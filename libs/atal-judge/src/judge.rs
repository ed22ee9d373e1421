/// Judge - Public Entry Point
///
/// **Pipeline:**
/// 1. `submit` validates, records IN_QUEUE and queues the request
/// 2. Workers run it in disposable containers (see `runner`)
/// 3. Callers read statuses directly or poll with `wait_for_batch`
/// 4. `derive_verdict` + `grade` turn terminal statuses into a score
///
/// Submission never blocks on execution: it returns a token as soon as the
/// request is queued.

use atal_common::{
    BatchProgress, ExecutionRequest, ExecutionStatus, Language, ProcessedResult, QuestionLimits,
    ResourceLimits, TestCase, Token,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::JudgeConfig;
use crate::engine::{ContainerRuntime, DockerEngine};
use crate::error::{JudgeError, Result};
use crate::grading::{grade, SubmissionScore};
use crate::plan::PlanTable;
use crate::poller::{self, PollOptions};
use crate::registry::Registry;
use crate::runner::{Job, WorkerPool};
use crate::verdict::derive_verdict;

pub struct Judge<R: ContainerRuntime = DockerEngine> {
    registry: Arc<Registry>,
    plans: PlanTable,
    pool: WorkerPool<R>,
    max_source_bytes: usize,
    cancel_on_poll_timeout: bool,
    sweeper: Option<JoinHandle<()>>,
}

impl Judge<DockerEngine> {
    /// Docker-backed judge configured from `ATAL_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = JudgeConfig::from_env();
        let plans = match &config.languages_file {
            Some(path) => PlanTable::load(path)?,
            None => PlanTable::builtin(),
        };
        let engine = DockerEngine::connect()?;
        Ok(Self::new(engine, plans, config))
    }
}

impl<R: ContainerRuntime> Judge<R> {
    /// Start the workers (and the status sweeper when a TTL is set).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(runtime: R, plans: PlanTable, config: JudgeConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let sweeper = (!config.status_ttl.is_zero())
            .then(|| registry.spawn_sweeper(config.status_ttl, config.sweep_interval));

        info!(
            languages = ?plans.languages(),
            work_root = %config.work_root.display(),
            "Judge ready"
        );
        Self {
            max_source_bytes: config.max_source_bytes,
            cancel_on_poll_timeout: config.cancel_on_poll_timeout,
            pool: WorkerPool::start(runtime, Arc::clone(&registry), config),
            registry,
            plans,
            sweeper,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn languages(&self) -> Vec<Language> {
        self.plans.languages()
    }

    fn prepare(&self, request: ExecutionRequest) -> Result<Job> {
        let size = request.source_code.len();
        if size > self.max_source_bytes {
            return Err(JudgeError::SourceTooLarge {
                size,
                limit: self.max_source_bytes,
            });
        }
        let plan = self
            .plans
            .resolve(request.language)?
            .for_source(&request.source_code);
        Ok(Job {
            token: Uuid::new_v4(),
            request,
            plan,
            cancel: CancellationToken::new(),
        })
    }

    /// Queue one request and return its token. Waits for room when the
    /// queue is full.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Token> {
        let job = self.prepare(request)?;
        self.pool.dispatch(job).await
    }

    /// Like [`Judge::submit`] but fails with `QueueFull` instead of waiting.
    pub fn try_submit(&self, request: ExecutionRequest) -> Result<Token> {
        let job = self.prepare(request)?;
        self.pool.try_dispatch(job)
    }

    /// Queue several requests, tokens in input order.
    ///
    /// `limits`, when given, replaces each request's own limits. Every
    /// request is validated before any is queued, so a bad entry rejects
    /// the whole batch. If queueing fails midway (shutdown), the requests
    /// already queued are cancelled and released.
    pub async fn submit_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        limits: Option<ResourceLimits>,
    ) -> Result<Vec<Token>> {
        let jobs = requests
            .into_iter()
            .map(|mut request| {
                if let Some(limits) = &limits {
                    request.limits = limits.clone();
                }
                self.prepare(request)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tokens = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.pool.dispatch(job).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    // An aborted batch returns no tokens, so withdraw the queued ones.
                    for token in &tokens {
                        self.pool.cancel(token);
                        self.registry.release(token);
                    }
                    warn!(withdrawn = tokens.len(), error = %e, "Batch aborted");
                    return Err(e);
                }
            }
        }
        info!(count = tokens.len(), "Batch queued");
        Ok(tokens)
    }

    pub fn get_status(&self, token: &Token) -> Result<ExecutionStatus> {
        self.registry.get(token)
    }

    pub fn get_batch_status(&self, tokens: &[Token]) -> Result<Vec<ExecutionStatus>> {
        self.registry.get_many(tokens)
    }

    pub async fn wait_for(&self, token: Token, options: PollOptions) -> Result<ExecutionStatus> {
        let mut statuses = self.wait_for_batch(&[token], |_| {}, options).await?;
        statuses.pop().ok_or(JudgeError::NotFound(token))
    }

    /// Poll until all `tokens` are terminal. On timeout the stragglers are
    /// cancelled if `cancel_on_poll_timeout` is set.
    pub async fn wait_for_batch<F>(
        &self,
        tokens: &[Token],
        on_progress: F,
        options: PollOptions,
    ) -> Result<Vec<ExecutionStatus>>
    where
        F: FnMut(&BatchProgress),
    {
        let result = poller::wait_for_batch(&self.registry, tokens, on_progress, options).await;
        if let Err(JudgeError::PollTimeout { pending, .. }) = &result {
            if self.cancel_on_poll_timeout {
                let cancelled = pending.iter().filter(|t| self.pool.cancel(t)).count();
                warn!(cancelled, "Cancelled executions left behind by poll timeout");
            }
        }
        result
    }

    /// Stop a queued or running execution. It ends as INTERNAL_ERROR with
    /// the message "execution cancelled". False when the token is unknown
    /// or already finished.
    pub fn cancel(&self, token: &Token) -> bool {
        self.pool.cancel(token)
    }

    /// Forget a token's record. Returns the last known status.
    pub fn release(&self, token: &Token) -> Option<ExecutionStatus> {
        self.registry.release(token)
    }

    /// Run `source` against every test case and grade the result.
    ///
    /// Each test case becomes one execution with the test's input as stdin.
    /// Records are released once graded.
    pub async fn judge_submission<F>(
        &self,
        source: &str,
        language: Language,
        limits: QuestionLimits,
        test_cases: &[TestCase],
        on_progress: F,
        options: PollOptions,
    ) -> Result<SubmissionScore>
    where
        F: FnMut(&BatchProgress),
    {
        let requests = test_cases
            .iter()
            .map(|tc| {
                ExecutionRequest::new(language, source)
                    .with_stdin(tc.input.clone())
                    .with_expected_output(tc.expected_output.clone())
            })
            .collect();
        let tokens = self.submit_batch(requests, Some(limits.into())).await?;
        let statuses = self.wait_for_batch(&tokens, on_progress, options).await?;

        let results: Vec<ProcessedResult> = statuses
            .iter()
            .zip(test_cases)
            .map(|(status, tc)| derive_verdict(status, Some(&tc.expected_output)))
            .collect();
        for token in &tokens {
            self.registry.release(token);
        }

        let score = grade(test_cases, results);
        info!(
            language = %language,
            score = score.score,
            max_score = score.max_score,
            passed = score.passed,
            total = score.total,
            "Submission judged"
        );
        Ok(score)
    }

    /// Stop accepting submissions and wait for queued work to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down judge");
        self.pool.shutdown().await;
    }
}

impl<R: ContainerRuntime> Drop for Judge<R> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
