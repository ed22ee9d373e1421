/// End-to-end tests of the judge pipeline against a scripted runtime
///
/// These tests verify, without Docker:
/// 1. Files land in the working directory and commands are built correctly
/// 2. Compile and run outcomes become the right terminal status
/// 3. Runtime failures and panics end as INTERNAL_ERROR
/// 4. Cancellation, backpressure and shutdown behave
/// 5. Working directories are removed afterwards

#[cfg(test)]
mod scripted_runtime_tests {
    use crate::config::JudgeConfig;
    use crate::engine::{ContainerOutcome, ContainerRuntime, ContainerSpec};
    use crate::error::JudgeError;
    use crate::judge::Judge;
    use crate::plan::PlanTable;
    use crate::poller::PollOptions;
    use crate::verdict::derive_verdict;
    use atal_common::{
        ExecutionRequest, ExecutionStatus, Language, QuestionLimits, StatusCode, TestCase, Token,
        Verdict,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// What the scripted runtime does for one container.
    enum Step {
        Exit {
            code: i64,
            stdout: &'static str,
            stderr: &'static str,
            elapsed_ms: u64,
        },
        Fail(&'static str),
        Panic,
        UntilCancelled,
    }

    fn exit(code: i64, stdout: &'static str, stderr: &'static str, elapsed_ms: u64) -> Step {
        Step::Exit {
            code,
            stdout,
            stderr,
            elapsed_ms,
        }
    }

    #[derive(Debug, Clone)]
    struct Call {
        image: String,
        command: String,
        memory_limit_bytes: i64,
        nano_cpus: i64,
        file_size_limit_bytes: i64,
        timeout: Duration,
        files: Vec<String>,
    }

    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Call>>,
    }

    #[derive(Clone, Default)]
    struct ScriptedRuntime {
        script: Arc<Script>,
    }

    impl ScriptedRuntime {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            let runtime = Self::default();
            runtime.script.steps.lock().extend(steps);
            runtime
        }

        fn calls(&self) -> Vec<Call> {
            self.script.calls.lock().clone()
        }
    }

    impl ContainerRuntime for ScriptedRuntime {
        async fn run(&self, spec: ContainerSpec, cancel: CancellationToken) -> anyhow::Result<ContainerOutcome> {
            let mut files: Vec<String> = std::fs::read_dir(&spec.workdir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            files.sort();
            self.script.calls.lock().push(Call {
                image: spec.image.clone(),
                command: spec.command.clone(),
                memory_limit_bytes: spec.memory_limit_bytes,
                nano_cpus: spec.nano_cpus,
                file_size_limit_bytes: spec.file_size_limit_bytes,
                timeout: spec.timeout,
                files,
            });

            let step = self.script.steps.lock().pop_front();
            match step.unwrap_or_else(|| exit(0, "", "", 600)) {
                Step::Exit {
                    code,
                    stdout,
                    stderr,
                    elapsed_ms,
                } => Ok(ContainerOutcome {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code: Some(code),
                    elapsed: Duration::from_millis(elapsed_ms),
                    ..Default::default()
                }),
                Step::Fail(message) => Err(anyhow::anyhow!(message)),
                Step::Panic => panic!("scripted runtime panic"),
                Step::UntilCancelled => {
                    cancel.cancelled().await;
                    Ok(ContainerOutcome {
                        cancelled: true,
                        ..Default::default()
                    })
                }
            }
        }
    }

    fn test_config(workers: usize, queue_capacity: usize) -> JudgeConfig {
        JudgeConfig {
            work_root: std::env::temp_dir().join(format!("atal-test-{}", Uuid::new_v4())),
            workers,
            queue_capacity,
            status_ttl: Duration::ZERO,
            ..Default::default()
        }
    }

    fn patient() -> PollOptions {
        PollOptions {
            max_attempts: 300,
            interval: Duration::from_millis(10),
        }
    }

    async fn wait_until_processing(judge: &Judge<ScriptedRuntime>, token: Token) {
        for _ in 0..300 {
            if judge.get_status(&token).unwrap().status_code == StatusCode::PROCESSING {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("token {} never started processing", token);
    }

    fn assert_cancelled(status: &ExecutionStatus) {
        assert_eq!(status.status_code, StatusCode::INTERNAL_ERROR);
        assert_eq!(status.message.as_deref(), Some("execution cancelled"));
    }

    /// Test: Python run with stdin is accepted and its working directory removed
    #[tokio::test]
    async fn test_python_accepted() {
        let runtime = ScriptedRuntime::new([exit(0, "2\n", "", 600)]);
        let config = test_config(1, 4);
        let judge = Judge::new(runtime.clone(), PlanTable::builtin(), config.clone());

        let request = ExecutionRequest::new(Language::Python, "a, b = map(int, input().split())\nprint(a + b)")
            .with_stdin("1 1")
            .with_expected_output("2");
        let token = judge.submit(request).await.unwrap();
        let status = judge.wait_for(token, patient()).await.unwrap();

        assert_eq!(status.status_code, StatusCode::ACCEPTED);
        assert_eq!(status.status_description, "Accepted");
        assert_eq!(status.stdout.as_deref(), Some("2\n"));
        assert_eq!(status.time.as_deref(), Some("0.100"));

        let calls = runtime.calls();
        assert_eq!(calls.len(), 1, "Python needs no compile step");
        assert_eq!(calls[0].image, "python:3.11-slim");
        assert_eq!(calls[0].command, "timeout -k 1 2.500 python3 -u main.py < input.txt");
        assert_eq!(calls[0].files, vec!["input.txt".to_string(), "main.py".to_string()]);
        assert_eq!(calls[0].timeout, Duration::from_secs(7));
        assert_eq!(calls[0].memory_limit_bytes, 256 * 1024 * 1024);
        assert_eq!(calls[0].nano_cpus, 1_000_000_000);
        assert_eq!(calls[0].file_size_limit_bytes, 64 * 1024 * 1024);

        assert!(!config.work_root.join(token.to_string()).exists());
        assert!(derive_verdict(&status, Some("2")).passed);
    }

    /// Test: Java compilation failure stops before the run step
    #[tokio::test]
    async fn test_java_compilation_error() {
        let runtime = ScriptedRuntime::new([exit(1, "", "Solution.java:3: error: ';' expected", 2000)]);
        let judge = Judge::new(runtime.clone(), PlanTable::builtin(), test_config(1, 4));

        let source = "public class Solution {\n    public static void main(String[] a) {\n        System.out.println(\"x\")\n    }\n}\n";
        let token = judge
            .submit(ExecutionRequest::new(Language::Java, source))
            .await
            .unwrap();
        let status = judge.wait_for(token, patient()).await.unwrap();

        assert_eq!(status.status_code, StatusCode::COMPILATION_ERROR);
        assert!(status.compile_output.as_deref().unwrap().contains("';' expected"));
        assert_eq!(status.stdout, None);

        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "javac -encoding UTF-8 Solution.java");
        assert_eq!(calls[0].files, vec!["Solution.java".to_string()]);
        assert_eq!(calls[0].memory_limit_bytes, 512 * 1024 * 1024);

        let result = derive_verdict(&status, None);
        assert_eq!(result.verdict, Verdict::CompilationError);
        assert!(result.error_message.unwrap().contains("error"));
    }

    /// Test: Java compile then run in separate containers
    #[tokio::test]
    async fn test_java_compile_then_run() {
        let runtime = ScriptedRuntime::new([exit(0, "", "", 2500), exit(0, "hi\n", "", 900)]);
        let judge = Judge::new(runtime.clone(), PlanTable::builtin(), test_config(1, 4));

        let source = "public class Solution { public static void main(String[] a) { System.out.println(\"hi\"); } }";
        let token = judge
            .submit(ExecutionRequest::new(Language::Java, source).with_expected_output("hi"))
            .await
            .unwrap();
        let status = judge.wait_for(token, patient()).await.unwrap();

        assert_eq!(status.status_code, StatusCode::ACCEPTED);
        assert_eq!(status.time.as_deref(), Some("0.400"));
        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].command, "timeout -k 1 2.500 java -Xss64m -cp . Solution < /dev/null");
        // Both steps run under the same CPU and file size quotas.
        assert!(calls.iter().all(|c| c.nano_cpus == 1_000_000_000));
        assert!(calls.iter().all(|c| c.file_size_limit_bytes == 64 * 1024 * 1024));
    }

    /// Test: Non-zero exit with a traceback is a runtime error
    #[tokio::test]
    async fn test_runtime_error() {
        let runtime = ScriptedRuntime::new([exit(1, "", "ZeroDivisionError: division by zero", 700)]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 4));

        let token = judge
            .submit(ExecutionRequest::new(Language::Python, "print(1 // 0)"))
            .await
            .unwrap();
        let status = judge.wait_for(token, patient()).await.unwrap();

        assert_eq!(status.status_code, StatusCode::RUNTIME_ERROR_NZEC);
        assert_eq!(status.status_description, "Runtime Error (NZEC)");
        assert_eq!(derive_verdict(&status, None).verdict, Verdict::RuntimeError);
    }

    /// Test: Runtime failures and panics become INTERNAL_ERROR, workers survive
    #[tokio::test]
    async fn test_infrastructure_failures_are_contained() {
        let runtime = ScriptedRuntime::new([
            Step::Fail("docker daemon unreachable"),
            Step::Panic,
            exit(0, "ok\n", "", 600),
        ]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 4));

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let request = ExecutionRequest::new(Language::Python, "print('ok')");
            tokens.push(judge.submit(request).await.unwrap());
        }
        let statuses = judge
            .wait_for_batch(&tokens, |_| {}, patient())
            .await
            .unwrap();

        assert_eq!(statuses[0].status_code, StatusCode::INTERNAL_ERROR);
        assert!(statuses[0].message.as_deref().unwrap().contains("docker daemon unreachable"));
        assert_eq!(statuses[1].status_code, StatusCode::INTERNAL_ERROR);
        assert!(statuses[1].message.as_deref().unwrap().contains("execution task failed"));
        assert_eq!(statuses[2].status_code, StatusCode::ACCEPTED);
    }

    /// Test: Cancelling a running execution
    #[tokio::test]
    async fn test_cancel_running() {
        let runtime = ScriptedRuntime::new([Step::UntilCancelled]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 4));

        let token = judge
            .submit(ExecutionRequest::new(Language::Python, "while True: pass"))
            .await
            .unwrap();
        wait_until_processing(&judge, token).await;

        assert!(judge.cancel(&token));
        let status = judge.wait_for(token, patient()).await.unwrap();
        assert_cancelled(&status);

        // Terminal and unknown tokens cannot be cancelled.
        assert!(!judge.cancel(&token));
        assert!(!judge.cancel(&Uuid::new_v4()));
    }

    /// Test: Oversized source is rejected before anything is recorded
    #[tokio::test]
    async fn test_source_too_large() {
        let config = JudgeConfig {
            max_source_bytes: 8,
            ..test_config(1, 4)
        };
        let judge = Judge::new(ScriptedRuntime::default(), PlanTable::builtin(), config);

        let err = judge
            .submit(ExecutionRequest::new(Language::Python, "print('too long')"))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::SourceTooLarge { size: 17, limit: 8 }));
        assert!(judge.registry().is_empty());

        // One bad request rejects the whole batch.
        let batch = vec![
            ExecutionRequest::new(Language::Python, "print(1)"),
            ExecutionRequest::new(Language::Python, "print('too long')"),
        ];
        assert!(judge.submit_batch(batch, None).await.is_err());
        assert!(judge.registry().is_empty());
    }

    /// Test: try_submit reports a full queue instead of waiting
    #[tokio::test]
    async fn test_queue_full() {
        let runtime = ScriptedRuntime::new([Step::UntilCancelled, Step::UntilCancelled]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 1));
        let request = || ExecutionRequest::new(Language::Python, "input()");

        let running = judge.try_submit(request()).unwrap();
        wait_until_processing(&judge, running).await;
        let queued = judge.try_submit(request()).unwrap();

        let err = judge.try_submit(request()).unwrap_err();
        assert!(matches!(err, JudgeError::QueueFull { capacity: 1 }));
        assert_eq!(judge.registry().len(), 2);

        // A queued execution can be cancelled before it starts.
        assert!(judge.cancel(&queued));
        assert!(judge.cancel(&running));
        let statuses = judge
            .wait_for_batch(&[running, queued], |_| {}, patient())
            .await
            .unwrap();
        statuses.iter().for_each(assert_cancelled);
    }

    /// Test: Grading a submission against weighted test cases
    #[tokio::test]
    async fn test_judge_submission() {
        let runtime = ScriptedRuntime::new([
            exit(0, "10\n", "", 600),
            exit(0, "21\n", "", 600),
            exit(0, "30\n", "", 600),
        ]);
        let judge = Judge::new(runtime.clone(), PlanTable::builtin(), test_config(1, 8));

        let test_cases: Vec<TestCase> = [(1, "5", "10"), (2, "10", "20"), (3, "15", "30")]
            .into_iter()
            .map(|(id, input, expected)| TestCase {
                id,
                input: input.to_string(),
                expected_output: expected.to_string(),
                weight: 10,
            })
            .collect();
        let limits = QuestionLimits {
            time_limit_ms: 1000,
            memory_limit_kb: 65536,
        };

        let mut last_percentage = 0;
        let score = judge
            .judge_submission(
                "print(int(input()) * 2)",
                Language::Python,
                limits,
                &test_cases,
                |p| last_percentage = p.percentage,
                patient(),
            )
            .await
            .unwrap();

        assert_eq!(score.score, 20);
        assert_eq!(score.max_score, 30);
        assert_eq!(score.passed, 2);
        assert_eq!(score.first_failure(), Some(Verdict::WrongAnswer));
        assert_eq!(score.results[1].test_case_id, 2);
        assert_eq!(last_percentage, 100);

        let calls = runtime.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.command.starts_with("timeout -k 1 1.500 ")));
        assert!(calls.iter().all(|c| c.memory_limit_bytes == 64 * 1024 * 1024));
        assert!(judge.registry().is_empty(), "graded records are released");
    }

    /// Test: Poll timeout cancels the stragglers
    #[tokio::test]
    async fn test_poll_timeout_cancels_pending() {
        let runtime = ScriptedRuntime::new([Step::UntilCancelled]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 4));

        let token = judge
            .submit(ExecutionRequest::new(Language::Python, "while True: pass"))
            .await
            .unwrap();
        let impatient = PollOptions {
            max_attempts: 3,
            interval: Duration::from_millis(10),
        };
        let err = judge
            .wait_for_batch(&[token], |_| {}, impatient)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::PollTimeout { ref pending, .. } if pending == &vec![token]));

        let status = judge.wait_for(token, patient()).await.unwrap();
        assert_cancelled(&status);
    }

    /// Test: Without cancel-on-timeout, the execution outlives the poll timeout
    #[tokio::test]
    async fn test_poll_timeout_keeps_running_when_not_cancelling() {
        let runtime = ScriptedRuntime::new([Step::UntilCancelled]);
        let config = JudgeConfig {
            cancel_on_poll_timeout: false,
            ..test_config(1, 4)
        };
        let judge = Judge::new(runtime, PlanTable::builtin(), config);

        let token = judge
            .submit(ExecutionRequest::new(Language::Python, "while True: pass"))
            .await
            .unwrap();
        wait_until_processing(&judge, token).await;
        let impatient = PollOptions {
            max_attempts: 3,
            interval: Duration::from_millis(10),
        };
        let err = judge
            .wait_for_batch(&[token], |_| {}, impatient)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::PollTimeout { .. }));

        // Give a wrongly issued cancel time to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(judge.get_status(&token).unwrap().status_code, StatusCode::PROCESSING);

        assert!(judge.cancel(&token));
        let status = judge.wait_for(token, patient()).await.unwrap();
        assert_cancelled(&status);
    }

    /// Test: A batch cut short by shutdown withdraws what it already queued
    #[tokio::test]
    async fn test_batch_interrupted_by_shutdown() {
        let runtime = ScriptedRuntime::new([Step::UntilCancelled]);
        let judge = Judge::new(runtime, PlanTable::builtin(), test_config(1, 1));

        let running = judge
            .submit(ExecutionRequest::new(Language::Python, "input()"))
            .await
            .unwrap();
        wait_until_processing(&judge, running).await;

        // The first request takes the only queue slot, the second waits for
        // room, and the third finds the judge shut down.
        let batch = (0..3)
            .map(|i| ExecutionRequest::new(Language::Python, format!("print({})", i)))
            .collect();
        let (result, _) = tokio::join!(judge.submit_batch(batch, None), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::join!(judge.shutdown(), async {
                tokio::task::yield_now().await;
                assert!(judge.cancel(&running));
            });
        });

        assert!(matches!(result, Err(JudgeError::ShuttingDown)));
        assert_eq!(judge.registry().len(), 1, "only the standalone submission is left");
        assert_cancelled(&judge.get_status(&running).unwrap());
    }

    /// Test: Shutdown drains queued work, then rejects new submissions
    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let judge = Judge::new(ScriptedRuntime::default(), PlanTable::builtin(), test_config(1, 4));

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let request = ExecutionRequest::new(Language::Python, "pass");
            tokens.push(judge.submit(request).await.unwrap());
        }
        judge.shutdown().await;

        for status in judge.get_batch_status(&tokens).unwrap() {
            assert!(status.is_terminal(), "{} left unfinished", status.token);
        }
        let err = judge
            .submit(ExecutionRequest::new(Language::Python, "pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::ShuttingDown));
    }
}
