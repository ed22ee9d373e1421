//! Sandboxed code execution and verdicts for a coding-assessment platform.
//!
//! [`Judge`] accepts source code, runs it in disposable containers with
//! time, memory and process limits, and tracks each execution under a
//! token until it reaches a terminal status. [`derive_verdict`] and
//! [`grade`] turn those statuses into per-test verdicts and a score.

pub mod config;
pub mod engine;
pub mod error;
pub mod grading;
pub mod judge;
pub mod metrics;
pub mod plan;
pub mod poller;
pub mod registry;
mod runner;
pub mod verdict;

#[cfg(test)]
mod judge_tests;

pub use config::JudgeConfig;
pub use engine::{ContainerOutcome, ContainerRuntime, ContainerSpec, DockerEngine};
pub use error::{JudgeError, Result};
pub use grading::{grade, GradedTestCase, SubmissionScore};
pub use judge::Judge;
pub use plan::{ExecutionPlan, PlanTable};
pub use poller::PollOptions;
pub use registry::Registry;
pub use verdict::{derive_verdict, outputs_match, verdict_for_code};
