// CLI commands for running and grading code through the judge
use anyhow::{bail, Context, Result};
use atal_common::{
    ExecutionRequest, ExecutionStatus, Language, ProcessedResult, QuestionLimits, ResourceLimits, TestCase,
};
use atal_judge::{derive_verdict, Judge, JudgeConfig, PlanTable, PollOptions};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    status: &'a ExecutionStatus,
    result: &'a ProcessedResult,
}

/// Pick the language from `--language`, or from the file extension.
fn resolve_language(file: &Path, language: Option<&str>) -> Result<Language> {
    if let Some(name) = language {
        return Ok(name.parse()?);
    }
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .with_context(|| format!("Cannot infer language of {}, pass --language", file.display()))?;
    match ext {
        "cc" => Ok(Language::Cpp),
        other => other
            .parse()
            .with_context(|| format!("Unknown extension '.{}', pass --language", other)),
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    let content = read_file(path)?;
    let test_cases: Vec<TestCase> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse test cases in {}", path.display()))?;
    if test_cases.is_empty() {
        bail!("{} contains no test cases", path.display());
    }
    Ok(test_cases)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the execution plan of every supported language
pub fn list_languages() -> Result<()> {
    let config = JudgeConfig::from_env();
    let plans = match &config.languages_file {
        Some(path) => PlanTable::load(path)?,
        None => PlanTable::builtin(),
    };

    println!("{:<8} {:<24} {:<16} {:<40} RUN", "NAME", "IMAGE", "SOURCE", "COMPILE");
    for language in plans.languages() {
        let plan = plans.resolve(language)?;
        println!(
            "{:<8} {:<24} {:<16} {:<40} {}",
            language.as_str(),
            plan.image,
            plan.source_filename,
            plan.compile_command.as_deref().unwrap_or("-"),
            plan.run_command
        );
    }
    Ok(())
}

/// Execute one source file and print its status and verdict
pub async fn run_source(
    file: &Path,
    language: Option<&str>,
    stdin: Option<&Path>,
    expected: Option<&Path>,
    limits: QuestionLimits,
    poll: PollOptions,
) -> Result<()> {
    let language = resolve_language(file, language)?;
    let mut request = ExecutionRequest::new(language, read_file(file)?).with_limits(ResourceLimits::from(limits));
    if let Some(path) = stdin {
        request = request.with_stdin(read_file(path)?);
    }
    if let Some(path) = expected {
        request = request.with_expected_output(read_file(path)?);
    }
    let expected_output = request.expected_output.clone();

    let judge = Judge::from_env()?;
    let token = judge.submit(request).await?;
    info!(token = %token, language = %language, "Submitted");

    let status = judge.wait_for(token, poll).await?;
    let result = derive_verdict(&status, expected_output.as_deref());
    judge.release(&token);
    judge.shutdown().await;

    print_json(&RunReport {
        status: &status,
        result: &result,
    })
}

/// Grade one source file against a test-case file and print the score
pub async fn judge_file(
    file: &Path,
    language: Option<&str>,
    tests: &Path,
    limits: QuestionLimits,
    poll: PollOptions,
) -> Result<()> {
    let language = resolve_language(file, language)?;
    let source = read_file(file)?;
    let test_cases = load_test_cases(tests)?;

    let judge = Judge::from_env()?;
    info!(language = %language, tests = test_cases.len(), "Judging submission");
    let score = judge
        .judge_submission(
            &source,
            language,
            limits,
            &test_cases,
            |progress| {
                info!(
                    completed = progress.completed,
                    total = progress.total,
                    percentage = progress.percentage,
                    "Progress"
                )
            },
            poll,
        )
        .await?;
    judge.shutdown().await;

    print_json(&score)
}
