mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "atal-cli")]
#[command(about = "Atal CLI - Run code in sandboxed containers and grade submissions", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported languages and how each is compiled and run
    Languages,

    /// Run a source file once and print the verdict
    Run {
        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// Language (defaults to the file extension)
        #[arg(short, long)]
        language: Option<String>,

        /// File fed to the program's stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// File holding the expected output
        #[arg(short, long)]
        expected: Option<PathBuf>,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Grade a source file against a JSON array of test cases
    Judge {
        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// Language (defaults to the file extension)
        #[arg(short, long)]
        language: Option<String>,

        /// JSON file: [{"id", "input", "expectedOutput", "weight"}]
        #[arg(short, long)]
        tests: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },
}

#[derive(Args)]
struct LimitArgs {
    /// CPU time limit in milliseconds
    #[arg(long, default_value = "2000")]
    time_limit_ms: u64,

    /// Memory limit in KB
    #[arg(long, default_value = "262144")]
    memory_limit_kb: u64,

    /// Delay between status polls in milliseconds
    #[arg(long, default_value = "250")]
    poll_interval_ms: u64,

    /// Polls before giving up
    #[arg(long, default_value = "240")]
    max_polls: u32,
}

impl LimitArgs {
    fn question_limits(&self) -> atal_common::QuestionLimits {
        atal_common::QuestionLimits {
            time_limit_ms: self.time_limit_ms,
            memory_limit_kb: self.memory_limit_kb,
        }
    }

    fn poll_options(&self) -> atal_judge::PollOptions {
        atal_judge::PollOptions {
            max_attempts: self.max_polls,
            interval: std::time::Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the command's JSON result, logs go to stderr.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Languages => {
            commands::list_languages()?;
        }
        Commands::Run {
            file,
            language,
            stdin,
            expected,
            limits,
        } => {
            commands::run_source(
                &file,
                language.as_deref(),
                stdin.as_deref(),
                expected.as_deref(),
                limits.question_limits(),
                limits.poll_options(),
            )
            .await?;
        }
        Commands::Judge {
            file,
            language,
            tests,
            limits,
        } => {
            commands::judge_file(
                &file,
                language.as_deref(),
                &tests,
                limits.question_limits(),
                limits.poll_options(),
            )
            .await?;
        }
    }

    if cli.print_metrics {
        eprintln!("{}", atal_judge::metrics::gather());
    }
    Ok(())
}
