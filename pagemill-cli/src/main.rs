use anyhow::Context;
use clap::{Parser, Subcommand};
use pagemill_core::{Command, CommandOutcome, CommandTemplate, PagemillError, PoolStats, TemplateTable};
use pagemill_parser::parse_batchfile;
use pagemill_runner::{available_concurrency, BatchRunner, PoolConfig, ProcessPool};
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{info, warn};

/// Exit code used when interrupted with Ctrl-C
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "pagemill")]
#[command(about = "Run batches of shell commands with bounded concurrency", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a pagemill.toml (defaults to ./pagemill.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of commands running at once
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Print a JSON report instead of a text summary
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run commands read one per line from a file or stdin
    Run {
        /// Command file, or - for stdin
        #[arg(default_value = "-")]
        file: String,

        /// Working directory for every command
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Run a Batchfile
    Batch {
        /// Path to the Batchfile
        batchfile: PathBuf,
    },

    /// Build commands from a template for every matching input and run them
    Apply {
        /// Command template, e.g. "convert {input} -trim {output}"
        #[arg(short, long)]
        template: String,

        /// File extension the template applies to (repeatable)
        #[arg(short, long = "ext", required = true)]
        exts: Vec<String>,

        /// Output directory, created if missing
        #[arg(short, long)]
        out: PathBuf,

        /// Input files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Show how many commands would run at once
    Cores,
}

#[derive(Serialize)]
struct RunReport<'a> {
    stats: PoolStats,
    outcomes: &'a [CommandOutcome],
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PoolConfig::discover(cli.config.as_deref())?;
    if let Some(jobs) = cli.jobs {
        config = config.with_max_concurrency(jobs);
        config.validate()?;
    }
    if cli.json {
        config = config.with_outcomes(true);
    }

    match cli.command {
        Commands::Run { file, dir } => {
            let content = read_input(&file)?;
            let commands = parse_command_lines(&content);
            if let Some(dir) = dir {
                config = config.with_working_dir(dir);
            }
            run_commands(commands, config, cli.json).await?;
        }
        Commands::Batch { batchfile } => {
            let content = fs::read_to_string(&batchfile)
                .with_context(|| format!("Failed to read {}", batchfile.display()))?;
            let batch = parse_batchfile(&content)?;
            let runner = BatchRunner::new(config);

            let report = tokio::select! {
                report = runner.run(&batch) => report?,
                _ = tokio::signal::ctrl_c() => {
                    // dropping the run future drops the pool, which terminates its commands
                    warn!(batch = %batch.name, "Interrupted, terminating running commands");
                    process::exit(EXIT_INTERRUPTED);
                }
            };

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Batch: {} ({} stage(s))", report.batch_name, report.stages);
                print_summary(&report.stats, &report.outcomes);
            }
            exit_on_failure(&report.stats, &report.outcomes);
        }
        Commands::Apply {
            template,
            exts,
            out,
            inputs,
        } => {
            let template = CommandTemplate::new(template)?;
            info!(template = %template.source(), exts = ?exts, "Applying template");
            let mut table = TemplateTable::new();
            for ext in &exts {
                table.insert(ext, template.clone());
            }
            fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create {}", out.display()))?;

            let commands = table.commands_for(&inputs, &out)?;
            if commands.len() < inputs.len() {
                info!(
                    skipped = inputs.len() - commands.len(),
                    "Skipping inputs with no matching extension"
                );
            }
            run_commands(commands, config, cli.json).await?;
        }
        Commands::Cores => {
            println!("Available concurrency: {}", available_concurrency());
            println!("Configured concurrency: {}", config.resolve_concurrency());
        }
    }

    Ok(())
}

async fn run_commands(commands: Vec<Command>, config: PoolConfig, json: bool) -> anyhow::Result<()> {
    let mut pool = ProcessPool::with_config(commands, config)?;
    info!(
        pool_id = %pool.id(),
        pending = pool.pending(),
        max_concurrency = pool.max_concurrency(),
        "Starting run"
    );

    let interrupted = tokio::select! {
        result = run_and_wait(&mut pool) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        warn!(pool_id = %pool.id(), "Interrupted, terminating running commands");
        pool.shutdown().await;
    }

    let stats = pool.stats();
    if json {
        let report = RunReport {
            stats,
            outcomes: pool.outcomes(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&stats, pool.outcomes());
    }

    if interrupted {
        process::exit(EXIT_INTERRUPTED);
    }
    exit_on_failure(&stats, pool.outcomes());
    Ok(())
}

async fn run_and_wait(pool: &mut ProcessPool) -> Result<(), PagemillError> {
    pool.run().await?;
    pool.wait().await;
    Ok(())
}

fn read_input(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read commands from stdin")?;
        Ok(content)
    } else {
        fs::read_to_string(Path::new(file)).with_context(|| format!("Failed to read {}", file))
    }
}

/// One command per line; blank lines and `#` comments are skipped
fn parse_command_lines(content: &str) -> Vec<Command> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Command::new)
        .collect()
}

fn print_summary(stats: &PoolStats, outcomes: &[CommandOutcome]) {
    println!("Launched: {}", stats.launched);
    println!("Finished: {}", stats.finished);
    if stats.spawn_failures > 0 {
        println!("Spawn failures: {}", stats.spawn_failures);
    }
    if stats.cancelled > 0 {
        println!("Cancelled: {}", stats.cancelled);
    }
    println!("Peak concurrency: {}", stats.peak_running);

    let failed: Vec<_> = outcomes.iter().filter(|o| !o.status.success()).collect();
    if !failed.is_empty() {
        println!("\nFailed commands:");
        for outcome in failed {
            println!("  {}", describe_failure(outcome));
        }
    }
}

fn describe_failure(outcome: &CommandOutcome) -> String {
    let status = &outcome.status;
    let reason = match (status.exit_code, status.signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) if status.stopped => format!("stopped by signal {}", signal),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown".to_string(),
    };
    format!(
        "[{}] {} ({}, {} ms)",
        outcome.index,
        outcome.command,
        reason,
        outcome.duration_ms()
    )
}

fn exit_on_failure(stats: &PoolStats, outcomes: &[CommandOutcome]) {
    if stats.spawn_failures > 0 || outcomes.iter().any(|o| !o.status.success()) {
        process::exit(1);
    }
}
