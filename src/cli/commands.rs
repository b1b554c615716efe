//! CLI command definitions for judge-forge.
//!
//! `run` executes suites through the orchestrator; every other command reads
//! (or, for `override`, appends to) the ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{HarnessConfig, DEFAULT_CONFIG_FILE, DEFAULT_OUTPUT_DIR};
use crate::ledger::{self, aggregate, Ledger, LedgerBackend, LedgerEntry, SuiteNode};
use crate::orchestrator::{Outcome, RunReport};
use crate::registry::{load_suites, TestRegistry};

/// Evaluation harness for coding agents.
#[derive(Parser)]
#[command(name = "judge-forge")]
#[command(about = "Run coding agents against prompts, judge the outcome, and keep a ledger")]
#[command(version)]
#[command(
    long_about = "judge-forge runs a coding agent inside an isolated workspace, captures the diff and verification output, asks a judge to score the result, and records every verdict in an append-only ledger.\n\nExample usage:\n  judge-forge run suites/\n  judge-forge latest\n  judge-forge override 12 0.8 --reason \"flaky test, manually verified\""
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Harness configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    pub config: PathBuf,

    /// Project root: the workspace under test and the base of the output directory.
    #[arg(short, long, default_value = ".", global = true)]
    pub project: PathBuf,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run test suites and record verdicts.
    Run(RunArgs),

    /// List recorded runs.
    Runs(RunsArgs),

    /// Show the most recent run of every test.
    Latest(OutputArgs),

    /// Show per-runner aggregates.
    Stats(OutputArgs),

    /// Show recorded tests grouped by suite.
    Tree(OutputArgs),

    /// Record a manual score override for a run.
    Override(OverrideArgs),

    /// List score overrides.
    Overrides(OverridesArgs),
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output JSON to stdout instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Suite files or directories (defaults to `suites` from the config).
    pub suites: Vec<PathBuf>,

    /// Runner to use (defaults to the first configured runner).
    #[arg(short, long)]
    pub runner: Option<String>,

    /// Only run tests carrying one of these tags.
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Override the default iteration count.
    #[arg(short, long)]
    pub iterations: Option<u32>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct RunsArgs {
    /// Only runs of this test.
    #[arg(long)]
    pub test: Option<String>,

    /// Show at most this many of the most recent runs.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct OverrideArgs {
    /// Run to override.
    pub run_id: u64,

    /// New score in [0, 1].
    pub score: f64,

    /// Why the score is being corrected.
    #[arg(short, long)]
    pub reason: String,

    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct OverridesArgs {
    /// Only overrides of this run.
    pub run_id: Option<u64>,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Lets main.rs read the log level before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let project = cli.project.clone();
    let config_path = resolve(&project, &cli.config);

    match cli.command {
        Commands::Run(args) => run_command(&project, &config_path, args).await,
        Commands::Runs(args) => {
            let ledger = open_ledger_read_only(&project, &config_path).await?;
            runs_command(ledger.as_ref(), args).await
        }
        Commands::Latest(args) => {
            let ledger = open_ledger_read_only(&project, &config_path).await?;
            latest_command(ledger.as_ref(), args.json).await
        }
        Commands::Stats(args) => {
            let ledger = open_ledger_read_only(&project, &config_path).await?;
            stats_command(ledger.as_ref(), args.json).await
        }
        Commands::Tree(args) => {
            let ledger = open_ledger_read_only(&project, &config_path).await?;
            tree_command(ledger.as_ref(), args.json).await
        }
        Commands::Override(args) => {
            let (backend, output_dir) = ledger_location(&project, &config_path)?;
            let ledger = ledger::open(backend, &output_dir).await?;
            override_command(ledger.as_ref(), args).await
        }
        Commands::Overrides(args) => {
            let ledger = open_ledger_read_only(&project, &config_path).await?;
            overrides_command(ledger.as_ref(), args).await
        }
    }
}

fn resolve(project: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project.join(path)
    }
}

/// Opens the ledger named by the config file, or the default location when
/// there is no config file. Reading the ledger never needs a judge.
/// Ledger backend and directory from the config file if present, otherwise
/// from the environment and defaults.
fn ledger_location(project: &Path, config_path: &Path) -> anyhow::Result<(LedgerBackend, PathBuf)> {
    if config_path.exists() {
        let config = HarnessConfig::load(config_path)?;
        return Ok((config.ledger, config.ledger_dir(project)));
    }
    let output_dir =
        std::env::var("JUDGE_FORGE_OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.to_string());
    let backend = match std::env::var("JUDGE_FORGE_LEDGER").as_deref() {
        Ok("sqlite") => LedgerBackend::Sqlite,
        _ => LedgerBackend::Jsonl,
    };
    Ok((backend, project.join(output_dir)))
}

/// Queries never create, repair or otherwise touch ledger files, so they are
/// safe while a run is appending.
async fn open_ledger_read_only(
    project: &Path,
    config_path: &Path,
) -> anyhow::Result<Arc<dyn Ledger>> {
    let (backend, output_dir) = ledger_location(project, config_path)?;
    Ok(ledger::open_read_only(backend, &output_dir).await?)
}

// ============================================================================
// run
// ============================================================================

async fn run_command(project: &Path, config_path: &Path, args: RunArgs) -> anyhow::Result<()> {
    let mut config = HarnessConfig::load(config_path)?;
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
        config.validate()?;
    }

    let suites: Vec<PathBuf> = if args.suites.is_empty() {
        config.suites.iter().map(|p| resolve(project, p)).collect()
    } else {
        args.suites.clone()
    };
    if suites.is_empty() {
        return Err(anyhow::anyhow!(
            "No suites given and none configured in {}",
            config_path.display()
        ));
    }

    let mut registry = TestRegistry::new();
    let loaded = load_suites(&mut registry, &suites)?;
    if registry.filter_by_tags(&args.tags).is_empty() {
        warn!(loaded = loaded, tags = ?args.tags, "No tests match the requested tags");
    }

    let orchestrator = config.orchestrator(project, args.runner.as_deref()).await?;
    info!(
        ledger = %orchestrator.ledger().location().display(),
        "Running {} test(s)",
        registry.filter_by_tags(&args.tags).len()
    );
    let report = orchestrator.run_all(&registry, &args.tags).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let summary = report.summary();
    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} of {} test(s) failed ({} errored)",
            summary.failed + summary.errored,
            summary.total,
            summary.errored
        ))
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pass => "PASS",
        Outcome::Warn => "WARN",
        Outcome::Fail => "FAIL",
        Outcome::Error => "ERROR",
    }
}

fn print_report(report: &RunReport) {
    println!("\n=== judge-forge results ===");
    for test in &report.tests {
        let score = test
            .average_score()
            .map(|s| format!("{s:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!("  [{:5}] {} (score {})", outcome_label(test.outcome), test.test_id, score);
        for iteration in &test.iterations {
            if let Some(message) = &iteration.message {
                let first = message.lines().next().unwrap_or_default();
                println!("      #{}: {}", iteration.iteration, first);
            }
        }
    }

    let summary = report.summary();
    println!();
    println!("Total:   {}", summary.total);
    println!("Passed:  {}", summary.passed);
    println!("Warned:  {}", summary.warned);
    println!("Failed:  {}", summary.failed);
    println!("Errored: {}", summary.errored);
}

// ============================================================================
// ledger reads
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct RunRow {
    id: u64,
    timestamp: String,
    test_id: String,
    runner: String,
    judge_model: String,
    iteration: u32,
    score: f64,
    pass: bool,
    status: String,
    /// Set when an override changed the score.
    effective_score: Option<f64>,
}

async fn run_row(ledger: &dyn Ledger, entry: &LedgerEntry) -> anyhow::Result<RunRow> {
    let effective = ledger.effective(entry).await?;
    Ok(RunRow {
        id: entry.id,
        timestamp: ledger::types::format_timestamp(&entry.timestamp),
        test_id: entry.record.test_id.clone(),
        runner: entry.record.runner.clone(),
        judge_model: entry.record.judge_model.clone(),
        iteration: entry.record.iteration,
        score: entry.record.score,
        pass: effective.pass,
        status: effective.status.to_string(),
        effective_score: effective.override_id.map(|_| effective.score),
    })
}

fn print_rows(rows: &[RunRow]) {
    if rows.is_empty() {
        println!("No runs recorded.");
        return;
    }
    println!(
        "{:>6}  {:<27}  {:<5}  {:>5}  {:<16}  TEST",
        "ID", "TIMESTAMP", "STAT", "SCORE", "RUNNER"
    );
    for row in rows {
        let score = match row.effective_score {
            Some(effective) => format!("{effective:.2}*"),
            None => format!("{:.2}", row.score),
        };
        println!(
            "{:>6}  {:<27}  {:<5}  {:>5}  {:<16}  {}",
            row.id, row.timestamp, row.status, score, row.runner, row.test_id
        );
    }
    if rows.iter().any(|r| r.effective_score.is_some()) {
        println!("\n* overridden score");
    }
}

async fn runs_command(ledger: &dyn Ledger, args: RunsArgs) -> anyhow::Result<()> {
    let mut entries = ledger.list_runs(args.test.as_deref()).await?;
    if let Some(limit) = args.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    let mut rows = Vec::with_capacity(entries.len());
    for entry in &entries {
        rows.push(run_row(ledger, entry).await?);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_rows(&rows);
    }
    Ok(())
}

async fn latest_command(ledger: &dyn Ledger, json: bool) -> anyhow::Result<()> {
    let entries = ledger.latest_entries().await?;
    let mut rows = Vec::with_capacity(entries.len());
    for entry in &entries {
        rows.push(run_row(ledger, entry).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_rows(&rows);
    }
    Ok(())
}

async fn stats_command(ledger: &dyn Ledger, json: bool) -> anyhow::Result<()> {
    let stats = ledger.runner_stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if stats.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    println!("{:<24}  {:>6}  {:>9}  {:>9}", "RUNNER", "RUNS", "AVG SCORE", "PASS RATE");
    for s in &stats {
        println!(
            "{:<24}  {:>6}  {:>9.3}  {:>8.1}%",
            s.runner,
            s.total_runs,
            s.average_score,
            s.pass_rate * 100.0
        );
    }
    Ok(())
}

fn print_tree(node: &SuiteNode, depth: usize) {
    let indent = "  ".repeat(depth);
    for child in node.children.values() {
        println!("{indent}{}/", child.name);
        print_tree(child, depth + 1);
    }
    for test in &node.tests {
        let title = test.rsplit(crate::registry::ID_SEPARATOR).next().unwrap_or(test.as_str());
        println!("{indent}- {title}");
    }
}

async fn tree_command(ledger: &dyn Ledger, json: bool) -> anyhow::Result<()> {
    let tree = ledger.suite_tree().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else if tree.is_empty() {
        println!("No runs recorded.");
    } else {
        print_tree(&tree, 0);
    }
    Ok(())
}

// ============================================================================
// overrides
// ============================================================================

async fn override_command(ledger: &dyn Ledger, args: OverrideArgs) -> anyhow::Result<()> {
    let record = ledger
        .override_run_score(args.run_id, args.score, &args.reason)
        .await?;
    info!(override_id = record.id, run_id = record.run_id, "Score overridden");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!(
            "Override #{} recorded: run #{} -> {:.2} ({})",
            record.id,
            record.run_id,
            record.score,
            if record.pass { "pass" } else { "fail" }
        );
    }
    Ok(())
}

async fn overrides_command(ledger: &dyn Ledger, args: OverridesArgs) -> anyhow::Result<()> {
    let overrides = match args.run_id {
        Some(run_id) => ledger.overrides_for(run_id).await?,
        None => ledger.all_overrides().await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&overrides)?);
        return Ok(());
    }
    if overrides.is_empty() {
        println!("No overrides recorded.");
        return Ok(());
    }

    let effective_ids: Vec<u64> = {
        let mut run_ids: Vec<u64> = overrides.iter().map(|o| o.run_id).collect();
        run_ids.sort_unstable();
        run_ids.dedup();
        run_ids
            .into_iter()
            .filter_map(|run_id| {
                aggregate::latest_override(overrides.iter().filter(|o| o.run_id == run_id))
                    .map(|o| o.id)
            })
            .collect()
    };

    println!("{:>6}  {:>6}  {:>5}  {:<27}  REASON", "ID", "RUN", "SCORE", "TIMESTAMP");
    for o in &overrides {
        let marker = if effective_ids.contains(&o.id) { "*" } else { " " };
        println!(
            "{:>6}  {:>6}  {:>4.2}{}  {:<27}  {}",
            o.id,
            o.run_id,
            o.score,
            marker,
            ledger::types::format_timestamp(&o.timestamp),
            o.reason
        );
    }
    println!("\n* effective override");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "judge-forge",
            "run",
            "suites",
            "--tag",
            "smoke",
            "--tag",
            "api",
            "-i",
            "3",
            "--runner",
            "gpt",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.suites, [PathBuf::from("suites")]);
                assert_eq!(args.tags, ["smoke", "api"]);
                assert_eq!(args.iterations, Some(3));
                assert_eq!(args.runner.as_deref(), Some("gpt"));
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_parse_override_arguments() {
        let cli =
            Cli::try_parse_from(["judge-forge", "override", "7", "0.85", "-r", "verified"]).unwrap();
        match cli.command {
            Commands::Override(args) => {
                assert_eq!(args.run_id, 7);
                assert_eq!(args.score, 0.85);
                assert_eq!(args.reason, "verified");
            }
            _ => panic!("expected override"),
        }
    }

    #[test]
    fn test_resolve_relative_paths() {
        assert_eq!(
            resolve(Path::new("/repo"), Path::new("judge-forge.yaml")),
            PathBuf::from("/repo/judge-forge.yaml")
        );
        assert_eq!(
            resolve(Path::new("/repo"), Path::new("/etc/jf.yaml")),
            PathBuf::from("/etc/jf.yaml")
        );
    }
}
