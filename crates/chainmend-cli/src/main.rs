mod config;
mod resolve;

use anyhow::{Context, Result};
use chainmend_repair::{
    check_transcript, restore_latest_backup, CheckReport, RepairReport, TranscriptRepairer,
};
use clap::{Args, Parser, Subcommand};
use config::{config_path, load_config, RepairOverrides};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chainmend")]
#[command(about = "Offline rewind-anchor repair for agent transcripts", long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/chainmend/config.toml)
    #[arg(long, global = true, env = "CHAINMEND_CONFIG")]
    config: Option<PathBuf>,
    /// Directory searched when the target is a session-id prefix
    #[arg(long, global = true, env = "CHAINMEND_PROJECTS_DIR")]
    projects_dir: Option<PathBuf>,
    /// Directory for backups (default: next to the transcript)
    #[arg(long, global = true, env = "CHAINMEND_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Insert rewind anchors into a dead transcript
    Repair(RepairArgs),
    /// Report chain structure and integrity without modifying anything
    Check(TargetArgs),
    /// Put the most recent backup back in place
    Restore(TargetArgs),
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Transcript path or session-id prefix
    target: String,
}

#[derive(Args, Debug)]
struct RepairArgs {
    /// Transcript path or session-id prefix
    target: String,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Assistant turns between interval anchors
    #[arg(long, env = "CHAINMEND_INTERVAL")]
    interval: Option<usize>,
    /// Content of the synthetic anchor records
    #[arg(long, env = "CHAINMEND_MARKER")]
    marker: Option<String>,
    /// Seconds between chain neighbours that count as a pause
    #[arg(long, env = "CHAINMEND_TIME_GAP_SECS")]
    time_gap_secs: Option<i64>,
    /// Skip the post-insertion integrity check
    #[arg(long, default_value_t = false)]
    no_verify: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_file = config_path(cli.config.as_deref());
    let config = load_config(&config_file)?;
    debug!(event = "config_loaded", path = %config_file.display());

    let projects_dir = cli
        .projects_dir
        .clone()
        .or_else(|| config.projects_dir.clone())
        .or_else(resolve::default_projects_dir);

    match cli.command {
        Commands::Repair(args) => {
            let path = resolve::resolve_target(&args.target, projects_dir.as_deref())?;
            let options = config.repair_options(&RepairOverrides {
                dry_run: args.dry_run,
                interval: args.interval,
                marker: args.marker,
                no_verify: args.no_verify,
                time_gap_secs: args.time_gap_secs,
                backup_dir: cli.backup_dir.clone(),
            });
            let report = TranscriptRepairer::new(options).repair(&path);
            if cli.json {
                print_json(&report)?;
            } else {
                print_repair(&report);
            }
            Ok(exit_code(report.is_success()))
        }
        Commands::Check(args) => {
            let path = resolve::resolve_target(&args.target, projects_dir.as_deref())?;
            let report = check_transcript(&path, &config.marker())
                .with_context(|| format!("Failed to check {}", path.display()))?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_check(&report);
            }
            Ok(exit_code(report.is_valid()))
        }
        Commands::Restore(args) => {
            let path = resolve::resolve_target(&args.target, projects_dir.as_deref())?;
            let backup_dir = config.backup_dir(cli.backup_dir.as_deref());
            let report = restore_latest_backup(&path, backup_dir.as_deref())
                .with_context(|| format!("Failed to restore {}", path.display()))?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "restored {} from {} ({} records)",
                    report.path.display(),
                    report.backup_path.display(),
                    report.records
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    println!("{payload}");
    Ok(())
}

fn print_repair(report: &RepairReport) {
    let verb = if report.dry_run {
        "would insert"
    } else {
        "inserted"
    };
    println!(
        "{}: {verb} {} anchor(s) [{} records, chain {}, {} malformed]",
        report.path.display(),
        report.inserted,
        report.records,
        report.chain_len,
        report.malformed_lines
    );
    for location in &report.break_points {
        println!(
            "  chain #{} line {} at {} ({})",
            location.chain_index,
            location
                .line
                .map_or_else(|| "?".to_string(), |line| line.to_string()),
            location.timestamp.as_deref().unwrap_or("unknown time"),
            location.reason.as_str()
        );
    }
    if let Some(backup) = &report.backup_path {
        println!("  backup: {}", backup.display());
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &report.errors {
        eprintln!("error: {error}");
    }
}

fn print_check(report: &CheckReport) {
    println!("{}", report.path.display());
    println!(
        "  records: {} ({} malformed)",
        report.records, report.malformed_lines
    );
    println!("  chain length: {}", report.chain_len);
    if report.cycle_detected {
        println!("  parent cycle detected");
    }
    match report.compaction_boundary_line {
        Some(line) => println!("  compaction boundary: line {line}"),
        None => println!("  compaction boundary: none"),
    }
    println!("  existing anchors: {}", report.existing_anchors);
    if report.is_valid() {
        println!("  integrity: ok");
    } else {
        for error in &report.validation_errors {
            eprintln!("error: {error}");
        }
    }
}
