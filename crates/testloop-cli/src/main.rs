mod doctor;
mod signals;

use anyhow::Result;
use clap::{Parser, Subcommand};
use doctor::run_doctor;
use std::env;
use std::path::PathBuf;
use testloop_config::{load_run_config, CliOverrides, RefineScope};
use testloop_core::{read_report, read_status, BuildIntegrator, CancelToken, Pipeline};
use testloop_engine::HttpGenerator;
use testloop_types::{RunReport, UnitOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "testloop",
    about = "Generate unit tests with a language model and refine them until they compile",
    version
)]
struct Cli {
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate, build and refine tests for every source unit
    Run(RunCommand),
    /// Patch the build description once and exit
    Integrate(JsonFlag),
    /// Show the state of the last or current run
    Status(JsonFlag),
    /// Check configuration and environment
    Doctor(DoctorCommand),
}

#[derive(Debug, clap::Args)]
struct RunCommand {
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    source_dir: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    max_refine_attempts: Option<u32>,

    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Refine only the current unit's test instead of every test
    #[arg(long)]
    refine_current_only: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Debug, clap::Args)]
struct JsonFlag {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, clap::Args)]
struct DoctorCommand {
    #[arg(long)]
    fix: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let cwd = resolve_cwd(cli.cwd)?;

    match cli.command {
        Commands::Run(cmd) => run_command(cmd, cwd),
        Commands::Integrate(cmd) => integrate_command(cmd, cwd),
        Commands::Status(cmd) => status_command(cmd, cwd),
        Commands::Doctor(cmd) => doctor_command(cmd, cwd),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run_command(cmd: RunCommand, cwd: PathBuf) -> Result<()> {
    let cfg = load_run_config(
        &cwd,
        &CliOverrides {
            model: cmd.model,
            source_dir: cmd.source_dir,
            output_dir: cmd.output_dir,
            max_refine_attempts: cmd.max_refine_attempts,
            request_timeout_secs: cmd.request_timeout_secs,
            refine_scope: cmd.refine_current_only.then_some(RefineScope::Unit),
        },
    )?;
    let generator = HttpGenerator::from_config(&cfg)?;
    let cancel = CancelToken::new();
    signals::install(cancel.clone());
    let report = Pipeline::new(&cfg, &generator)?
        .with_cancel_token(cancel)
        .run()?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn integrate_command(cmd: JsonFlag, cwd: PathBuf) -> Result<()> {
    let cfg = load_run_config(&cwd, &CliOverrides::default())?;
    let outcome =
        BuildIntegrator::new(&cfg.integration).ensure_integrated(&cfg.build_description)?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}: {:?}", cfg.build_description.display(), outcome);
    }
    Ok(())
}

fn status_command(cmd: JsonFlag, cwd: PathBuf) -> Result<()> {
    let cfg = load_run_config(&cwd, &CliOverrides::default())?;
    let status = read_status(&cfg.runtime_dir)?;
    let report = read_report(&cfg.runtime_dir).ok();

    if cmd.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "status": status,
                "report": report,
            }))?
        );
        return Ok(());
    }

    println!("state: {}", status.state);
    println!("model: {}", status.model);
    println!("current_unit: {}", status.current_unit.as_deref().unwrap_or("-"));
    println!("units: {}/{}", status.units_processed, status.units_total);
    println!("builds: {}", status.build_count);
    println!("generation_calls: {}", status.generation_calls);
    if let Some(err) = &status.last_error {
        println!("last_error: {}", err);
    }
    println!("updated_at_epoch: {}", status.updated_at_epoch);
    if let Some(report) = report {
        if status.state != "running" {
            print_report(&report);
        }
    }
    Ok(())
}

fn doctor_command(cmd: DoctorCommand, cwd: PathBuf) -> Result<()> {
    let report = run_doctor(&cwd, cmd.fix)?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            println!(
                "[{}] {}: {}",
                if check.ok { "ok" } else { "fail" },
                check.name,
                check.detail
            );
        }
        for warning in &report.warnings {
            println!("[warn] {}", warning);
        }
        for fix in &report.attempted_fixes {
            println!("[fix] {}", fix);
        }
    }

    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for unit in &report.units {
        let detail = match &unit.outcome {
            UnitOutcome::Clean { refinements } | UnitOutcome::PersistentFailure { refinements } => {
                format!("refinements={} builds={}", refinements, unit.builds)
            }
            UnitOutcome::Skipped { reason } => reason.clone(),
            UnitOutcome::Cancelled => String::new(),
        };
        println!("{}: {} {}", unit.unit, unit.outcome.as_str(), detail);
    }
    println!(
        "clean={} persistent_failure={} skipped={} cancelled={}",
        report.count("clean"),
        report.count("persistent_failure"),
        report.count("skipped"),
        report.count("cancelled")
    );
}

fn resolve_cwd(cwd: Option<PathBuf>) -> Result<PathBuf> {
    let path = match cwd {
        Some(p) => p,
        None => env::current_dir()?,
    };
    Ok(path.canonicalize()?)
}
