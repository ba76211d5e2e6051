//! # ddq-e2e
//!
//! Runs the backend conformance suite against the in-memory reference
//! backend, optionally with injected faults.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ddq_core::{Faults, HarnessConfig, MemoryBackendFactory};
use ddq_e2e::{BackendTester, HarnessError, SuiteReport, all_scenarios, reporter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// DDQ backend conformance harness
#[derive(Parser, Debug)]
#[command(name = "ddq-e2e", version, about)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the conformance scenarios
    Run {
        /// Path to a YAML harness config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Watchdog for the whole run in milliseconds (overrides the config)
        #[arg(long = "timeout", value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Only run the given scenario (repeatable)
        #[arg(long = "scenario")]
        scenarios: Vec<String>,

        /// Write a JSON report to this file
        #[arg(long)]
        json: Option<PathBuf>,

        /// Make the reference backend break part of the contract (repeatable)
        #[arg(long, value_enum)]
        fault: Vec<Fault>,
    },

    /// List scenario ids in run order
    List,
}

/// Contract violations the reference backend can commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Fault {
    AcceptDuplicates,
    SkipCompensatingRedelivery,
    PrematureExpiry,
    SharedDelivery,
    LeakDiagnostics,
    RepeatCompensatingRedelivery,
    NoopRequeue,
    RequeueToHolder,
    Deadlocked,
}

fn faults(selected: &[Fault]) -> Faults {
    let mut faults = Faults::none();
    for fault in selected {
        match fault {
            Fault::AcceptDuplicates => faults.accept_duplicates = true,
            Fault::SkipCompensatingRedelivery => faults.skip_compensating_redelivery = true,
            Fault::PrematureExpiry => faults.premature_expiry = true,
            Fault::SharedDelivery => faults.shared_delivery = true,
            Fault::LeakDiagnostics => faults.leak_diagnostics = true,
            Fault::RepeatCompensatingRedelivery => faults.repeat_compensating_redelivery = true,
            Fault::NoopRequeue => faults.noop_requeue = true,
            Fault::RequeueToHolder => faults.requeue_to_holder = true,
            Fault::Deadlocked => faults.deadlocked = true,
        }
    }
    faults
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::List => {
            for scenario in all_scenarios() {
                println!("{:<18} {}", scenario.id(), scenario.description());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            config,
            timeout_ms,
            scenarios,
            json,
            fault,
        } => {
            let mut harness = match &config {
                Some(path) => HarnessConfig::from_file(path)
                    .with_context(|| format!("Failed to load config from {:?}", path))?,
                None => HarnessConfig::default(),
            };
            if let Some(timeout_ms) = timeout_ms {
                anyhow::ensure!(timeout_ms > 0, "--timeout must be greater than zero");
                harness.timeout_ms = timeout_ms;
            }
            if !scenarios.is_empty() {
                harness.scenarios = scenarios;
            }

            let faults = faults(&fault);
            if faults.any() {
                info!(?faults, "Reference backend will violate the contract");
            }
            let factory = Arc::new(MemoryBackendFactory::with_faults(faults));
            let tester = BackendTester::from_config(factory, &harness)?;

            let timeout = harness.timeout();
            let (report, timed_out) = match tester.run_all(timeout).await {
                Ok(report) => (report, false),
                Err(HarnessError::Timeout { timeout, partial }) => {
                    error!(timeout = ?timeout, "Run deadline reached, remaining scenarios skipped");
                    (*partial, true)
                }
                Err(e) => return Err(e.into()),
            };

            finish(&report, timed_out, json.as_deref())
        }
    }
}

fn finish(report: &SuiteReport, timed_out: bool, json: Option<&Path>) -> Result<ExitCode> {
    reporter::print_summary(report);

    if let Some(path) = json {
        reporter::write_json(report, timed_out, path)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        info!(path = %path.display(), "Wrote JSON report");
    }

    if timed_out || !report.all_passed() {
        error!("Backend functional test failed.");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
