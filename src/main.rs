//! mtarunner CLI Entry Point
//!
//! Runs scripted operations against file-backed stores, so an interrupted
//! operation can be resumed or aborted from another invocation.
//!
//! # Usage
//!
//! ```bash
//! # Run an operation script
//! mtarunner run operation.yaml
//!
//! # Resume an interrupted operation
//! mtarunner resume 6f1c0c1e-0d5e-4c4b-9f0e-3b8f4d1f2a7e operation.yaml
//!
//! # Ask a running operation to abort
//! mtarunner abort 6f1c0c1e-0d5e-4c4b-9f0e-3b8f4d1f2a7e
//!
//! # One reconciliation pass, or one every sweep interval until Ctrl-C
//! mtarunner sweep
//! mtarunner watch
//!
//! # List held locks
//! mtarunner locks --state-dir /var/lib/mtarunner
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use tokio::sync::watch;

use mtarunner::cleanup::{AbortedOperationsCleaner, CleanUpJob, Cleaner, CleanupReport, StaleLockCleaner};
use mtarunner::config::EngineConfig;
use mtarunner::errors::ConfigError;
use mtarunner::execution::{Clock, OperationEngine, RunReport, Scheduler, SystemClock, TickOutcome};
use mtarunner::history::FileHistoryStore;
use mtarunner::lock::{FileLockStore, OperationLockManager};
use mtarunner::steps::OperationScript;
use mtarunner::substrate::FileProcessStore;
use mtarunner::{APP_NAME, VERSION};

#[derive(Debug, PartialEq)]
enum Command {
    Run { script: String },
    Resume { process_id: String, script: String },
    Abort { process_id: String },
    Sweep,
    Watch,
    Locks,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Cli {
    command: Command,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Deployment Step Engine");
    println!();
}

fn print_usage() {
    println!("Usage: mtarunner [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  run <OPERATION_FILE>                Start an operation and run it to the end");
    println!("  resume <PROCESS_ID> <OPERATION_FILE> Continue an interrupted operation");
    println!("  abort <PROCESS_ID>                  Ask a running operation to abort");
    println!("  sweep                               Run one reconciliation pass");
    println!("  watch                               Run reconciliation passes until Ctrl-C");
    println!("  locks                               List held operation locks");
    println!();
    println!("Options:");
    println!("  --config FILE       Engine configuration (YAML)");
    println!("  --state-dir DIR     Directory of locks, instances and history");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Parses command-line arguments into a Cli struct.
fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut config_path = None;
    let mut state_dir = None;
    let mut verbose = false;
    let mut positional = Vec::new();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            "--state-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--state-dir requires a path argument".to_string());
                }
                state_dir = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("run") => Command::Run {
            script: positional.next().ok_or("run requires an operation file")?,
        },
        Some("resume") => Command::Resume {
            process_id: positional.next().ok_or("resume requires a process id")?,
            script: positional.next().ok_or("resume requires an operation file")?,
        },
        Some("abort") => Command::Abort {
            process_id: positional.next().ok_or("abort requires a process id")?,
        },
        Some("sweep") => Command::Sweep,
        Some("watch") => Command::Watch,
        Some("locks") => Command::Locks,
        Some(other) => return Err(format!("Unknown command: {}", other)),
        None => return Err("No command given".to_string()),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    Ok(Cli {
        command,
        config_path,
        state_dir,
        verbose,
    })
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config = config.with_state_dir(dir);
    }
    info!("State directory: {}", config.state_dir.display());
    Ok(config)
}

/// File-backed stores under the state directory.
struct Stores {
    locks: Arc<FileLockStore>,
    processes: Arc<FileProcessStore>,
    history: Arc<FileHistoryStore>,
    clock: Arc<dyn Clock>,
}

impl Stores {
    fn open(config: &EngineConfig) -> Self {
        let dir = &config.state_dir;
        Self {
            locks: Arc::new(FileLockStore::new(dir.join("locks"))),
            processes: Arc::new(FileProcessStore::new(dir.join("processes"))),
            history: Arc::new(FileHistoryStore::new(dir.join("history.jsonl"))),
            clock: Arc::new(SystemClock),
        }
    }

    fn lock_manager(&self) -> OperationLockManager {
        OperationLockManager::new(self.locks.clone(), Arc::clone(&self.clock))
    }

    fn engine(&self, config: EngineConfig) -> OperationEngine {
        let mut engine = OperationEngine::new(config);
        engine.set_clock(Arc::clone(&self.clock));
        engine.set_lock_store(self.locks.clone());
        engine.set_processes(self.processes.clone());
        engine.set_history(self.history.clone());
        engine
    }

    /// Purging data of deleted spaces needs the platform's audit stream, so
    /// the CLI sweep only repairs aborts and stale locks.
    fn cleanup_job(&self, config: &EngineConfig) -> Result<CleanUpJob, ConfigError> {
        let locks = self.lock_manager();
        let cleaners: Vec<Arc<dyn Cleaner>> = vec![
            Arc::new(AbortedOperationsCleaner::new(
                self.history.clone(),
                self.processes.clone(),
                locks.clone(),
            )),
            Arc::new(StaleLockCleaner::new(self.processes.clone(), locks)),
        ];
        CleanUpJob::new(cleaners, &config.cleanup, Arc::clone(&self.clock))
    }
}

fn print_run_summary(report: &RunReport) {
    println!();
    for result in &report.results {
        let status = match &result.outcome {
            Ok(TickOutcome::Finished) => "FINISHED".green().bold(),
            Ok(TickOutcome::Aborted) => "ABORTED".yellow().bold(),
            Ok(TickOutcome::Failed { step, message, .. }) => {
                println!("  step \"{}\": {}", step, message.red());
                "ERROR".red().bold()
            }
            Ok(other) => format!("{:?}", other).normal(),
            Err(e) => {
                println!("  {}", e.to_string().red());
                "STOPPED".red().bold()
            }
        };
        println!("Operation {}: {}", result.process_id, status);
    }
    println!("Total execution time: {:.2?}", report.elapsed);
    println!("{}", report.timeline.gantt_chart());
}

fn print_cleanup_summary(report: &CleanupReport) {
    println!();
    for run in &report.runs {
        match &run.result {
            Ok(count) => println!("{:<20} {}", run.cleaner, format!("{} repaired", count).green()),
            Err(e) => println!("{:<20} {}", run.cleaner, e.red()),
        }
    }
}

fn drive(engine: OperationEngine, ctx: mtarunner::context::ExecutionContext) -> Result<(), Box<dyn std::error::Error>> {
    let process_id = ctx.process_id().to_string();
    info!("Operation id: {}", process_id);

    let report = Scheduler::new(Arc::new(engine)).run(vec![ctx]);
    print_run_summary(&report);

    if report.all_finished() {
        Ok(())
    } else {
        Err(format!("Operation {} did not finish", process_id).into())
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let config = load_config(&cli)?;
    let stores = Stores::open(&config);

    match &cli.command {
        Command::Run { script } => {
            let script = OperationScript::load(script)?;
            let mut engine = stores.engine(config);
            engine.register(script.definition()?)?;
            let ctx = engine.start(script.request())?;
            drive(engine, ctx)
        }
        Command::Resume { process_id, script } => {
            let script = OperationScript::load(script)?;
            let mut engine = stores.engine(config);
            engine.register(script.definition()?)?;
            let ctx = engine.resume(process_id)?;
            drive(engine, ctx)
        }
        Command::Abort { process_id } => {
            stores.engine(config).request_abort(process_id)?;
            println!("Abort requested for operation {}", process_id.bold());
            Ok(())
        }
        Command::Sweep => {
            let report = stores.cleanup_job(&config)?.run_once();
            print_cleanup_summary(&report);
            if report.failures() > 0 {
                warn!("{} cleaners failed", report.failures());
            }
            Ok(())
        }
        Command::Watch => {
            let job = Arc::new(stores.cleanup_job(&config)?);
            let interval = config.cleanup.sweep_interval()?;
            info!("Running clean-up every {:?}; press Ctrl-C to stop", interval);

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                let (shutdown, receiver) = watch::channel(false);
                let handle = tokio::spawn(job.run_periodically(interval, receiver));

                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                let _ = shutdown.send(true);
                handle.await
            })?;
            Ok(())
        }
        Command::Locks => {
            let locks = stores.lock_manager().list_all()?;
            if locks.is_empty() {
                println!("No operation locks are held");
            }
            for lock in locks {
                println!(
                    "{:<24} {:<16} {} (since {})",
                    lock.target_id.bold(),
                    lock.space_id,
                    lock.operation_id,
                    lock.acquired_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
