//! BlockRunner CLI Entry Point
//!
//! Provides command-line interface for compiling and running workflows.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! blockrunner workflow.yaml
//!
//! # With pause control (create the file to pause, delete it to resume)
//! blockrunner workflow.yaml /tmp/pause.flag
//!
//! # Only compile and print the validation report
//! blockrunner workflow.yaml --validate
//!
//! # Dry run mode (echo resolved parameters instead of executing blocks)
//! blockrunner workflow.yaml --dry-run
//!
//! # Cap the number of nodes running at once
//! blockrunner workflow.yaml --parallel 8
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use blockrunner::execution::{
    BlockExecutor, BuiltinExecutor, DryRunExecutor, Engine, EngineConfig, ExecutionRun,
    NodeStatus, RunStatus,
};
use blockrunner::monitoring::ExecutionTimeline;
use blockrunner::status::LogObserver;
use blockrunner::workflow::{compile, load_workflow};
use blockrunner::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: String,
    pause_flag_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    dry_run: bool,
    validate_only: bool,
    max_parallel: Option<usize>,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Block Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: blockrunner [OPTIONS] <WORKFLOW_FILE> [PAUSE_FLAG_PATH]");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML or JSON file");
    println!("  [PAUSE_FLAG_PATH]   Optional path for pause/resume control");
    println!();
    println!("Options:");
    println!("  --validate          Compile and print the validation report, then exit");
    println!("  --dry-run           Echo resolved parameters instead of executing blocks");
    println!("  --parallel N        Maximum nodes running at once (0 = unbounded)");
    println!("  --config PATH       Load engine settings from a YAML file");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  blockrunner nightly.yaml");
    println!("  blockrunner nightly.yaml --validate");
    println!("  blockrunner nightly.json /tmp/pause.flag --parallel 4");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config {
        workflow_path: DEFAULT_WORKFLOW.to_string(),
        ..Config::default()
    };
    let mut positional_index = 0;
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
            "--dry-run" => {
                config.dry_run = true;
            }
            "--validate" => {
                config.validate_only = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config.config_path = Some(PathBuf::from(&args[i]));
            }
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                config.max_parallel = Some(
                    args[i]
                        .parse()
                        .map_err(|_| format!("Invalid parallel value: {}", args[i]))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    1 => config.pause_flag_path = Some(PathBuf::from(arg)),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Polls the pause flag file and pauses or resumes the run to match it.
///
/// Stops once the run reaches a terminal status.
fn watch_pause_flag(
    engine: Engine,
    workflow_id: String,
    run_id: String,
    pause_path: PathBuf,
    mut snapshots: watch::Receiver<ExecutionRun>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PAUSE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let status = snapshots.borrow().status;
            if status.is_terminal() {
                break;
            }

            let result = match (pause_path.exists(), status) {
                (true, RunStatus::Running) => {
                    info!("Pause flag found - pausing at next level boundary");
                    engine.pause(&workflow_id, &run_id)
                }
                (false, RunStatus::Paused) => {
                    info!("Pause flag removed - resuming");
                    engine.resume(&workflow_id, &run_id)
                }
                _ => continue,
            };

            if let Err(e) = result {
                warn!("Pause control failed: {}", e);
            }
        }
    })
}

/// Cancels the run on Ctrl-C.
fn cancel_on_interrupt(engine: Engine, workflow_id: String, run_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received - cancelling run after in-flight nodes settle");
            if let Err(e) = engine.cancel(&workflow_id, &run_id) {
                error!("Cancel failed: {}", e);
            }
        }
    })
}

/// Prints the per-node outcome of a finished run.
fn print_summary(run: &ExecutionRun, total_time: Duration) {
    let status = match run.status {
        RunStatus::Completed => run.status.to_string().green().bold(),
        RunStatus::Failed => run.status.to_string().red().bold(),
        _ => run.status.to_string().yellow().bold(),
    };

    println!();
    println!("Run {} {}", run.id, status);
    println!(
        "Progress: {}/{} nodes settled ({}%)",
        run.progress.completed, run.progress.total, run.progress.percentage
    );
    println!();

    for (node_id, state) in &run.node_statuses {
        let label = match state.status {
            NodeStatus::Completed => state.status.to_string().green(),
            NodeStatus::Failed => state.status.to_string().red(),
            NodeStatus::Skipped => state.status.to_string().yellow(),
            _ => state.status.to_string().normal(),
        };
        let detail = match (&state.error, state.duration) {
            (Some(error), _) => format!(" - {}", error),
            (None, Some(ms)) => format!(" ({} ms)", ms),
            (None, None) => String::new(),
        };
        println!("  {:16} {}{}", node_id, label, detail);
    }

    println!();
    println!("Total execution time: {:.2?}", total_time);
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading engine config: {}", path.display());
            Ok(EngineConfig::load(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let mut engine_config = load_engine_config(config.config_path.as_deref())?;
    if let Some(max_parallel) = config.max_parallel {
        engine_config.max_parallel = max_parallel;
    }

    if let Some(ref path) = config.pause_flag_path {
        info!("Pause control: {}", path.display());
    }
    if config.dry_run {
        info!("Mode: DRY RUN (blocks will not execute)");
    }

    // Load workflow
    let workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    info!(
        "Workflow '{}' loaded: {} nodes, {} edges",
        workflow.id,
        workflow.nodes.len(),
        workflow.edges.len()
    );

    // Compile
    let compilation = compile(&workflow.nodes, &workflow.edges);
    for warning in &compilation.warnings {
        warn!("{}", warning);
    }
    for compile_error in &compilation.errors {
        error!("{}", compile_error);
    }

    if config.validate_only {
        println!("{}", serde_json::to_string_pretty(&compilation.report())?);
        if compilation.is_valid() {
            return Ok(());
        }
        return Err(format!("workflow has {} structural errors", compilation.errors.len()).into());
    }

    if !compilation.is_valid() {
        return Err(format!(
            "Workflow '{}' is not executable: {} structural errors",
            workflow.id,
            compilation.errors.len()
        )
        .into());
    }

    let executor: Arc<dyn BlockExecutor> = if config.dry_run {
        Arc::new(DryRunExecutor)
    } else {
        for node in &workflow.nodes {
            if !BuiltinExecutor::supports(&node.block_type) {
                warn!(
                    "Node '{}' has block type '{}', which this runner cannot execute",
                    node.id, node.block_type
                );
            }
        }
        Arc::new(BuiltinExecutor)
    };

    // Create and configure engine
    let timeline = Arc::new(ExecutionTimeline::new());
    let mut engine = Engine::with_config(&engine_config);
    engine.add_observer(Arc::new(LogObserver));
    engine.add_observer(timeline.clone());

    let start_time = Instant::now();
    let handle = engine.start(&workflow.id, compilation.plan, executor)?;
    let run_id = handle.run_id().to_string();

    let pause_watcher = config.pause_flag_path.map(|path| {
        watch_pause_flag(
            engine.clone(),
            workflow.id.clone(),
            run_id.clone(),
            path,
            handle.subscribe(),
        )
    });
    let interrupt = cancel_on_interrupt(engine.clone(), workflow.id.clone(), run_id);

    let run = handle.wait().await;

    interrupt.abort();
    if let Some(watcher) = pause_watcher {
        watcher.abort();
    }

    print_summary(&run, start_time.elapsed());
    println!("{}", timeline.gantt_chart());

    match run.status {
        RunStatus::Completed => Ok(()),
        status => Err(format!("Run {} ended {}", run.id, status).into()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
