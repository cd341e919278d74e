/*!
 * Manufactory CLI
 *
 * Loads pipeline graphs from a manifest into an in-memory store and runs
 * them with the built-in gears.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use manufactory::{
    config::{HubConfig, LogLevel, ManifestFile},
    core::loader,
    error::{ManufactoryError, Result, EXIT_SUCCESS},
    gears::{builtin_registry, PrinterSink},
    logging, Hub, MemoryStore, RecordStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "manufactory")]
#[command(version, about = "Run batch pipelines of miners, factories and printers", long_about = None)]
struct Cli {
    /// Hub configuration file (TOML)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a manifest, trigger every miner and run until the pipelines drain
    ///
    /// With miner schedules configured, keeps triggering them until
    /// `--for-secs` elapses or Ctrl-C is pressed.
    Run {
        /// Pipeline manifest (TOML)
        #[arg(short, long, value_name = "PATH")]
        manifest: PathBuf,

        /// Maximum number of buildings running at once
        #[arg(long)]
        capacity: Option<usize>,

        /// Stop scheduled mining after this many seconds
        #[arg(long)]
        for_secs: Option<u64>,
    },

    /// Check the graphs of a manifest without running them
    Validate {
        /// Pipeline manifest (TOML)
        #[arg(short, long, value_name = "PATH")]
        manifest: PathBuf,
    },

    /// List the built-in gear modules
    Gears,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => HubConfig::from_file(path)?,
        None => HubConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log.level = level.into();
    }
    if cli.log_file.is_some() {
        config.log.file = cli.log_file.clone();
    }
    config.log.verbose |= cli.verbose;

    if let Err(e) = logging::init_logging(&config.log) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Run {
            manifest,
            capacity,
            for_secs,
        } => {
            if let Some(capacity) = capacity {
                config.facility_capacity = capacity;
                config.validate()?;
            }
            handle_run(config, &manifest, for_secs)
        }
        Commands::Validate { manifest } => handle_validate(&manifest),
        Commands::Gears => {
            let (gears, _) = builtin_registry();
            for module_id in gears.module_ids() {
                if let Some((building_type, _)) = gears.resolve(&module_id) {
                    println!("{:<10} {}", module_id, building_type.kind);
                }
            }
            Ok(())
        }
    }
}

fn handle_validate(path: &Path) -> Result<()> {
    let manifest = ManifestFile::from_file(path)?;
    let (gears, _) = builtin_registry();

    let mut problems = 0;
    for record in &manifest.manufactures {
        let errors = loader::validate(record, &gears);
        if errors.is_empty() {
            println!(
                "ok    manufacture {} '{}': {} buildings, {} pipes",
                record.id,
                record.name,
                record.buildings.len(),
                record.pipes.len()
            );
        }
        for error in &errors {
            println!("error manufacture {} '{}': {}", record.id, record.name, error);
        }
        problems += errors.len();
    }

    if problems > 0 {
        return Err(ManufactoryError::Other(format!(
            "{} problem(s) found in {}",
            problems,
            path.display()
        )));
    }
    Ok(())
}

fn handle_run(config: HubConfig, manifest_path: &Path, for_secs: Option<u64>) -> Result<()> {
    let manifest = ManifestFile::from_file(manifest_path)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_pipelines(config, manifest, for_secs))
}

async fn run_pipelines(
    config: HubConfig,
    manifest: ManifestFile,
    for_secs: Option<u64>,
) -> Result<()> {
    let store = Arc::new(MemoryStore::with_records(
        manifest.manufactures,
        manifest.schedules,
    ));
    let mut schedules = config.schedules.clone();
    schedules.extend(store.load_schedules().await?);

    let (gears, sink) = builtin_registry();
    let hub = Hub::new(config, store.clone(), store.clone(), gears);

    let report = hub.load().await?;
    for (id, err) in &report.failed {
        eprintln!("Skipped manufacture {}: {}", id, err);
    }

    let miners = hub.run_all_miners()?;
    info!(miners, "Triggered miners");

    if schedules.is_empty() {
        hub.drain().await;
    } else {
        hub.schedule_miners(&schedules)?;
        match for_secs {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupted");
            }
        }
    }

    let sync_failures = hub.shutdown().await;
    print_summary(&hub, &store, &sink).await?;

    if !report.failed.is_empty() || !sync_failures.is_empty() {
        return Err(ManufactoryError::Other(format!(
            "{} manufacture(s) failed to load, {} failed to sync",
            report.failed.len(),
            sync_failures.len()
        )));
    }
    Ok(())
}

async fn print_summary(hub: &Hub, store: &MemoryStore, sink: &PrinterSink) -> Result<()> {
    for id in hub.manufacture_ids() {
        let Some(manufacture) = hub.manufacture(id) else {
            continue;
        };
        println!("Manufacture {} '{}'", id, manufacture.name());

        let buildings: Vec<_> = manufacture.buildings().cloned().collect();
        for building in buildings {
            println!(
                "  building {:<4} {:<12} {:<10} {} pieces",
                building.id(),
                building.name(),
                building.building_type().module_id,
                store.count(building.id()).await
            );
        }

        for (pipe_id, letters) in hub.dead_letters(id).await? {
            println!("  pipe {:<8} {} dead letter(s)", pipe_id, letters.len());
        }
    }
    println!("Printed {} piece(s)", sink.len());
    Ok(())
}
