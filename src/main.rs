use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use container_backup::config::{ConfigResolver, EngineConfig};
use container_backup::managers::backup::{BackupManager, RunReport};
use container_backup::managers::retention::RetentionManager;
use container_backup::managers::{logging, status};
use container_backup::ServiceOutcome;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Exit code when another run holds the lock
const EXIT_LOCKED: u8 = 2;

#[derive(Parser)]
#[command(name = "container-backup")]
#[command(about = "Backup orchestration for Docker services", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Per-service configuration file (overrides CONFIG_FILE)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backup root (overrides BACKUP_DIR)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up all discovered services or only the given ones
    Backup {
        /// Comma separated service names
        #[arg(short, long, value_delimiter = ',')]
        services: Vec<String>,
    },

    /// Show archives, the run lock and the last run
    Status {
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Delete archives expired under each service's retention policy
    Retention {
        /// Only this service
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Back up periodically until interrupted
    Schedule {
        /// Time between backup runs
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Time between retention passes
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        retention_interval: Duration,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            logging::init_console_logging();
            return Err(e).context("Invalid configuration");
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level.to_lowercase();
    }
    if let Some(path) = cli.config {
        config.config_file = Some(path);
    }
    if let Some(dir) = cli.backup_dir {
        config.backup_dir = dir;
    }

    // Must stay alive until exit so file logs are flushed
    let _log_guard = logging::init_logging(&config.logging)?;

    let command = cli.command.unwrap_or(Commands::Status {
        output: OutputFormat::Text,
    });

    match command {
        Commands::Backup { services } => {
            ensure_docker()?;
            let manager = BackupManager::from_engine(config)?;
            let filter = (!services.is_empty()).then_some(services.as_slice());
            Ok(match manager.run_backup(filter) {
                Ok(report) => {
                    print_run_summary(&report);
                    exit_code(&report)
                }
                Err(e) if e.is_lock_held() => {
                    error!("{}", e);
                    ExitCode::from(EXIT_LOCKED)
                }
                Err(e) => return Err(e).context("Backup run failed"),
            })
        }

        Commands::Status { output } => {
            let report = status::collect_status(&config)?;
            match output {
                OutputFormat::Text => print!("{}", status::render_text(&report)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Retention { service } => {
            let resolver = Arc::new(ConfigResolver::from_engine(&config));
            let report = RetentionManager::new(config.backup_dir.clone(), resolver).apply_retention(service.as_deref())?;
            println!(
                "Deleted {} archives, kept {}, {} failures",
                report.deleted.len(),
                report.kept,
                report.failures.len()
            );
            for (path, e) in &report.failures {
                eprintln!("  ✗ {}: {}", path.display(), e);
            }
            Ok(if report.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::Schedule {
            interval,
            retention_interval,
        } => {
            ensure_docker()?;
            let backup_dir = config.backup_dir.clone();
            let resolver = Arc::new(ConfigResolver::from_engine(&config));
            let manager = Arc::new(BackupManager::from_engine(config)?);
            let retention = Arc::new(RetentionManager::new(backup_dir, resolver));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start scheduler runtime")?;
            runtime.block_on(schedule(manager, retention, interval, retention_interval));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Backup loop: run, prune when due, sleep. Stops on Ctrl-C.
async fn schedule(
    manager: Arc<BackupManager>,
    retention: Arc<RetentionManager>,
    interval: Duration,
    retention_interval: Duration,
) {
    info!(
        "Scheduling backups every {} (retention every {})",
        humantime::format_duration(interval),
        humantime::format_duration(retention_interval)
    );
    let mut last_retention: Option<Instant> = None;

    loop {
        let runner = manager.clone();
        match tokio::task::spawn_blocking(move || runner.run_backup(None)).await {
            Ok(Ok(report)) => print_run_summary(&report),
            Ok(Err(e)) if e.is_lock_held() => warn!("Skipping run: {}", e),
            Ok(Err(e)) => error!("Backup run failed: {}", e),
            Err(e) => error!("Backup run panicked: {}", e),
        }

        if last_retention.map_or(true, |t| t.elapsed() >= retention_interval) {
            let pruner = retention.clone();
            match tokio::task::spawn_blocking(move || pruner.apply_retention(None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Retention failed: {:#}", e),
                Err(e) => error!("Retention panicked: {}", e),
            }
            last_retention = Some(Instant::now());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping scheduler");
                break;
            }
        }
    }
}

fn ensure_docker() -> Result<()> {
    which::which("docker")
        .map(|path| tracing::debug!("Using docker at {:?}", path))
        .context("docker CLI not found in PATH")
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_run_summary(report: &RunReport) {
    println!("=== Backup Run ===\n");
    for (name, service) in &report.services {
        let marker = match service.outcome {
            ServiceOutcome::Done => "✓",
            ServiceOutcome::PartialFailure(_) => "⚠",
            ServiceOutcome::Failed(_) => "✗",
            ServiceOutcome::Skipped(_) => "-",
        };
        println!("  {} {} - {} ({:.1}s)", marker, name, service.outcome, service.duration_secs);
        for component in &service.components {
            println!("      {}", component);
        }
        if let Some(archive) = &service.archive {
            println!("      -> {}", archive.display());
        }
    }
    let (done, partial, failed, skipped) = report.counts();
    println!(
        "\n{} done, {} partial, {} failed, {} skipped",
        done, partial, failed, skipped
    );
}
