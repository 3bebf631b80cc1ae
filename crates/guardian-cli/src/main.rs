//! Guardian CLI - command-line interface for the resource guardian

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use guardian_core::{init_logging, Guardian, GuardianConfig};
use guardian_runtime::GuardianEvent;
use guardian_shutdown::SnapshotStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "guardian")]
#[command(about = "Resource Guardian - stack and memory protection for long-lived processes")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Check configuration validity
    Check {
        /// Configuration file path
        #[arg(short, long, default_value = "guardian.json")]
        config: PathBuf,
    },
    /// Print the default configuration as JSON
    Defaults,
    /// Show the last saved shutdown snapshot
    Snapshot {
        /// State directory holding the snapshot
        #[arg(short, long, default_value = "./guardian-state")]
        dir: PathBuf,
        /// Delete the snapshot after printing it
        #[arg(long)]
        clear: bool,
    },
    /// Guard this process for a while and log every event
    Watch {
        /// Configuration file path (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to watch
        #[arg(short, long, default_value_t = 30)]
        seconds: u64,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GuardianConfig> {
    match path {
        Some(path) => GuardianConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(GuardianConfig::new()),
    }
}

fn check(config: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(config))?;
    println!("Configuration OK");
    println!(
        "  stack depths:      {} / {} / {} / {}",
        config.stack.warning_depth,
        config.stack.critical_depth,
        config.stack.emergency_depth,
        config.stack.shutdown_depth
    );
    println!(
        "  memory thresholds: {:.2} / {:.2} / {:.2} (ceiling {:.2})",
        config.memory.sampler.warning_threshold,
        config.memory.sampler.critical_threshold,
        config.memory.sampler.emergency_threshold,
        config.memory.absolute_ceiling
    );
    println!(
        "  shutdown:          graceful {}ms, force {}ms, {} recovery attempts",
        config.shutdown.graceful_timeout_ms,
        config.shutdown.force_timeout_ms,
        config.shutdown.max_recovery_attempts
    );
    Ok(())
}

fn snapshot(dir: &Path, clear: bool) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("state directory {} does not exist", dir.display());
    }
    let store = SnapshotStore::open(dir).context("opening snapshot store")?;
    match store.load().context("reading snapshot")? {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if clear && store.clear()? {
                println!("Snapshot removed");
            }
        }
        None => println!("No snapshot in {}", dir.display()),
    }
    Ok(())
}

async fn watch(config: GuardianConfig, seconds: u64) -> anyhow::Result<()> {
    let guardian = Guardian::new(config).context("building guardian")?;
    let mut events = guardian.subscribe();
    guardian.start();
    info!(seconds, "watching current process");

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    guardian.stop();
    let status = guardian.status();
    println!(
        "ticks: stack {}, memory {}; cleanups {}; stack max depth {}",
        status.stack.stats.ticks,
        status.memory.stats.ticks,
        status.memory.stats.cleanups.values().sum::<u64>(),
        status.stack.stats.max_depth
    );
    if let Some(sample) = status.memory.latest_sample {
        println!(
            "last sample: heap {:.1}% ({} bytes), level {}",
            sample.heap_percent * 100.0,
            sample.heap_used,
            sample.level
        );
    }
    Ok(())
}

fn log_event(event: &GuardianEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event = event.name(), %json, "guardian event"),
        Err(_) => info!(event = event.name(), "guardian event"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check { config }) => {
            init_logging(cli.verbose);
            check(&config)
        }
        Some(Commands::Defaults) => {
            println!("{}", GuardianConfig::new().to_json()?);
            Ok(())
        }
        Some(Commands::Snapshot { dir, clear }) => {
            init_logging(cli.verbose);
            snapshot(&dir, clear)
        }
        Some(Commands::Watch { config, seconds }) => {
            let config = load_config(config.as_deref())?;
            init_logging(cli.verbose || config.debug_logging);
            watch(config, seconds).await
        }
        None => {
            println!(
                "Resource Guardian v{} - Use --help for commands",
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_arguments() {
        let cli = Cli::try_parse_from(["guardian", "-v", "watch", "--seconds", "5"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Watch { config, seconds }) => {
                assert!(config.is_none());
                assert_eq!(seconds, 5);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_load_config_reads_debug_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.json");
        std::fs::write(&path, r#"{ "debug_logging": true }"#).unwrap();

        assert!(load_config(Some(&path)).unwrap().debug_logging);
        assert!(!load_config(None).unwrap().debug_logging);
        assert!(load_config(Some(&dir.path().join("absent.json"))).is_err());
    }
}
