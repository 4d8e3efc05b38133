/*!
Dynamic firewall daemon
*/

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command, crate_version};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dynamic_firewall::{Engine, FirewallConfig};

const CONTAINER_CONFIG: &str = "/app/config/config.toml";

type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn default_config_path() -> PathBuf {
    let container = PathBuf::from(CONTAINER_CONFIG);
    if container.exists() {
        return container;
    }
    dirs::config_dir()
        .map(|dir| dir.join("dynamic-firewall").join("config.toml"))
        .unwrap_or(container)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> AppResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => info!("Received interrupt"),
        _ = terminate.recv() => info!("Received terminate"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> AppResult<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received interrupt");
    Ok(())
}

async fn run(config_path: PathBuf, once: bool) -> AppResult<bool> {
    let config_found = config_path.exists();
    let config = FirewallConfig::load(&config_path)?;

    init_logging(&config.global.log_level);
    if config_found {
        info!("Loaded configuration from {}", config_path.display());
    } else {
        warn!("Config file not found: {}, using defaults", config_path.display());
    }

    let mut engine = Engine::from_config(&config)?;

    if once {
        let report = engine.run_once().await;
        return Ok(!report.is_failure());
    }

    // Listen before the first cycle so a signal during it is not lost
    let signal = tokio::spawn(wait_for_shutdown_signal());

    engine.start().await;
    info!("Engine running, press Ctrl-C to stop");

    match signal.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to listen for shutdown signals: {}", e),
        Err(e) => warn!("Signal listener ended abnormally: {}", e),
    }

    engine.shutdown().await;
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("dynamic-firewall")
        .version(crate_version!())
        .about("Sync malicious IPs from threat-intelligence feeds to router firewalls")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run one collection and sync, then exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let once = matches.get_flag("once");

    match run(config_path, once).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("Run finished with errors");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Fatal error: {}", e);
            ExitCode::FAILURE
        }
    }
}
