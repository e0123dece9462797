use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing_subscriber::EnvFilter;

use zabbix_bridge::config::BridgeConfig;
use zabbix_bridge::consumer::Consumer;
use zabbix_bridge::emitter::Emitter;
use zabbix_bridge::map_store::{GLOBAL_HOST, MapStore};
use zabbix_bridge::resolver::Resolver;
use zabbix_bridge::sanitize::Sanitizer;
use zabbix_bridge::stats::Counters;
use zabbix_bridge::telemetry;
use zabbix_bridge::zabbix_db::ZabbixDb;

const DEFAULT_CONFIG_PATH: &str = "zabbix_bridge.toml";

enum RunError {
    /// Configuration or dependency problem, exit 1.
    Setup(anyhow::Error),
    /// Unrecoverable stream or downstream failure, exit 2.
    Stream(anyhow::Error),
}

fn setup(e: impl Into<anyhow::Error>) -> RunError {
    RunError::Setup(e.into())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = config_path_from_args();
    let config = match BridgeConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Setup(e)) => {
            tracing::error!("startup failed: {e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Stream(e)) => {
            tracing::error!("unrecoverable stream error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn config_path_from_args() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}

/// Stdout is the metric channel, so log lines go to the configured file,
/// or stderr when none is set.
fn init_logging(config: &BridgeConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("zabbix_bridge={}", config.loglevel))
            .map_err(|e| anyhow::anyhow!("invalid loglevel {:?}: {e}", config.loglevel))?,
    };
    match &config.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("cannot open logfile {path}: {e}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run(config: BridgeConfig) -> Result<(), RunError> {
    tracing::info!(slave_id = config.slave_id, "starting zabbix-bridge");

    let counters = Arc::new(Counters::new());
    let sanitizer = Arc::new(Sanitizer::new(&config.disallow).map_err(setup)?);
    let store = Arc::new(
        MapStore::open(
            &config.map_db_path,
            config.item_refresh_interval_s,
            config.macro_refresh_interval_s,
        )
        .map_err(setup)?,
    );
    tracing::info!("mapping cache opened at {}", config.map_db_path);

    // Fail fast when Zabbix is unreachable or the grants are missing;
    // reconnect logic only starts once the stream is up.
    let db = ZabbixDb::connect(&config.mysql);
    match db.probe_last_itemid().await {
        Ok(Some(itemid)) => tracing::info!(itemid, "zabbix reachable, last known item"),
        Ok(None) => tracing::warn!("zabbix reachable but the items table is empty"),
        Err(e) => return Err(setup(e.context("zabbix database probe failed"))),
    }

    let resolver = Arc::new(
        Resolver::new(
            &config,
            store.clone(),
            db.clone(),
            sanitizer.clone(),
            counters.clone(),
        )
        .map_err(setup)?,
    );

    // Warm the global macro bucket so expansion can fall back to it from
    // the very first row.
    if let Err(e) = resolver.get_or_refresh_macros(GLOBAL_HOST).await {
        tracing::warn!("global macro warmup failed: {e:#}");
    }

    let emitter = Arc::new(Emitter::stdout());
    let (fatal_tx, fatal_rx) = oneshot::channel();
    telemetry::spawn_telemetry(
        store.clone(),
        db.clone(),
        counters.clone(),
        emitter.clone(),
        sanitizer.clone(),
        fatal_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Both the consumer and the telemetry loop write to stdout; a fatal
    // error from either ends the run and maps to the same exit code.
    let consumer = Consumer::new(&config, resolver, emitter, counters);
    let outcome = tokio::select! {
        res = consumer.run(shutdown_rx) => res,
        fatal = fatal_rx => match fatal {
            Ok(e) => Err(e),
            Err(_) => Err(anyhow::anyhow!("telemetry task ended unexpectedly")),
        },
    };
    outcome.map_err(RunError::Stream)?;

    let _ = db.disconnect().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("cannot install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
