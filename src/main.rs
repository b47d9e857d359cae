// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use hostinfo_telemetry::config::load_config;
use hostinfo_telemetry::metrics::METRICS;
use hostinfo_telemetry::Telemetry;

use log::info;
use std::time::Duration;
use tokio::time::sleep;

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Standalone host for the telemetry subsystem.
//
// Responsibilities:
// - Load configuration
// - Initialize logging
// - Start the cache and the configured collectors
// - Report runtime metrics
// - Shut everything down cleanly on ctrl-c / SIGTERM
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file contains secrets (pre-auth key, pool key).
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = load_config(&path)?;

    let default_level = if config.debug_log() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("Loaded configuration from {}", path);

    let telemetry = Telemetry::start(config.telemetry_settings()).await;

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    let reporter = tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(60)).await;
            info!(target: "metrics", "{}", METRICS.summary());
        }
    });

    wait_for_signal().await;
    info!("Shutdown requested");

    reporter.abort();
    telemetry.shutdown().await;

    info!("Stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
