//! wxrelay daemon entry point.
//!
//! Loads the configuration, brings the supervisor up and runs until a
//! termination signal arrives.

use std::path::PathBuf;

use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{error, info};

use wxrelay_daemon::{DaemonConfig, Result, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting wxrelay daemon");

    // Optional config path as the first argument; the data-dir default
    // otherwise.
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => DaemonConfig::load_from(&path),
        None => DaemonConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            error!("expected config at {:?}", DaemonConfig::default_path());
            return Err(e);
        }
    };

    info!(
        instances = config.instances.len(),
        fixed_listeners = config.fixed_listeners.len(),
        "configuration loaded"
    );

    let supervisor = Supervisor::new(config)?;
    supervisor.start().await?;
    info!("daemon ready");

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let fatal = std::sync::Arc::clone(supervisor.fatal());
    let outcome = tokio::select! {
        signal = signals.next() => {
            if let Some(signal) = signal {
                info!(signal, "termination signal received");
            }
            Ok(())
        }
        message = fatal.wait() => {
            error!("fatal store failure: {message}");
            Err(wxrelay_daemon::DaemonError::Other(message))
        }
    };
    handle.close();

    supervisor.stop().await;
    outcome
}
