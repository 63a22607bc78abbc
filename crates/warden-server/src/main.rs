//! `wardend`: the Warden daemon entry point.
//!
//! Loads configuration, initializes structured logging, opens the event
//! store, runs background key maintenance and shuts down gracefully on
//! SIGTERM/SIGINT.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use warden_server::background::{self, InstanceSource};
use warden_server::{config, start, StartupError};
use warden_types::InstanceId;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("WARDEN_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("warden.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wardend: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    match run(&config).await {
        Ok(()) => {
            tracing::info!("wardend shut down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "wardend failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &config::Config) -> Result<(), StartupError> {
    let services = start(config)?;
    tracing::info!(path = %config.database.path, "event store ready");

    let maintenance = services.key_maintainer.clone().map(|maintainer| {
        let instances: Vec<InstanceId> = config
            .keys
            .instances
            .iter()
            .map(|i| InstanceId::new(i.trim()))
            .filter(|i| !i.is_empty())
            .collect();
        let source = if instances.is_empty() {
            InstanceSource::Discovered(services.store.clone())
        } else {
            InstanceSource::Configured(instances)
        };
        tokio::spawn(background::start_key_maintenance_task(
            maintainer,
            source,
            config.keys.usages.clone(),
            config.keys.interval(),
        ))
    });
    if maintenance.is_none() {
        tracing::info!("key maintenance disabled");
    }

    shutdown_signal().await;

    if let Some(task) = maintenance {
        task.abort();
    }
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
