mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use conductor_core::{Coordinator, LogStore, PermissionBroker, ProcessTransportFactory, SessionRegistry};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = conductor_config::load(cli.config.as_deref()).context("loading config")?;
    let config = cli.apply_overrides(config);

    init_logging(cli.verbose, &config.debug);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).context("serializing config")?);
            return Ok(());
        }
        Some(Commands::ListSessions) => {
            return list_sessions(&config).await;
        }
        Some(Commands::Server) | None => {}
    }

    run_server(config).await
}

async fn list_sessions(config: &conductor_config::ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.http.data_dir)
        .with_context(|| format!("creating data directory {}", config.http.data_dir.display()))?;
    let registry = SessionRegistry::new(&config.http.data_dir);
    registry
        .reconcile_after_restart()
        .await
        .context("reading session records")?;

    let sessions = registry.list(None).await;
    if sessions.is_empty() {
        println!("No sessions recorded in {}", config.http.data_dir.display());
        return Ok(());
    }

    println!("{:<38}  {:<12}  {:<9}  {:<24}  NAME", "ID", "STATE", "PROCESSING", "PROJECT");
    for s in &sessions {
        println!(
            "{:<38}  {:<12}  {:<9}  {:<24}  {}",
            s.id,
            format!("{:?}", s.state),
            s.is_processing,
            s.project_id,
            s.name,
        );
    }
    println!("\nTotal: {} session(s)", sessions.len());
    Ok(())
}

async fn run_server(config: conductor_config::ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.http.data_dir)
        .with_context(|| format!("creating data directory {}", config.http.data_dir.display()))?;

    let registry = Arc::new(SessionRegistry::new(&config.http.data_dir));
    let log_store = Arc::new(LogStore::new(&config.http.data_dir));
    let broker = Arc::new(PermissionBroker::new());
    let transport_factory = Arc::new(ProcessTransportFactory {
        command: config.agent.command.clone(),
        extra_args: config.agent.extra_args.clone(),
    });

    let coordinator = Arc::new(Coordinator::new(
        registry,
        log_store,
        broker,
        transport_factory,
    ));
    coordinator
        .reconcile_after_restart()
        .await
        .context("reconciling sessions left running by a previous process")?;

    let state = conductor_gateway::GatewayState {
        coordinator: coordinator.clone(),
        keepalive_secs: config.http.keepalive_secs,
    };
    let app = conductor_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("binding {}", config.http.bind))?;
    info!(bind = %config.http.bind, "conductor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
        .context("server loop")?;

    info!("conductor shut down cleanly");
    Ok(())
}

/// Waits for SIGINT/SIGTERM, then drains every live session to `paused`
/// before letting axum's graceful shutdown finish (§4.E, §4.I).
async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                coordinator.shutdown().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received, draining sessions");
    coordinator.shutdown().await;
}

fn init_logging(verbosity: u8, debug: &conductor_config::DebugConfig) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    for (enabled, target) in [
        (debug.adapter, "conductor_core::adapter"),
        (debug.broker, "conductor_core::broker"),
        (debug.coordinator, "conductor_core::coordinator"),
        (debug.gateway, "conductor_gateway"),
    ] {
        if enabled {
            if let Ok(directive) = format!("{target}=debug").parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
