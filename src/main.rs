use speechgate::admin::{AdminServer, PKG_NAME, VERSION};
use speechgate::command::CommandProvisioner;
use speechgate::config::{Config, ProvisionerType};
use speechgate::healthcheck::{HealthCheckConfig, HealthChecker};
use speechgate::orchestrator::{Orchestrator, OrchestratorSettings};
use speechgate::provisioner::{ManualProvisioner, SharedProvisioner};
use speechgate::proxy::{ProxyRoutes, ProxyServer};
use speechgate::registry::Registry;
use speechgate::store::StateStore;
use speechgate::supervisor::KeepAliveSupervisor;
use speechgate::upstream::{UpstreamClient, UpstreamConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("speechgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("speechgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator_config = &config.orchestrator;

    let store = match orchestrator_config.state_file_path() {
        Some(path) => {
            info!(path = %path.display(), "Instance history persisted");
            Some(Arc::new(StateStore::new(path)))
        }
        None => {
            warn!("No state file configured, instance history will not survive restarts");
            None
        }
    };
    let registry = Arc::new(Registry::new(store, orchestrator_config.max_instance_age()));

    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig::default())?);
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&upstream),
        HealthCheckConfig {
            path: orchestrator_config.health_path.clone(),
            timeout: orchestrator_config.health_timeout(),
        },
    ));

    let provisioner: SharedProvisioner = match config.provisioner.provisioner_type {
        ProvisionerType::Manual => Arc::new(ManualProvisioner::new()),
        ProvisionerType::Command => Arc::new(CommandProvisioner::from_config(&config.provisioner)?),
    };
    info!(provisioner = provisioner.name(), "Provisioner configured");

    let supervisor = KeepAliveSupervisor::new(
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&provisioner),
        orchestrator_config.keep_alive_interval(),
    );

    let orchestrator = Orchestrator::new(
        OrchestratorSettings::from_config(orchestrator_config),
        config.credentials.clone(),
        registry,
        health,
        provisioner,
        supervisor,
    );

    // Bring back instances from the previous run
    orchestrator.restore().await;

    // Create client-facing server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&orchestrator),
        Arc::clone(&upstream),
        ProxyRoutes::from_config(orchestrator_config),
        shutdown_rx.clone(),
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Create admin server (loopback only)
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&orchestrator),
        upstream,
        shutdown_rx.clone(),
        admin_token,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Release sessions and write the final snapshot
    info!("Stopping keep-alive supervision...");
    orchestrator.shutdown().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting speech gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Server configuration"
    );

    let orchestrator = &config.orchestrator;
    info!(
        max_instance_age_secs = orchestrator.max_instance_age_secs,
        keep_alive_interval_secs = orchestrator.keep_alive_interval_secs,
        resource_preference = %orchestrator.resource_preference,
        failover_on_failure = orchestrator.failover_on_failure,
        "Instance lifecycle settings"
    );
    info!(
        health_path = %orchestrator.health_path,
        speech_path = %orchestrator.speech_path,
        health_timeout_secs = orchestrator.health_timeout_secs,
        speech_timeout_secs = orchestrator.speech_timeout_secs,
        voices_timeout_secs = orchestrator.voices_timeout_secs,
        "Routing settings"
    );
    info!(
        provision_timeout_secs = orchestrator.provision_timeout_secs,
        manual_wait_secs = orchestrator.manual_wait_secs,
        provisioner = ?config.provisioner.provisioner_type,
        "Provisioning settings"
    );
    info!(
        credential_count = config.credentials.len(),
        credentials = ?config.credentials.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        "Configured credentials"
    );
}
