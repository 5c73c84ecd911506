//! Campaign Execution Controller — drives email campaigns from draft to
//! completion on top of an n8n-style automation engine.
//!
//! Main entry point that wires the controller, starts the scheduler and
//! serves the REST API.

use campaign_api::ApiServer;
use campaign_automation::{AutomationEngine, InMemoryEngine, N8nRestEngine};
use campaign_core::config::AppConfig;
use campaign_management::{ExecutionScheduler, ManagementState};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-controller")]
#[command(about = "Campaign execution controller for n8n-driven email flows")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_CONTROLLER__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_CONTROLLER__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "CAMPAIGN_CONTROLLER__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Automation engine base URL (overrides config)
    #[arg(long, env = "CAMPAIGN_CONTROLLER__ENGINE__BASE_URL")]
    engine_url: Option<String>,

    /// Use the in-process engine instead of a live n8n instance
    #[arg(long, default_value_t = false)]
    in_memory_engine: bool,

    /// Serve the API without running the execution scheduler
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_controller=info,campaign_management=info,campaign_automation=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign controller starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if let Some(url) = cli.engine_url {
        config.engine.webhook_base_url = url.clone();
        config.engine.base_url = url;
    }
    if cli.in_memory_engine {
        config.engine.in_memory = true;
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        engine_url = %config.engine.base_url,
        in_memory_engine = config.engine.in_memory,
        scheduler = config.scheduler.enabled,
        "Configuration loaded"
    );

    let engine: Arc<dyn AutomationEngine> = if config.engine.in_memory {
        warn!("Using the in-memory automation engine; workflows are not persisted");
        Arc::new(InMemoryEngine::new())
    } else {
        Arc::new(N8nRestEngine::new(&config.engine)?)
    };

    let management = ManagementState::new(&config, engine);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if config.scheduler.enabled {
        let scheduler = ExecutionScheduler::new(management.controller.clone(), config.scheduler.clone());
        Some(scheduler.spawn(shutdown_rx))
    } else {
        info!("Execution scheduler disabled");
        None
    };

    let api_server = ApiServer::new(config.clone(), management);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Campaign controller is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server
        .start_http(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }

    info!("Campaign controller stopped");
    Ok(())
}
