use analysis_script_orchestrator::{
    api::start_server,
    audit::AuditLog,
    config::{build_orchestrator, OrchestratorConfig},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;

    info!("Analysis Script Orchestrator - API Server");
    info!("Port: {}", config.api_port);

    let orchestrator = Arc::new(build_orchestrator(&config, Arc::new(AuditLog::new())).await?);

    info!("Orchestrator initialized");

    start_server(orchestrator, config.model.clone(), config.api_port).await?;

    Ok(())
}
