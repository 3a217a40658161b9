use analysis_script_orchestrator::{
    audit::AuditLog,
    config::{build_orchestrator, OrchestratorConfig},
    models::Message,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("usage: orchestrator \"<analysis question>\"");
        std::process::exit(2);
    }

    let config = OrchestratorConfig::from_env()?;
    let orchestrator = build_orchestrator(&config, Arc::new(AuditLog::new())).await?;

    info!(model = %config.model, question = %question, "Running orchestrator");

    match orchestrator.run(vec![Message::user(question)], &config.model).await {
        Ok(response) => {
            println!("\n=== ANALYSIS RESULT ===");
            println!("Type: {}", response.response_type);
            println!("Success: {}", response.success);
            println!("Turns: {}", response.turns);
            println!("Tool calls: {}", response.tool_calls.len());
            println!("Failed validations: {}", response.failed_validations);
            if let Some(failure) = &response.failure {
                println!("Failure: {} ({})", failure.kind, failure.message);
            }
            println!("\n{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) if e.is_hard() => {
            eprintln!("Analysis could not complete: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
        Err(e) => {
            eprintln!("Orchestration failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
