use std::sync::Arc;
use swift_pipeline_orchestrator::{
    api::start_server,
    capability::{ScriptedGenerator, TextGenerator},
    config::PipelineConfig,
    gemini::GeminiClient,
    logging::init_tracing,
    pipeline::Pipeline,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();
    init_tracing();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Message Pipeline - API Server");
    info!("Port: {}", api_port);

    let config = PipelineConfig::from_env()?;
    let generator: Arc<dyn TextGenerator> = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Arc::new(GeminiClient::new(key)?),
        _ => {
            warn!("GEMINI_API_KEY not set, running with offline generator");
            Arc::new(ScriptedGenerator::offline())
        }
    };

    let pipeline = Arc::new(Pipeline::new(config, generator));

    // Ctrl-C cancels in-flight batches and stops the listener
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            trigger.cancel();
        }
    });

    info!("Pipeline initialized, starting API server");
    start_server(pipeline, api_port, shutdown).await?;

    Ok(())
}
