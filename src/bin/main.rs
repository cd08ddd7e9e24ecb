use std::sync::Arc;
use swift_pipeline_orchestrator::{
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

    let config = PipelineConfig::from_env()?;
    let generator = select_generator()?;

    // Batch file from argv, otherwise the built-in sample
    let batch = match std::env::args().nth(1) {
        Some(path) => load_batch(&path)?,
        None => sample_batch(),
    };

    info!(messages = batch.len(), "Message pipeline starting");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            trigger.cancel();
        }
    });

    let pipeline = Pipeline::new(config, generator);
    let report = pipeline.run(batch, &cancel).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn select_generator() -> Result<Arc<dyn TextGenerator>, Box<dyn std::error::Error>> {
    match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(Arc::new(GeminiClient::new(key)?)),
        _ => {
            warn!("GEMINI_API_KEY not set, running with offline generator");
            Ok(Arc::new(ScriptedGenerator::offline()))
        }
    }
}

/// Accepts either a bare array or `{ "messages": [...] }`
fn load_batch(path: &str) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error>> {
    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    match raw {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("messages") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(format!("{}: expected a `messages` array", path).into()),
        },
        _ => Err(format!("{}: expected a JSON array of messages", path).into()),
    }
}

fn sample_batch() -> Vec<serde_json::Value> {
    let message = |id: &str, kind: &str, amount: &str, sender: &str, receiver: &str, info: &str| {
        serde_json::json!({
            "message_id": id,
            "message_type": kind,
            "reference": format!("REF{}", id),
            "amount": amount,
            "sender_bic": sender,
            "receiver_bic": receiver,
            "remittance_info": info,
        })
    };

    vec![
        message("0001", "MT103", "5000.50 USD", "CHASUS33XXX", "DEUTDEFFXXX", "Invoice 4471"),
        message("0002", "MT202", "1250.00 EUR", "BNPAFRPPXXX", "BARCGB22XXX", "Interbank cover"),
        message("0003", "MT103", "875.20 SGD", "DBSSSGSGXXX", "HSBCHKHHXXX", "Consulting fees"),
        message("0004", "MT103", "25000.00 USD", "BANKIRTHXXX", "DEUTDEFFXXX", "Urgent transfer"),
        message("0005", "MT103", "3000.00 GBP", "TESTGB2LXXX", "TESTGB2LXXX", "Confidential"),
    ]
}
