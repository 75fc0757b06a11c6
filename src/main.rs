use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use nl_sql::config::{AppConfig, CliArgs};
use nl_sql::db::keys::KeyManager;
use nl_sql::db::schema_cache::SchemaCache;
use nl_sql::db::store::Store;
use nl_sql::engine::Pipeline;
use nl_sql::ingest::{IngestManager, IngestMode};
use nl_sql::util::logging::init_tracing;
use nl_sql::web;
use nl_sql::web::handlers::api::AskResponse;
use nl_sql::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = AppConfig::new(&args)?;
    init_tracing(config.log_format);

    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    let store = Arc::new(Store::open(&config.database.path)?);
    let cache = Arc::new(SchemaCache::new(config.database.cache_schema));

    info!("Initializing LLM backend: {} ({})", config.llm.backend, config.llm.model);
    let model = nl_sql::llm::from_config(&config.llm)?;

    let pipeline = Arc::new(Pipeline::from_config(
        Arc::clone(&store),
        Arc::clone(&cache),
        model,
        &config,
    ));
    let ingest = IngestManager::new(Arc::clone(&store), Arc::clone(&cache));

    for path in &args.ingest {
        for table in ingest.ingest_path(path, IngestMode::Skip).await? {
            info!("{:?} table '{}' ({} rows)", table.status, table.table, table.rows);
        }
    }

    if let Some(question) = &args.ask {
        let envelope = match pipeline.ask(question).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Question failed: {}", e);
                eprintln!("{}", e.user_message());
                return Err(e.into());
            }
        };

        let output = AskResponse {
            envelope: &envelope,
            outcome: &envelope.outcome,
            recommended_next_questions: &envelope.translation.recommended_next_questions,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let keys = KeyManager::new(Arc::clone(&store), Arc::clone(&cache));
    let app_state = Arc::new(AppState::new(config.clone(), pipeline, ingest, keys, cache));

    // Start the web server
    info!("Starting NL-SQL server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
