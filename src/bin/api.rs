use finance_chat_engine::{
    api::start_server,
    assistant::{HttpAssistantClient, ReasoningService},
    dispatcher::ToolDispatcher,
    engine::ChatEngine,
    records::RecordMutator,
    store::{
        CategoryStore, InMemoryStore, LoggingGamificationSink, PgStore, ProfileStore, RecordStore,
        UsageStore,
    },
    usage::UsageMeter,
};
use std::sync::Arc;
use tracing::{info, warn};

struct Stores {
    records: Arc<dyn RecordStore>,
    categories: Arc<dyn CategoryStore>,
    profiles: Arc<dyn ProfileStore>,
    usage: Arc<dyn UsageStore>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_key = std::env::var("ASSISTANT_API_KEY").unwrap_or_else(|_| {
        eprintln!("⚠️  ASSISTANT_API_KEY not set in .env");
        "mock_key".to_string()
    });
    let agent_id = std::env::var("ASSISTANT_AGENT_ID").unwrap_or_else(|_| {
        eprintln!("⚠️  ASSISTANT_AGENT_ID not set in .env");
        "agent_mock".to_string()
    });
    let base_url = std::env::var("ASSISTANT_BASE_URL").ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Finance Chat Engine - API Server");
    info!("📍 Port: {}", api_port);

    let stores = build_stores()?;

    let service: Arc<dyn ReasoningService> =
        Arc::new(HttpAssistantClient::new(api_key, base_url));

    let mutator = RecordMutator::new(
        Arc::clone(&stores.records),
        Arc::clone(&stores.categories),
        Arc::new(LoggingGamificationSink),
    );
    let dispatcher = ToolDispatcher::new(
        mutator,
        Arc::clone(&stores.records),
        Arc::clone(&stores.categories),
        Arc::clone(&stores.profiles),
    );
    let engine = Arc::new(ChatEngine::new(
        service,
        Arc::clone(&stores.profiles),
        dispatcher,
        UsageMeter::new(Arc::clone(&stores.usage)),
        agent_id,
    ));

    info!("✅ Engine initialized");
    info!("📡 Starting API server...");

    start_server(engine, api_port).await?;

    Ok(())
}

fn build_stores() -> Result<Stores, Box<dyn std::error::Error>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            info!("Using Postgres store");
            let store = Arc::new(PgStore::connect_lazy(&url)?);
            Ok(Stores {
                records: Arc::clone(&store) as Arc<dyn RecordStore>,
                categories: Arc::clone(&store) as Arc<dyn CategoryStore>,
                profiles: Arc::clone(&store) as Arc<dyn ProfileStore>,
                usage: store as Arc<dyn UsageStore>,
            })
        }
        Err(_) => {
            warn!("DATABASE_URL not set, falling back to in-memory store");
            let store = Arc::new(InMemoryStore::new());
            Ok(Stores {
                records: Arc::clone(&store) as Arc<dyn RecordStore>,
                categories: Arc::clone(&store) as Arc<dyn CategoryStore>,
                profiles: Arc::clone(&store) as Arc<dyn ProfileStore>,
                usage: store as Arc<dyn UsageStore>,
            })
        }
    }
}
