use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::services::audit::{AuditSink, SupabaseAuditSink, TracingAuditSink};
use appointment_cell::store::{
    AppointmentStore, ConsentDirectory, InMemorySchedulingStore, SupabaseSchedulingStore,
};
use appointment_cell::{SchedulingService, SchedulingSettings};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic scheduling API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    let settings = SchedulingSettings::from_config(&config)
        .map_err(|e| anyhow::anyhow!("invalid scheduling configuration: {}", e))?;

    let scheduling = Arc::new(build_scheduling(&config, settings));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(config.clone(), scheduling)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid BIND_ADDR '{}'", config.bind_addr))?;
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn build_scheduling(config: &AppConfig, settings: SchedulingSettings) -> SchedulingService {
    if config.uses_supabase_store() {
        info!("Using Supabase appointment store at {}", config.supabase_url);
        let client = Arc::new(SupabaseClient::new(config));
        let store = Arc::new(SupabaseSchedulingStore::new(
            client.clone(),
            config.supabase_anon_key.clone(),
        ));
        let audit: Arc<dyn AuditSink> = Arc::new(SupabaseAuditSink::new(
            client,
            config.supabase_anon_key.clone(),
        ));
        let consents: Arc<dyn ConsentDirectory> = store.clone();
        let store: Arc<dyn AppointmentStore> = store;
        SchedulingService::new(store, consents, audit, settings)
    } else {
        warn!("Using in-memory appointment store; data is lost on restart");
        let store = Arc::new(InMemorySchedulingStore::new());
        let consents: Arc<dyn ConsentDirectory> = store.clone();
        let store: Arc<dyn AppointmentStore> = store;
        SchedulingService::new(store, consents, Arc::new(TracingAuditSink), settings)
    }
}
