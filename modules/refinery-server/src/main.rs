use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llm_client::{Llm, LlmClient};
use refinery_common::Config;
use refinery_engine::heartbeat;
use refinery_engine::mirror::{ChatSender, Sender};
use refinery_engine::{ContentStore, Coordinator};

mod rest;

/// A cached rendering of the unfiltered first signals page.
pub struct CachedPage {
    pub filled_at: Instant,
    /// Store signal generation at fill time; any new signal invalidates.
    pub generation: u64,
    pub limit: u32,
    pub body: serde_json::Value,
}

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: ContentStore,
    pub rate_limiter: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    pub signals_cache: Mutex<Option<CachedPage>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("refinery=info".parse()?))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration error");
            std::process::exit(1);
        }
    };
    config.log_redacted();

    let store = match ContentStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Storage initialization failed");
            std::process::exit(2);
        }
    };

    let llm: Arc<dyn Llm> =
        Arc::new(LlmClient::new(&config.llm_api_key, &config.llm_endpoint));
    let sender: Arc<dyn Sender> = Arc::new(ChatSender::new(
        &config.chat_send_token,
        &config.chat_send_endpoint,
    ));
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        config.clone(),
        llm,
        sender,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let heartbeat_task = tokio::spawn(heartbeat::run_loop(coordinator.clone(), shutdown_rx));

    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        store,
        rate_limiter: Mutex::new(HashMap::new()),
        signals_cache: Mutex::new(None),
    });

    let app = Router::new()
        // Liveness
        .route("/", get(rest::health))
        .route("/health", get(rest::health))
        // Ingestion
        .route("/webhook/chat", post(rest::webhook_chat))
        .route("/webhook/{kind}", post(rest::webhook_kind))
        .route("/ingest", post(rest::ingest))
        // Read API
        .route("/signals", get(rest::signals))
        .route("/signals/export", get(rest::signals_export))
        .route("/signals/sources", get(rest::signal_sources))
        .route("/stats", get(rest::stats))
        // Feed registration
        .route(
            "/sources/feed",
            get(rest::list_feeds).post(rest::add_feed).delete(rest::remove_feed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr, "refinery listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop the heartbeat, then drain any in-flight tick.
    let _ = shutdown_tx.send(true);
    coordinator.shutdown().await;
    let _ = heartbeat_task.await;

    info!("refinery stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
