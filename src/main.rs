use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate::{
    api, broadcast,
    config::GatewayConfig,
    dispatch::Dispatcher,
    llm,
    state::{
        kv::{FileKv, KvStore, MemoryKv},
        AppState,
    },
    ws::{self, ServerState, SocketRegistry},
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamgate=debug,tower_http=debug,axum=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting streamgate...");

    let config = GatewayConfig::from_env();

    let llm_config = llm::LlmConfig::from_env();
    let llm_manager = match llm_config.build_manager() {
        Ok(manager) => {
            tracing::info!("LLM providers initialized successfully");
            Some(manager)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to initialize LLM providers: {}. Requests will get error frames.",
                e
            );
            None
        }
    };

    let table: Arc<dyn KvStore> = match &config.connection_table_path {
        Some(path) => match FileKv::open(path).await {
            Ok(kv) => {
                tracing::info!("Connection table at {}", path.display());
                Arc::new(kv)
            }
            Err(e) => {
                tracing::error!("Couldn't open connection table {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryKv::new()),
    };

    let sockets = Arc::new(SocketRegistry::default());
    let port = config.port;
    let state = Arc::new(AppState::new(
        config,
        table,
        sockets.clone(),
        llm_manager,
        llm_config,
    ));

    // Rows left behind by dead sockets or a previous process
    broadcast::spawn_connection_sweeper(state.clone());

    let server = ServerState {
        dispatcher: Dispatcher::new(state.clone()),
        sockets,
    };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/models", get(api::list_available_models))
        .route("/api/status", get(api::status))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(server);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Couldn't bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    let cancelled = state.sessions.cancel_all().await;
    tracing::info!("Shut down, cancelled {} sessions", cancelled);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Couldn't listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
