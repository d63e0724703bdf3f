mod logging;
mod routes;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use lawhelp_core::{
    chat::{ChatLoop, ChatPolicy},
    completion::CompletionBackend,
    config::Config,
    db::Db,
    fallback::LawFacts,
    session::SessionTable,
    storage::{self, ObjectStore},
};
use lawhelp_llm::{OllamaBackend, OpenAiBackend};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::logging::{BroadcastLayer, LogRing};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub db: Option<Arc<Db>>,
    pub store: Option<Arc<dyn ObjectStore>>,
    /// The configured backend, or why it cannot be used.
    pub completion: Result<Arc<dyn CompletionBackend>, String>,
    /// Present only when `completion` is usable.
    pub chat: Option<Arc<ChatLoop>>,
    pub sessions: SessionTable,
    pub law_facts: usize,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: LogRing,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring: LogRing = Arc::default();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "lawhelp_server=info,lawhelp_core=info,lawhelp_llm=info,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Arc::new(Config::from_env()?);

    let db = connect_db(&config).await;

    let store: Option<Arc<dyn ObjectStore>> = match storage::from_config(&config).await {
        Ok(Some(store)) => {
            info!(backend = store.name(), bucket = %config.storage_bucket, "object storage ready");
            Some(Arc::from(store))
        }
        Ok(None) => {
            warn!("object storage credentials not set; signing is disabled");
            None
        }
        Err(e) => {
            error!("object storage unavailable: {e:#}");
            None
        }
    };

    let completion = build_backend(&config);
    match &completion {
        Ok(backend) => info!(backend = backend.name(), model = %config.model, "completion backend ready"),
        Err(reason) => warn!("completion backend unavailable: {reason}"),
    }

    let facts = Arc::new(LawFacts::load(&config.law_facts_path));
    let sessions = SessionTable::new();
    let chat = completion.as_ref().ok().map(|backend| {
        Arc::new(ChatLoop::new(
            sessions.clone(),
            Arc::clone(backend),
            Arc::clone(&facts),
            ChatPolicy::from_config(&config),
        ))
    });

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        db,
        store,
        completion,
        chat,
        sessions,
        law_facts: facts.len(),
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

pub(crate) fn app(state: Arc<AppState>) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_mb.saturating_mul(1024 * 1024))
        .unwrap_or(usize::MAX);

    Router::new()
        // Health
        .route("/", get(routes::root))
        .route("/api/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        // Settings
        .route("/api/settings", get(routes::get_settings).post(routes::post_settings))
        .route("/api/settings/", get(routes::get_settings).post(routes::post_settings))
        // Documents
        .route("/api/save", post(routes::save_document))
        .route("/api/save/:id", get(routes::get_document))
        .route("/api/generate", post(routes::generate_document))
        .route("/api/upload", post(routes::upload_document))
        .route("/api/upload/", post(routes::upload_document))
        .route("/api/sign", post(routes::sign_document))
        .route("/api/sign/", post(routes::sign_document))
        // Chat
        .route("/api/chat", get(ws::chat_ws))
        // Logs
        .route("/api/logs", get(routes::sse_logs))
        .route("/api/logs/recent", get(routes::recent_logs))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn connect_db(config: &Config) -> Option<Arc<Db>> {
    if !config.has_database() {
        warn!("DATABASE_URL not set; document and settings routes are disabled");
        return None;
    }
    let db = match Db::connect(&config.database_url, config.db_pool_size) {
        Ok(db) => db,
        Err(e) => {
            error!("database unavailable: {e:#}");
            return None;
        }
    };
    // The database may still be starting; routes retry on each request.
    match db.migrate().await {
        Ok(()) => info!("database schema ready"),
        Err(e) => warn!("database migration failed, continuing: {e:#}"),
    }
    Some(Arc::new(db))
}

fn build_backend(config: &Config) -> Result<Arc<dyn CompletionBackend>, String> {
    if let Some(reason) = config.completion_misconfiguration() {
        return Err(reason);
    }
    match config.backend.as_str() {
        "ollama" => Ok(Arc::new(
            OllamaBackend::new(&config.ollama_url, &config.model)
                .with_timeout(config.completion_timeout_s),
        )),
        _ => OpenAiBackend::new(
            &config.openai_api_key,
            &config.openai_base_url,
            &config.model,
            config.completion_timeout_s,
        )
        .map(|b| Arc::new(b) as Arc<dyn CompletionBackend>)
        .map_err(|e| format!("{e:#}")),
    }
}
