//! HTTP server receiving interaction batches from the recorder.
//!
//! This module provides an HTTP server that:
//! - Accepts sample batches via POST /data/store, acknowledges immediately,
//!   then enriches and persists them in the background
//! - Stores enrollment surveys via POST /survey/store
//! - Exposes a paginated read API under /api
//!
//! # Architecture
//!
//! ```text
//! Recorder ──→ POST /data/store ──→ ack ──→ [Emotion Analysis] ──→ interactions
//!          ──→ POST /survey/store ─────────────────────────────→ users
//! ```

pub mod ingest;
pub mod store;

use crate::collector::types::Sample;
use crate::config::ServerSettings;
use axum::{
    extract::{rejection::FormRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;

pub use ingest::{
    AnalysisError, DataProcessor, EmotionDetector, EmotionReading, ExecutableDetector,
};
pub use store::{DocumentStore, Filter, MemoryStore, Page, StoreError, INTERACTIONS, USERS};

#[cfg(feature = "mongo")]
pub use store::MongoStore;

/// Maximum accepted request body.
pub const REQUEST_SIZE_LIMIT: usize = 50 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (port 0 for random)
    pub addr: SocketAddr,
    /// TLS key and certificate, PEM
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl ServerConfig {
    /// Plain HTTP on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            addr: SocketAddr::new(settings.host, settings.port),
            tls: settings.tls_paths(),
        }
    }
}

/// Shared server state
pub struct ServerState {
    store: Arc<dyn DocumentStore>,
    processor: Arc<DataProcessor>,
    ingest: TaskTracker,
}

impl ServerState {
    pub fn new(store: Arc<dyn DocumentStore>, processor: DataProcessor) -> Self {
        Self {
            store,
            processor: Arc::new(processor),
            ingest: TaskTracker::new(),
        }
    }

    /// Wait for every acknowledged batch to be enriched and stored. Batches
    /// accepted after this is called are still waited for.
    pub async fn drain(&self) {
        let pending = self.ingest.len();
        if pending > 0 {
            tracing::info!("Waiting for {} ingest tasks", pending);
        }
        self.ingest.close();
        self.ingest.wait().await;
    }

    /// Build the state described by `settings`: MongoDB when `DB_HOST` is
    /// set (and the `mongo` feature is on), memory otherwise.
    pub async fn from_settings(settings: &ServerSettings) -> anyhow::Result<Self> {
        let detector = settings.emotions_executable.as_ref().map(|exe| {
            Box::new(ExecutableDetector::new(
                exe.clone(),
                settings.scratch_dir.clone(),
            )) as Box<dyn EmotionDetector>
        });
        if detector.is_none() {
            tracing::info!("EMOTIONS_EXECUTABLE not set, emotion analysis disabled");
        }

        let store = Self::open_store(settings).await?;
        Ok(Self::new(store, DataProcessor::new(detector)))
    }

    #[cfg(feature = "mongo")]
    async fn open_store(settings: &ServerSettings) -> anyhow::Result<Arc<dyn DocumentStore>> {
        match &settings.db_host {
            Some(uri) => Ok(Arc::new(MongoStore::connect(uri, &settings.db_name).await?)),
            None => {
                tracing::warn!("DB_HOST not set, documents are kept in memory");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    #[cfg(not(feature = "mongo"))]
    async fn open_store(settings: &ServerSettings) -> anyhow::Result<Arc<dyn DocumentStore>> {
        if settings.db_host.is_some() {
            tracing::warn!("DB_HOST is set but the mongo feature is disabled; using memory");
        } else {
            tracing::warn!("DB_HOST not set, documents are kept in memory");
        }
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// Form body of POST /data/store
#[derive(Debug, Deserialize)]
pub struct StoreForm {
    /// JSON-encoded sample or array of samples
    pub data: String,
}

/// One sample or a batch of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Batch(Vec<Sample>),
    Single(Box<Sample>),
}

impl Incoming {
    fn into_vec(self) -> Vec<Sample> {
        match self {
            Incoming::Batch(samples) => samples,
            Incoming::Single(sample) => vec![*sample],
        }
    }
}

/// Response from the store endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StoreResponse {
    pub done: bool,
    pub errors: Option<Value>,
}

/// Response from the survey endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyResponse {
    pub done: bool,
    pub errors: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Count response
#[derive(Debug, Clone, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn invalid_data(error: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            code: "INVALID_DATA".to_string(),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    tracing::error!("Store query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
            code: "STORE_ERROR".to_string(),
        }),
    )
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /data/store
///
/// Acknowledges as soon as the payload parses. Enrichment and persistence
/// run afterwards; their failures are only logged.
async fn store_data(
    State(state): State<Arc<ServerState>>,
    form: Result<Form<StoreForm>, FormRejection>,
) -> Result<Json<StoreResponse>, ApiError> {
    let Form(form) = form.map_err(|e| invalid_data(format!("Invalid form body: {}", e)))?;
    let samples = serde_json::from_str::<Incoming>(&form.data)
        .map_err(|e| invalid_data(format!("Invalid sample data: {}", e)))?
        .into_vec();

    tracing::debug!("Received {} samples", samples.len());

    let processor = state.processor.clone();
    let store = state.store.clone();
    state.ingest.spawn(async move {
        let samples = processor.process(samples).await;
        let docs = match samples
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
        {
            Ok(docs) => docs,
            Err(e) => {
                tracing::error!("Failed to encode samples: {}", e);
                return;
            }
        };
        if docs.is_empty() {
            return;
        }
        match store.insert_many(INTERACTIONS, docs).await {
            Ok(n) => tracing::info!("Saved to database: inserted {} documents", n),
            Err(e) => tracing::error!("Failed to save interactions: {}", e),
        }
    });

    Ok(Json(StoreResponse {
        done: true,
        errors: None,
    }))
}

/// POST /survey/store
async fn store_survey(
    State(state): State<Arc<ServerState>>,
    Form(answers): Form<HashMap<String, String>>,
) -> Json<SurveyResponse> {
    let doc = Value::Object(
        answers
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );

    match state.store.insert_one(USERS, doc).await {
        Ok(user_id) => {
            tracing::info!("Enrolled user {}", user_id);
            Json(SurveyResponse {
                done: true,
                errors: Value::Array(Vec::new()),
                user_id: Some(user_id),
            })
        }
        Err(e) => {
            tracing::error!("Failed to save survey: {}", e);
            Json(SurveyResponse {
                done: false,
                errors: Value::String(e.to_string()),
                user_id: None,
            })
        }
    }
}

async fn list(
    state: &ServerState,
    collection: &str,
    filter: Filter,
    page: Page,
) -> Result<Json<Vec<Value>>, ApiError> {
    state
        .store
        .find(collection, &filter, page)
        .await
        .map(Json)
        .map_err(store_error)
}

async fn count(
    state: &ServerState,
    collection: &str,
    filter: Filter,
) -> Result<Json<CountResponse>, ApiError> {
    state
        .store
        .count(collection, &filter)
        .await
        .map(|count| Json(CountResponse { count }))
        .map_err(store_error)
}

/// GET /api/users
async fn users(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, USERS, Filter::All, Page::ALL).await
}

/// GET /api/users/:skip-:limit
async fn users_page(
    State(state): State<Arc<ServerState>>,
    Path(range): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, USERS, Filter::All, Page::parse(&range)).await
}

/// GET /api/interactions
async fn interactions(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, INTERACTIONS, Filter::All, Page::ALL).await
}

/// GET /api/interactions/count
async fn interactions_count(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<CountResponse>, ApiError> {
    count(&state, INTERACTIONS, Filter::All).await
}

/// GET /api/interactions/:skip-:limit
async fn interactions_page(
    State(state): State<Arc<ServerState>>,
    Path(range): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, INTERACTIONS, Filter::All, Page::parse(&range)).await
}

/// GET /api/user/:id
async fn user(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, USERS, Filter::Id(id), Page::ALL).await
}

/// GET /api/user/:id/interactions
async fn user_interactions(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, INTERACTIONS, Filter::UserId(id), Page::ALL).await
}

/// GET /api/user/:id/interactions/count
async fn user_interactions_count(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    count(&state, INTERACTIONS, Filter::UserId(id)).await
}

/// GET /api/user/:id/interactions/:skip-:limit
async fn user_interactions_page(
    State(state): State<Arc<ServerState>>,
    Path((id, range)): Path<(String, String)>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, INTERACTIONS, Filter::UserId(id), Page::parse(&range)).await
}

/// GET /api/interaction/:id
async fn interaction(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    list(&state, INTERACTIONS, Filter::Id(id), Page::ALL).await
}

/// Build the router over `state`.
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/users", get(users))
        .route("/users/:range", get(users_page))
        .route("/interactions", get(interactions))
        .route("/interactions/count", get(interactions_count))
        .route("/interactions/:range", get(interactions_page))
        .route("/user/:id", get(user))
        .route("/user/:id/interactions", get(user_interactions))
        .route("/user/:id/interactions/count", get(user_interactions_count))
        .route("/user/:id/interactions/:range", get(user_interactions_page))
        .route("/interaction/:id", get(interaction));

    Router::new()
        .route("/health", get(health))
        .route("/data/store", post(store_data))
        .route("/survey/store", post(store_survey))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(REQUEST_SIZE_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_with_state(
    config: ServerConfig,
    state: Arc<ServerState>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    if let Some((key, cert)) = &config.tls {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        let handle = axum_server::Handle::new();
        let server = axum_server::bind_rustls(config.addr, tls).handle(handle.clone());

        tokio::spawn(async move {
            if let Err(e) = server.serve(app.into_make_service()).await {
                tracing::error!("Server error: {}", e);
            }
        });

        let actual_addr = handle
            .listening()
            .await
            .ok_or_else(|| anyhow::anyhow!("TLS server failed to bind {}", config.addr))?;
        tracing::info!("Interaction server listening on https://{}", actual_addr);

        tokio::spawn(async move {
            let _ = shutdown_rx.await;
            tracing::info!("Server shutdown signal received");
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        return Ok((actual_addr, shutdown_tx));
    }

    let listener = TcpListener::bind(config.addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Interaction server listening on http://{}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
