//! # HTTP server
//!
//! One router for every role. Which routes exist depends on the node's
//! configuration:
//!
//! | role     | public insert | public select | `/internal/insert`, `/internal/can_write`, `/internal/select/query` |
//! |----------|---------------|---------------|-----------------------------------------------|
//! | storage  | unless disabled | unless disabled | yes |
//! | insert   | yes           | no            | no  |
//! | select   | no            | yes           | no  |
//!
//! `/health`, `/metrics` and `/internal/force_flush` are always served.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use lh_store::{Storage, StorageConfig, StoreError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{NodeConfig, Role};
use crate::error::BackendError;
use crate::topology::Topology;
use crate::{insert, metrics, select};

// =============================================================================
// State
// =============================================================================

pub struct AppState {
    pub config: NodeConfig,
    pub topology: Topology,
    /// Present on storage nodes only.
    pub storage: Option<Arc<Storage>>,
}

impl AppState {
    /// Opens local storage for a storage node, or connects the static peer
    /// list for an insert/select node.
    pub fn new(config: NodeConfig) -> Result<Self, StoreError> {
        match config.role() {
            Role::Storage => {
                let storage = Arc::new(Storage::open(StorageConfig {
                    path: config.data_path.clone(),
                    retention: config.retention,
                    max_disk_bytes: config.max_disk_bytes,
                    read_only: config.read_only,
                })?);
                Ok(Self {
                    topology: Topology::local(storage.clone()),
                    storage: Some(storage),
                    config,
                })
            }
            Role::Router => {
                tracing::info!(
                    "using {} storage nodes with replication factor {}: {}",
                    config.storage_nodes.len(),
                    config.replication_factor,
                    config.storage_nodes.join(",")
                );
                Ok(Self {
                    topology: Topology::remote(&config.storage_nodes, config.replication_factor),
                    storage: None,
                    config,
                })
            }
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus))
        .route("/internal/force_flush", get(force_flush).post(force_flush));

    if state.config.insert_enabled {
        app = app
            .route("/insert/opentelemetry/v1/logs", post(insert::handlers::opentelemetry))
            .route("/insert/jsonline", post(insert::handlers::jsonline))
            .route("/insert/native", post(insert::handlers::native));
    }
    if state.config.select_enabled {
        app = app
            .route("/select/logsql/query", get(select::handlers::query).post(select::handlers::query))
            .route("/select/logsql/facets", get(select::handlers::facets).post(select::handlers::facets))
            .route(
                "/select/logsql/stats_query",
                get(select::handlers::stats_query).post(select::handlers::stats_query),
            )
            .route(
                "/select/logsql/stats_query_range",
                get(select::handlers::stats_query_range).post(select::handlers::stats_query_range),
            );
    }
    if state.storage.is_some() {
        app = app
            .route("/internal/insert", post(insert::handlers::internal_insert))
            .route("/internal/can_write", get(insert::handlers::internal_can_write))
            .route("/internal/select/query", post(select::handlers::internal_query));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.storage.as_ref().map(|s| s.stats());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(stats),
    )
}

/// Makes every written row searchable: locally on a storage node, on all
/// storage nodes otherwise.
async fn force_flush(State(state): State<Arc<AppState>>) -> Result<StatusCode, (StatusCode, String)> {
    state.topology.force_flush().await.map_err(|e: BackendError| {
        tracing::warn!("force flush failed: {}", e);
        (e.status(), e.to_string())
    })?;
    Ok(StatusCode::OK)
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A running node.
pub struct Node {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    flusher: Option<JoinHandle<()>>,
}

/// Binds the listener, starts serving and, on storage nodes, the periodic
/// flush task. `127.0.0.1:0` picks a free port; see [`Node::addr`].
pub async fn start(config: NodeConfig) -> Result<Node, ServeError> {
    let listen_addr = config.listen_addr.clone();
    let flush_interval = config.flush_interval;
    let state = Arc::new(AppState::new(config)?);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: listen_addr.clone(),
            source,
        })?;
    let addr = listener.local_addr().map_err(|source| ServeError::Bind {
        addr: listen_addr,
        source,
    })?;

    let flusher = state.storage.clone().map(|storage| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                interval.tick().await;
                let s = storage.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || s.force_flush()).await {
                    tracing::error!("periodic flush failed: {}", e);
                }
            }
        })
    });

    let (tx, rx) = oneshot::channel::<()>();
    let app = router(state.clone());
    let server = tokio::spawn(async move {
        let res = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = res {
            tracing::error!("server error: {}", e);
        }
    });

    tracing::info!("started server at http://{}/", addr);
    Ok(Node {
        addr,
        state,
        shutdown: Some(tx),
        server,
        flusher,
    })
}

impl Node {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stops accepting connections, drains in-flight requests and flushes
    /// local storage.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.server).await {
            tracing::error!("server task failed: {}", e);
        }
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        if let Some(storage) = &self.state.storage {
            match storage.close() {
                Ok(()) => tracing::info!("storage closed"),
                Err(e) => tracing::error!("cannot close storage: {}", e),
            }
        }
        tracing::info!("stopped server at http://{}/", self.addr);
    }
}
