use crate::config::Config;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use beacon_core::{
    AddrInfo, AdvertisementClient, AdvertisementId, AdvertisementStore, BeaconError,
    ContentCatalog, ContextId, ContextResolver, IndexerClient, LedgerStore, NodeDirectory,
    ReconcileOperation, Result, RetrievalNode, SqliteCatalog, SqliteNodeStore, TickReport,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub nodes: Arc<SqliteNodeStore>,
    pub client: Arc<IndexerClient>,
    pub config: Config,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    public_key: String,
    addresses: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    addresses: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    handle: String,
    token: String,
    last_connection: DateTime<Utc>,
    addr_info: Option<AddrInfo>,
    advertise_interval: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    handle: String,
    last_connection: DateTime<Utc>,
    last_advertisement: Option<DateTime<Utc>>,
    addr_info: Option<AddrInfo>,
    advertise_interval: String,
}

#[derive(Debug, Serialize)]
struct NodeListEntry {
    handle: String,
    last_connection: DateTime<Utc>,
    last_advertisement: Option<DateTime<Utc>>,
    addr_info: Option<AddrInfo>,
}

impl From<&RetrievalNode> for NodeListEntry {
    fn from(node: &RetrievalNode) -> Self {
        Self {
            handle: node.handle.clone(),
            last_connection: node.last_connection,
            last_advertisement: node.last_advertisement,
            addr_info: node.addr_info().ok(),
        }
    }
}

struct Components {
    catalog: Arc<SqliteCatalog>,
    nodes: Arc<SqliteNodeStore>,
    client: Arc<IndexerClient>,
    reconcile: ReconcileOperation,
}

fn build_components(config: &Config) -> Result<Components> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let catalog = Arc::new(SqliteCatalog::new(&config.database_path)?);
    let nodes = Arc::new(SqliteNodeStore::new(&config.database_path)?);
    let ledger = Arc::new(LedgerStore::new(&config.database_path)?);
    let chain = Arc::new(AdvertisementStore::new(&config.database_path)?);

    let resolver = ContextResolver::new(catalog.clone() as Arc<dyn ContentCatalog>);
    let client = Arc::new(IndexerClient::new(
        &config.advertisement.indexer_url,
        config.advertisement.publisher()?,
        resolver,
        chain,
    )?);

    let reconcile = ReconcileOperation::new(
        catalog.clone(),
        nodes.clone() as Arc<dyn NodeDirectory>,
        ledger,
        client.clone() as Arc<dyn AdvertisementClient>,
        config.advertisement.reconcile_config(),
    )?;

    Ok(Components {
        catalog,
        nodes,
        client,
        reconcile,
    })
}

/// Runs a single reconciliation tick and returns its report.
pub async fn run_once(config: Config) -> Result<TickReport> {
    let components = build_components(&config)?;

    components.client.start().await?;
    let report = components.reconcile.run_tick(Utc::now()).await;
    components.client.shutdown().await?;

    match components.catalog.highest_content_id().await? {
        Some(highest) => tracing::info!("Catalog highest content id: {}", highest),
        None => tracing::info!("Catalog is empty"),
    }

    Ok(report)
}

pub async fn run_server(config: Config) -> Result<()> {
    let components = build_components(&config)?;
    let cancel = CancellationToken::new();

    let reconcile = components.reconcile.clone();
    let loop_cancel = cancel.clone();
    let loop_task = tokio::spawn(async move { reconcile.run(loop_cancel).await });

    let state = Arc::new(ServerState {
        nodes: components.nodes,
        client: components.client,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/retrieval-nodes", get(list_nodes).post(register_node))
        .route("/retrieval-nodes/heartbeat", post(heartbeat))
        .route("/contexts/:context_id/multihashes", get(get_multihashes))
        .route("/advertisements/:ad_id", get(get_advertisement))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    match loop_task.await {
        Ok(result) => result,
        Err(error) => Err(BeaconError::Internal(format!(
            "advertisement loop panicked: {}",
            error
        ))),
    }
}

fn error_response(error: BeaconError) -> Response {
    let status = match &error {
        BeaconError::Unauthorized => StatusCode::UNAUTHORIZED,
        BeaconError::InvalidRequest(_)
        | BeaconError::MalformedContextId(_)
        | BeaconError::MalformedMultihash(_)
        | BeaconError::MalformedAddress(_) => StatusCode::BAD_REQUEST,
        BeaconError::NoMultihashes { .. } | BeaconError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(resp)).into_response()
}

fn ok_response<T: Serialize>(data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (StatusCode::OK, Json(resp)).into_response()
}

fn advertise_interval(state: &ServerState) -> String {
    format!("{}s", state.config.advertisement.interval_secs)
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let head = state.client.head().await;

    let response = serde_json::json!({
        "status": "ok",
        "advertisement_head": head.map(|id| id.to_string()),
    });

    (StatusCode::OK, Json(response))
}

async fn register_node(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match state.nodes.register(&request.public_key, &request.addresses) {
        Ok(node) => ok_response(RegisterResponse {
            addr_info: node.addr_info().ok(),
            advertise_interval: advertise_interval(&state),
            handle: node.handle,
            token: node.token,
            last_connection: node.last_connection,
        }),
        Err(error) => error_response(error),
    }
}

async fn heartbeat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: Option<Json<HeartbeatRequest>>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(BeaconError::Unauthorized);
    };
    let request = request.map(|Json(request)| request).unwrap_or_default();

    match state.nodes.heartbeat(token, request.addresses.as_deref()) {
        Ok(node) => ok_response(HeartbeatResponse {
            addr_info: node.addr_info().ok(),
            advertise_interval: advertise_interval(&state),
            handle: node.handle,
            last_connection: node.last_connection,
            last_advertisement: node.last_advertisement,
        }),
        Err(error) => error_response(error),
    }
}

async fn list_nodes(State(state): State<Arc<ServerState>>) -> Response {
    match state.nodes.list_nodes().await {
        Ok(nodes) => ok_response(nodes.iter().map(NodeListEntry::from).collect::<Vec<_>>()),
        Err(error) => error_response(error),
    }
}

async fn get_multihashes(
    State(state): State<Arc<ServerState>>,
    Path(context_id): Path<String>,
) -> Response {
    let context_id: ContextId = match context_id.parse() {
        Ok(context_id) => context_id,
        Err(error) => return error_response(error),
    };

    let cursor = match state.client.resolve(context_id.as_bytes()).await {
        Ok(cursor) => cursor,
        Err(error) => return error_response(error),
    };

    let lines = cursor.map(|hash| {
        Ok::<_, Infallible>(Bytes::from(format!("{}\n", hex::encode(hash.to_bytes()))))
    });
    let body = Body::from_stream(futures_util::stream::iter(lines));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn get_advertisement(
    State(state): State<Arc<ServerState>>,
    Path(ad_id): Path<String>,
) -> Response {
    let ad_id: AdvertisementId = match ad_id.parse() {
        Ok(ad_id) => ad_id,
        Err(error) => return error_response(error),
    };

    match state.client.advertisement(&ad_id) {
        Ok(Some(advertisement)) => ok_response(advertisement),
        Err(error) => error_response(error),
        Ok(None) => {
            let resp = ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(format!("advertisement {} not found", ad_id)),
            };
            (StatusCode::NOT_FOUND, Json(resp)).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(BeaconError::Unauthorized).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_response(BeaconError::MalformedContextId("short".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(BeaconError::NoMultihashes { first: 0, count: 1 }).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(BeaconError::Internal("boom".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
