//! HTTP API over the page cache.
//!
//! - GET /v1/pages: one page of a filtered, sorted query
//! - GET /v1/items: every matching item (export feed)
//! - POST /v1/items, DELETE /v1/items/{id}: mutate the live collection
//! - GET /v1/updates: SSE stream of page updates
//! - GET /health, GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheError, PageUpdate};
use crate::config::Config;
use crate::query::QueryDescriptor;
use crate::server::streaming::updates_to_sse_stream;
use crate::store::memory::MemoryCollection;
use crate::store::Item;

/// Query-string keys that address the page rather than filter items.
const PAGE_PARAM: &str = "page";
const PAGE_SIZE_PARAM: &str = "page_size";

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<Cache>,
    pub collection: MemoryCollection,
    pub config: Arc<Config>,
    pub updates: broadcast::Sender<PageUpdate>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the cache over `collection` and route its updates to SSE clients.
    pub async fn new(
        collection: MemoryCollection,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, CacheError> {
        let cache = Arc::new(Cache::new(Arc::new(collection.clone()), config.cache.clone())?);
        let (updates, _) = broadcast::channel(config.server.update_buffer.max(1));

        let sender = updates.clone();
        cache
            .on_update(move |update| {
                // No subscribers is fine.
                let _ = sender.send(update);
            })
            .await;

        Ok(Arc::new(Self {
            cache,
            collection,
            config,
            updates,
            start_time: Instant::now(),
        }))
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/pages", get(get_page))
        .route("/v1/items", get(all_items).post(put_item))
        .route("/v1/items/{id}", delete(delete_item))
        .route("/v1/updates", get(updates))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PageResponse {
    pub page: usize,
    pub page_size: usize,
    /// Known page count, `null` while unknown.
    pub length: Option<usize>,
    pub items: Vec<Item>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub count: usize,
    pub items: Vec<Item>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub managers: usize,
    pub items: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub request_id: String,
}

/// A failed request, rendered as JSON with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    request_id: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    fn from_cache(error: CacheError, request_id: &str) -> Self {
        let status = match &error {
            CacheError::InvalidQuery(_) | CacheError::InvalidPage | CacheError::InvalidPageSize { .. } => {
                StatusCode::BAD_REQUEST
            }
            CacheError::Fetch(_) | CacheError::Subscription(_) => StatusCode::BAD_GATEWAY,
            CacheError::ManagerClosed(_) | CacheError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(request_id, "Request failed: {error}");
        }
        Self::new(status, error.to_string(), request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            request_id: self.request_id,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Split raw query parameters into page addressing and item predicates.
fn parse_page_params(
    params: &[(String, String)],
    default_page_size: usize,
    request_id: &str,
) -> Result<(usize, usize), ApiError> {
    let number = |key: &str, default: usize| -> Result<usize, ApiError> {
        match params.iter().rev().find(|(k, _)| k == key) {
            None => Ok(default),
            Some((_, raw)) => raw.trim().parse().map_err(|_| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid {key}: {raw:?}"),
                    request_id,
                )
            }),
        }
    };
    Ok((number(PAGE_PARAM, 1)?, number(PAGE_SIZE_PARAM, default_page_size)?))
}

fn descriptor(state: &AppState, params: &[(String, String)]) -> QueryDescriptor {
    QueryDescriptor::from_params(
        state.config.query.sort(),
        params
            .iter()
            .filter(|(k, _)| k != PAGE_PARAM && k != PAGE_SIZE_PARAM)
            .map(|(k, v)| (k.as_str(), v.as_str())),
    )
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_page(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<PageResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let (page, page_size) =
        parse_page_params(&params, state.config.cache.page_size, &request_id)?;
    let query = descriptor(&state, &params);

    debug!(request_id, page, page_size, filters = query.predicates.len(), "Page request");

    let result = state
        .cache
        .get(&query, page, page_size)
        .await
        .map_err(|e| ApiError::from_cache(e, &request_id))?;

    Ok(Json(PageResponse {
        page,
        page_size,
        length: result.length,
        items: result.items,
    }))
}

async fn all_items(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let query = descriptor(&state, &params);

    let items = state
        .cache
        .get_all_items(&query)
        .await
        .map_err(|e| ApiError::from_cache(e, &request_id))?;

    info!(request_id, items = items.len(), "All items exported");
    Ok(Json(ItemsResponse {
        count: items.len(),
        items,
    }))
}

async fn put_item(
    State(state): State<Arc<AppState>>,
    Json(item): Json<Item>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    if item.id.is_empty() {
        let request_id = Uuid::new_v4().to_string();
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Item _id must not be empty",
            &request_id,
        ));
    }

    info!(id = %item.id, "Item upserted");
    let status = match state.collection.insert(item.clone()) {
        Some(_) => StatusCode::OK,
        None => StatusCode::CREATED,
    };
    Ok((status, Json(item)))
}

async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.collection.remove(&id) {
        Some(_) => {
            info!(id, "Item deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => {
            let request_id = Uuid::new_v4().to_string();
            Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No item with _id {id:?}"),
                &request_id,
            ))
        }
    }
}

async fn updates(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id, "Update stream opened");
    let stream = updates_to_sse_stream(state.updates.subscribe(), request_id);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        managers: state.cache.manager_count().await,
        items: state.collection.len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.cache.metrics().render().map_err(|e| {
        warn!("Metrics rendering failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
