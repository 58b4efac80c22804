use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    application::{
        error::{ApiError, fetch_error_to_api, image_error_to_api, store_error_to_api},
        filters::{FilterStore, NewFilter},
        history::HistoryStore,
        settings::SettingsStore,
    },
    cache::{ImageCache, MetadataCache},
    domain::{
        keys::{ImageKey, MetaKey, is_valid_board, parse_image_name},
        models::{self, CatalogThread, Thread},
    },
    util::bytes::to_mebibytes,
};

#[derive(Clone)]
pub struct ApiState {
    pub metadata: Arc<MetadataCache>,
    pub images: Arc<ImageCache>,
    pub filters: Arc<FilterStore>,
    pub history: Arc<HistoryStore>,
    pub settings: Arc<SettingsStore>,
    pub prefetch_thumbs: usize,
    pub started_at: Instant,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/boards", get(boards))
        .route("/api/catalog/{board}", get(catalog))
        .route("/api/thread/{board}/{no}", get(thread))
        .route("/api/image/{board}/{name}", get(image))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(cache_clear))
        .route("/api/health", get(health))
        .route("/api/filters/{board}", get(list_filters).post(add_filter))
        .route("/api/filters/{board}/{id}", axum::routing::delete(remove_filter))
        .route("/api/filters/{board}/{id}/toggle", post(toggle_filter))
        .route("/api/history", get(list_history).delete(clear_history))
        .route(
            "/api/history/{board}/{no}",
            axum::routing::delete(remove_history),
        )
        .route("/api/settings", get(get_settings).post(save_settings))
        .with_state(state)
}

fn json_bytes(payload: Bytes) -> Response {
    (
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        payload,
    )
        .into_response()
}

fn require_board(source: &'static str, board: &str) -> Result<(), ApiError> {
    if is_valid_board(board) {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            source,
            format!("invalid board `{board}`"),
        ))
    }
}

async fn boards(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let payload = state
        .metadata
        .get(&MetaKey::boards())
        .await
        .map_err(|err| fetch_error_to_api("http::boards", err))?;
    Ok(json_bytes(payload))
}

async fn catalog(
    State(state): State<ApiState>,
    Path(board): Path<String>,
) -> Result<Response, ApiError> {
    require_board("http::catalog", &board)?;

    let payload = state
        .metadata
        .get(&MetaKey::catalog(&board))
        .await
        .map_err(|err| fetch_error_to_api("http::catalog", err))?;
    let threads: Vec<CatalogThread> = serde_json::from_slice(&payload).map_err(|err| {
        ApiError::from_error(
            "http::catalog",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Cached catalog is unreadable",
            &err,
        )
    })?;

    let mut visible = state.filters.apply(&board, threads).await;
    // Stable sort keeps upstream bump order within each group.
    visible.sort_by_key(|thread| !thread.is_sticky());
    spawn_thumb_prefetch(&state, &board, &visible);
    Ok(Json(visible).into_response())
}

/// Warm the thumbnail tier for the first page of visible threads. Runs in
/// the background; the catalog response never waits on media.
fn spawn_thumb_prefetch(state: &ApiState, board: &str, threads: &[CatalogThread]) {
    if state.prefetch_thumbs == 0 {
        return;
    }
    let keys: Vec<ImageKey> = threads
        .iter()
        .take(state.prefetch_thumbs)
        .filter_map(|thread| thread.tim.map(|tim| ImageKey::thumb(board, tim)))
        .collect();
    if keys.is_empty() {
        return;
    }

    let images = Arc::clone(&state.images);
    tokio::spawn(async move {
        for key in keys {
            if let Err(err) = images.fetch(&key).await {
                debug!(key = %key, error = %err, "Thumbnail prefetch failed");
            }
        }
    });
}

async fn thread(
    State(state): State<ApiState>,
    Path((board, no)): Path<(String, u64)>,
) -> Result<Response, ApiError> {
    require_board("http::thread", &board)?;

    let payload = state
        .metadata
        .get(&MetaKey::thread(&board, no))
        .await
        .map_err(|err| fetch_error_to_api("http::thread", err))?;

    if let Ok(thread) = serde_json::from_slice::<Thread>(&payload) {
        if let Some(op) = thread.op() {
            let title = models::thread_title(op.sub.as_deref(), op.com.as_deref());
            if let Err(err) = state.history.record(&board, no, title).await {
                warn!(board, no, error = %err, "Failed to record history entry");
            }
        }
    }

    Ok(json_bytes(payload))
}

async fn image(
    State(state): State<ApiState>,
    Path((board, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let Some(key) = parse_image_name(&board, &name) else {
        return Err(ApiError::bad_request(
            "http::image",
            format!("invalid image request `{board}/{name}`"),
        ));
    };

    let path = state
        .images
        .fetch(&key)
        .await
        .map_err(|err| image_error_to_api("http::image", err))?;

    // The janitor may race us between path resolution and the read; one
    // refetch covers it.
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let path = state
                .images
                .fetch(&key)
                .await
                .map_err(|err| image_error_to_api("http::image", err))?;
            tokio::fs::read(&path).await.map_err(|err| {
                ApiError::from_error(
                    "http::image",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Image store failure",
                    &err,
                )
            })?
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(([(CONTENT_TYPE, content_type)], Body::from(bytes)).into_response())
}

async fn cache_stats(State(state): State<ApiState>) -> Json<Value> {
    let images = state.images.stats();
    let metadata = state.metadata.stats();
    Json(json!({
        "cache": {
            "total_size_mb": to_mebibytes(images.total_bytes),
            "thumbs_count": images.thumb_count,
            "images_count": images.full_count,
        },
        "database": {
            "threads": metadata.threads,
        },
    }))
}

async fn cache_clear(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    state.metadata.clear();
    state
        .images
        .clear()
        .await
        .map_err(|err| image_error_to_api("http::cache_clear", err))?;
    Ok(Json(json!({ "cleared": true })))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn list_filters(
    State(state): State<ApiState>,
    Path(board): Path<String>,
) -> Result<Response, ApiError> {
    require_board("http::filters", &board)?;
    Ok(Json(state.filters.for_board(&board).await).into_response())
}

async fn add_filter(
    State(state): State<ApiState>,
    Path(board): Path<String>,
    Json(new): Json<NewFilter>,
) -> Result<Response, ApiError> {
    require_board("http::filters", &board)?;
    if new.keyword.trim().is_empty() {
        return Err(ApiError::bad_request(
            "http::filters",
            "filter keyword must not be empty",
        ));
    }
    let filter = state
        .filters
        .add(&board, new)
        .await
        .map_err(|err| store_error_to_api("http::filters", err))?;
    Ok((StatusCode::CREATED, Json(filter)).into_response())
}

async fn remove_filter(
    State(state): State<ApiState>,
    Path((board, id)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    require_board("http::filters", &board)?;
    let removed = state
        .filters
        .remove(&board, id)
        .await
        .map_err(|err| store_error_to_api("http::filters", err))?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "http::filters",
            format!("no filter {id} on /{board}/"),
        ))
    }
}

async fn toggle_filter(
    State(state): State<ApiState>,
    Path((board, id)): Path<(String, u64)>,
) -> Result<Response, ApiError> {
    require_board("http::filters", &board)?;
    match state
        .filters
        .toggle(&board, id)
        .await
        .map_err(|err| store_error_to_api("http::filters", err))?
    {
        Some(filter) => Ok(Json(filter).into_response()),
        None => Err(ApiError::not_found(
            "http::filters",
            format!("no filter {id} on /{board}/"),
        )),
    }
}

async fn list_history(State(state): State<ApiState>) -> Response {
    Json(state.history.list().await).into_response()
}

async fn clear_history(State(state): State<ApiState>) -> Result<StatusCode, ApiError> {
    state
        .history
        .clear()
        .await
        .map_err(|err| store_error_to_api("http::history", err))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_history(
    State(state): State<ApiState>,
    Path((board, no)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .history
        .remove(&board, no)
        .await
        .map_err(|err| store_error_to_api("http::history", err))?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "http::history",
            format!("no history entry for /{board}/{no}"),
        ))
    }
}

async fn get_settings(State(state): State<ApiState>) -> Json<Map<String, Value>> {
    Json(state.settings.get().await)
}

async fn save_settings(
    State(state): State<ApiState>,
    Json(settings): Json<Map<String, Value>>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    state
        .settings
        .save(settings)
        .await
        .map_err(|err| store_error_to_api("http::settings", err))?;
    Ok(Json(state.settings.get().await))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use crate::config::MetadataSettings;
    use crate::infra::upstream::{FetchError, Upstream, UpstreamUrls};

    use super::*;

    struct FakeUpstream {
        responses: Mutex<HashMap<String, Bytes>>,
    }

    impl FakeUpstream {
        fn new(responses: Vec<(&str, Bytes)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(url, body)| (url.to_string(), body))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.responses
                .lock()
                .await
                .get(url)
                .cloned()
                .ok_or(FetchError::NotFound)
        }
    }

    async fn state_with(
        dir: &tempfile::TempDir,
        upstream: Arc<FakeUpstream>,
    ) -> ApiState {
        let urls = UpstreamUrls::new("http://api.test", "http://media.test");
        let metadata = Arc::new(MetadataCache::new(
            upstream.clone(),
            urls.clone(),
            MetadataSettings {
                ttl: Duration::from_secs(600),
                boards_ttl: Duration::from_secs(3_600),
                archived_ttl: Duration::from_secs(24 * 3_600),
                stale_fallback: true,
            },
        ));
        let images = Arc::new(
            ImageCache::open(dir.path().join("cache"), upstream, urls, 1024 * 1024)
                .await
                .expect("image cache opens"),
        );
        ApiState {
            metadata,
            images,
            filters: Arc::new(FilterStore::open(dir.path().join("filters.json")).await),
            history: Arc::new(HistoryStore::open(dir.path().join("history.json")).await),
            settings: Arc::new(SettingsStore::open(dir.path().join("settings.json")).await),
            prefetch_thumbs: 0,
            started_at: Instant::now(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn catalog_upstream() -> Arc<FakeUpstream> {
        let catalog = json!([
            { "page": 1, "threads": [
                { "no": 1, "sub": "rust thread", "tim": 111, "ext": ".jpg" },
                { "no": 2, "sub": "hidden spam", "tim": 222, "ext": ".png" }
            ] }
        ]);
        FakeUpstream::new(vec![
            ("http://api.test/g/catalog.json", Bytes::from(catalog.to_string())),
            ("http://media.test/g/111s.jpg", Bytes::from_static(b"thumb-bytes")),
        ])
    }

    #[tokio::test]
    async fn catalog_applies_board_filters() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, catalog_upstream()).await;
        state
            .filters
            .add(
                "g",
                NewFilter {
                    keyword: "spam".into(),
                    ..NewFilter::default()
                },
            )
            .await
            .unwrap();
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/catalog/g")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let threads = body.as_array().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0]["no"], json!(1));
    }

    #[tokio::test]
    async fn invalid_board_is_rejected_before_any_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, FakeUpstream::new(vec![])).await;
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/catalog/..%2Fetc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn missing_thread_maps_to_404_json() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, FakeUpstream::new(vec![])).await;
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/thread/g/12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Resource not found upstream"));
    }

    #[tokio::test]
    async fn image_endpoint_serves_cached_bytes_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, catalog_upstream()).await;
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/image/g/111s.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"thumb-bytes");
    }

    #[tokio::test]
    async fn stats_reports_cache_and_thread_counts() {
        let dir = tempfile::tempdir().unwrap();
        let thread = json!({ "posts": [ { "no": 7, "sub": "op" } ] });
        let upstream = FakeUpstream::new(vec![
            (
                "http://api.test/g/thread/7.json",
                Bytes::from(thread.to_string()),
            ),
            ("http://media.test/g/111s.jpg", Bytes::from_static(b"thumb")),
        ]);
        let state = state_with(&dir, upstream).await;
        let router = build_router(state.clone());

        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/thread/g/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        state.images.fetch(&ImageKey::thumb("g", 111)).await.unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/cache/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;

        assert_eq!(body["database"]["threads"], json!(1));
        assert_eq!(body["cache"]["thumbs_count"], json!(1));
        assert_eq!(body["cache"]["images_count"], json!(0));

        // Visiting the thread also recorded history.
        assert_eq!(state.history.list().await.len(), 1);
    }

    #[tokio::test]
    async fn cache_clear_resets_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, catalog_upstream()).await;
        state.images.fetch(&ImageKey::thumb("g", 111)).await.unwrap();
        let router = build_router(state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cache/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.images.stats().thumb_count, 0);
        assert_eq!(state.metadata.stats().threads, 0);
    }

    #[tokio::test]
    async fn health_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, FakeUpstream::new(vec![])).await;
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["version"], json!(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn settings_round_trip_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, FakeUpstream::new(vec![])).await;
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/settings")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"theme":"light"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(
            router
                .oneshot(
                    Request::builder()
                        .uri("/api/settings")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["theme"], json!("light"));
        assert_eq!(body["compactView"], json!(false));
    }
}
