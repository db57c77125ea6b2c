//! JSON routes over the property store for the map frontend and scoring worker.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flipr_core::{Cursor, HealthStatus, PropertyId, ScoreUpdate, StatusCounts};
use flipr_storage::{clamp_page_size, PropertyStore, StorageError, StorageHandle, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "flipr-web";

#[derive(Clone)]
pub struct AppState {
    pub store: StorageHandle,
    pub default_page_size: u32,
}

impl AppState {
    pub fn new(store: StorageHandle) -> Self {
        Self {
            store,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_default_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = clamp_page_size(page_size);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    cursor: Option<String>,
    page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    health: HealthStatus,
    counts: StatusCounts,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/status", get(status_handler))
        .route("/properties", get(list_handler))
        .route("/properties/{id}", get(property_handler))
        .route("/properties/{id}/score", post(score_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

struct ApiError(StorageError);

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StorageError::Connection(_) | StorageError::PoolExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StorageError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = state.store.health();
    let status = if health.last_connection_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let counts = state.store.status_counts().await?;
    let body = StatusBody {
        health: state.store.health(),
        counts,
    };
    Ok(Json(body).into_response())
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let cursor = match query.cursor.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(raw) => Some(raw.parse::<Cursor>().map_err(StorageError::InvalidCursor)?),
        None => None,
    };
    let page_size = clamp_page_size(query.page_size.unwrap_or(state.default_page_size));
    let page = state.store.list_page(cursor, page_size).await?;
    Ok(Json(page).into_response())
}

async fn property_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<PropertyId>,
) -> Result<Response, ApiError> {
    let property = state.store.get(id).await?.ok_or(StorageError::NotFound(id))?;
    Ok(Json(property).into_response())
}

async fn score_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<PropertyId>,
    Json(update): Json<ScoreUpdate>,
) -> Result<Response, ApiError> {
    update.validate().map_err(StorageError::from)?;
    let property = state.store.update_score(id, &update).await?;
    Ok(Json(property).into_response())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flipr_core::{
        Address, Fingerprint, Property, PropertyDraft, PropertyPage, StorageMode, WalkScore,
    };
    use flipr_storage::{FailoverStore, SqlitePropertyStore, StorageState};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn draft(street: &str) -> PropertyDraft {
        PropertyDraft {
            provider: "attom".into(),
            external_id: street.into(),
            address: Address {
                street: street.into(),
                city: "Austin".into(),
                state: "TX".into(),
                postal_code: None,
            },
            latitude: 30.2672,
            longitude: -97.7431,
            price: Some(350_000.0),
            beds: Some(2),
            baths: Some(1.0),
            square_feet: Some(1_100),
            raw_payload_hash: "h".into(),
            raw_payload: serde_json::json!({"street": street}),
            fetched_at: chrono::Utc::now(),
        }
    }

    async fn seeded_app(rows: usize) -> Router {
        seeded(rows).await.0
    }

    async fn seeded(rows: usize) -> (Router, Arc<StorageState>) {
        let state = Arc::new(StorageState::new());
        state.transition(StorageMode::Fallback, "sqlite");
        state.record_success();
        let store = Arc::new(SqlitePropertyStore::open_in_memory().await.unwrap());
        for n in 0..rows {
            let street = format!("{n} Test St");
            store
                .create_or_update(&Fingerprint::new(format!("fp-{n}")), &draft(&street))
                .await
                .unwrap();
        }
        let handle = Arc::new(FailoverStore::new(store, None, state.clone()));
        (app(AppState::new(handle).with_default_page_size(2)), state)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn score_req(id: i64, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/properties/{id}/score"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn properties_page_through_with_cursor() {
        let app = seeded_app(3).await;

        let (status, first) = send(app.clone(), get_req("/properties")).await;
        assert_eq!(status, StatusCode::OK);
        let first: PropertyPage = serde_json::from_value(first).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let (_, second) = send(app.clone(), get_req(&format!("/properties?cursor={cursor}"))).await;
        let second: PropertyPage = serde_json::from_value(second).unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_cursor.is_none());
        assert!(second.items[0].id > first.items[1].id);

        let (status, body) = send(app, get_req("/properties?cursor=zzz")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cursor"));
    }

    #[tokio::test]
    async fn cursor_from_a_replaced_backend_is_a_bad_request() {
        let (app, state) = seeded(3).await;

        let (_, first) = send(app.clone(), get_req("/properties")).await;
        let first: PropertyPage = serde_json::from_value(first).unwrap();
        let cursor = first.next_cursor.unwrap();

        state.transition(StorageMode::Durable, "postgres");
        let (status, body) = send(app.clone(), get_req(&format!("/properties?cursor={cursor}"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("first page"));

        let (status, _) = send(app, get_req("/properties")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn score_write_back_validates_and_reports_missing_rows() {
        let app = seeded_app(1).await;

        let (status, body) = send(app.clone(), score_req(1, r#"{"score":0.85,"reasoning":"cheap"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let property: Property = serde_json::from_value(body).unwrap();
        assert_eq!(property.score, Some(0.85));
        assert_eq!(property.deal_rating.map(|r| r.as_str()), Some("hot"));

        let (status, _) = send(app.clone(), score_req(1, r#"{"score":1.5}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(app.clone(), score_req(99, r#"{"score":0.5}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(app, get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counts"]["total"], 1);
        assert_eq!(body["counts"]["hot"], 1);
        assert_eq!(body["health"]["storage_mode"], "fallback");
    }

    /// Every call fails with the same error.
    struct DownStore(fn() -> StorageError);

    fn refused() -> StorageError {
        StorageError::Connection("connection refused".into())
    }

    fn saturated() -> StorageError {
        StorageError::PoolExhausted("pool timed out while waiting for an open connection".into())
    }

    #[async_trait]
    impl PropertyStore for DownStore {
        fn backend_name(&self) -> &'static str {
            "postgres"
        }
        async fn create_or_update(&self, _: &Fingerprint, _: &PropertyDraft) -> Result<PropertyId, StorageError> {
            Err((self.0)())
        }
        async fn list_page(&self, _: Option<Cursor>, _: u32) -> Result<PropertyPage, StorageError> {
            Err((self.0)())
        }
        async fn find_by_fingerprint(&self, _: &Fingerprint) -> Result<Option<Property>, StorageError> {
            Err((self.0)())
        }
        async fn get(&self, _: PropertyId) -> Result<Option<Property>, StorageError> {
            Err((self.0)())
        }
        async fn update_score(&self, _: PropertyId, _: &ScoreUpdate) -> Result<Property, StorageError> {
            Err((self.0)())
        }
        async fn update_walk_score(&self, _: PropertyId, _: &WalkScore) -> Result<Property, StorageError> {
            Err((self.0)())
        }
        async fn status_counts(&self) -> Result<StatusCounts, StorageError> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn strict_mode_outage_maps_to_service_unavailable() {
        let state = Arc::new(StorageState::new());
        state.transition(StorageMode::Durable, "postgres");
        let handle = Arc::new(FailoverStore::new(Arc::new(DownStore(refused)), None::<PathBuf>, state));
        let app = app(AppState::new(handle));

        let (status, _) = send(app.clone(), get_req("/properties")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = send(app, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["storage_mode"], "durable");
        assert_eq!(body["last_connection_ok"], false);
    }

    #[tokio::test]
    async fn exhausted_pool_is_unavailable_but_healthy() {
        let state = Arc::new(StorageState::new());
        state.transition(StorageMode::Durable, "postgres");
        state.record_success();
        let handle = Arc::new(FailoverStore::new(Arc::new(DownStore(saturated)), None::<PathBuf>, state));
        let app = app(AppState::new(handle));

        let (status, body) = send(app.clone(), get_req("/properties/1")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("pool exhausted"));

        let (status, body) = send(app, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_mode"], "durable");
    }
}
