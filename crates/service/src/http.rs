use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use roster_contracts::{Clock, Document};
use roster_store::DocumentStore;
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{ServiceConfig, StartupError, StoreBackend};
use crate::pipeline::{CreateError, ResourceProfile, handle_create};

const ACTOR_HEADER: &str = "x-roster-actor";
const REQUEST_ID_HEADER: &str = "x-roster-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    store: DocumentStore,
    clock: Arc<dyn Clock>,
    employees: ResourceProfile,
    users: ResourceProfile,
}

impl AppState {
    pub fn new(config: ServiceConfig, store: DocumentStore, clock: Arc<dyn Clock>) -> Self {
        let employees = ResourceProfile::employees(config.employees_legacy_format);
        Self {
            config,
            store,
            clock,
            employees,
            users: ResourceProfile::users(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn connect_store(config: &ServiceConfig) -> Result<DocumentStore, StartupError> {
    let write_timeout = Duration::from_millis(config.store_write_timeout_ms);

    match config.store_backend {
        StoreBackend::Memory => Ok(DocumentStore::in_memory_with_timeout(write_timeout)),
        StoreBackend::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "missing required config key ROSTER_DB_URL".to_string(),
            })?;

            DocumentStore::connect_and_migrate(db_url, write_timeout)
                .await
                .map_err(|err| StartupError {
                    code: "ERR_STORE_UNAVAILABLE",
                    message: format!("failed to initialize document store: {}", err),
                })
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/employees", post(create_employee))
        .route("/users", post(create_user))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    backend: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("store", state.store.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            backend: state.store.backend_name(),
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn create_employee(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> impl IntoResponse {
    let profile = state.employees.clone();
    create_record(state, profile, headers, body).await
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> impl IntoResponse {
    let profile = state.users.clone();
    create_record(state, profile, headers, body).await
}

async fn create_record(
    state: AppState,
    profile: ResourceProfile,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> (HeaderMap, Result<Json<Document>, ApiError>) {
    let request_id = extract_request_id(&headers);
    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp_headers.insert(REQUEST_ID_HEADER, value);
    }

    let span = tracing::info_span!(
        "records.create",
        route = profile.route,
        request_id = %request_id,
        actor = tracing::field::Empty,
        record_id = tracing::field::Empty,
        stage = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result: Result<Json<Document>, ApiError> = async {
        let Json(payload) = body.map_err(|rejection| {
            tracing::debug!(reason = %rejection.body_text(), "records.invalid_json");
            json_error(
                StatusCode::BAD_REQUEST,
                "Invalid request payload JSON format",
            )
        })?;

        let actor = extract_actor(&headers, state.config.default_actor.as_deref());
        let outcome = handle_create(
            &state.store,
            &profile,
            payload,
            actor.as_deref(),
            state.clock.now(),
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);

        match outcome {
            Ok(created) => {
                tracing::Span::current().record("outcome", "ok");
                tracing::info!(
                    record_id = %created.record_id,
                    history_id = %created.history_id,
                    collection = %profile.collection,
                    "records.created"
                );
                Ok(Json(created.response))
            }
            Err(CreateError::Validation(err)) => {
                tracing::Span::current().record("outcome", "invalid");
                crate::metrics::observe_validation_failure(profile.route);
                Err(json_error(StatusCode::BAD_REQUEST, err.message))
            }
            Err(CreateError::MissingActor) => {
                tracing::Span::current().record("outcome", "unauthorized");
                Err(json_error(
                    StatusCode::UNAUTHORIZED,
                    format!("missing {} header", ACTOR_HEADER),
                ))
            }
            Err(err) => {
                tracing::Span::current().record("outcome", "error");
                tracing::warn!(error = %err, "records.create_failed");
                Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred",
                ))
            }
        }
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(profile.route, "POST", status.as_u16(), started.elapsed());

    (resp_headers, result)
}

fn extract_actor(headers: &HeaderMap, default_actor: Option<&str>) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .or(default_actor)
        .map(|v| v.to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

/// Error body in the `{statusCode, error, message}` shape existing clients parse.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    status_code: u16,
    error: String,
    message: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            status_code: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use chrono::{DateTime, Utc};
    use roster_contracts::FixedClock;
    use roster_store::{Filter, Projection};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            bind_addr: "127.0.0.1:0".parse().expect("bind addr must parse"),
            store_backend: StoreBackend::Memory,
            db_url: None,
            store_write_timeout_ms: 2000,
            default_actor: None,
            employees_legacy_format: true,
        }
    }

    fn fixed_clock() -> Arc<dyn Clock> {
        let now = "2018-02-21T12:30:20.903Z"
            .parse::<DateTime<Utc>>()
            .expect("timestamp should parse");
        Arc::new(FixedClock(now))
    }

    async fn spawn_app(
        state: AppState,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        (addr, shutdown_tx, handle)
    }

    async fn all(store: &DocumentStore, collection: &str) -> Vec<Document> {
        store
            .collection(collection)
            .find(&Filter::new(), &Projection::All)
            .await
            .expect("find should succeed")
    }

    #[tokio::test]
    async fn post_employees_returns_original_names_with_metadata() {
        let store = DocumentStore::in_memory();
        let state = AppState::new(test_config(), store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/employees", addr))
            .header(ACTOR_HEADER, "mary@hr.com")
            .header(REQUEST_ID_HEADER, "req-42")
            .json(&serde_json::json!({"name": "John", "jobTitle": "Programmer"}))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("req-42")
        );
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        let stored = all(&store, "employees").await;
        assert_eq!(stored.len(), 1);
        let id = stored[0]["_id"].as_str().expect("_id is a string").to_string();

        assert_eq!(
            body,
            serde_json::json!({
                "name": "John",
                "jobTitle": "Programmer",
                "_id": id,
                "uniqueKey": id,
                "updatedAt": "2018-02-21T12:30:20.903Z",
                "updatedBy": "mary@hr.com",
                "isDeleted": false
            })
        );
        assert_eq!(stored[0]["fullname"], "John");
        assert!(stored[0].get("name").is_none());

        let history = all(&store, "employees_history").await;
        assert_eq!(history.len(), 1);
        assert_ne!(history[0]["_id"], stored[0]["_id"]);
        assert_eq!(history[0]["uniqueKey"], serde_json::json!(id));
    }

    #[tokio::test]
    async fn missing_name_returns_bad_request_body() {
        let store = DocumentStore::in_memory();
        let state = AppState::new(test_config(), store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/employees", addr))
            .header(ACTOR_HEADER, "mary@hr.com")
            .json(&serde_json::json!({"jobTitle": "Programmer"}))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        assert_eq!(
            body,
            serde_json::json!({
                "statusCode": 400,
                "error": "Bad Request",
                "message": "\"name\" is required"
            })
        );
        assert!(all(&store, "employees").await.is_empty());
        assert!(all(&store, "employees_history").await.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let state = AppState::new(test_config(), DocumentStore::in_memory(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/users", addr))
            .header(ACTOR_HEADER, "mary@hr.com")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("{\"name\":")
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        assert_eq!(body["message"], "Invalid request payload JSON format");
    }

    #[tokio::test]
    async fn missing_name_without_actor_is_still_bad_request() {
        let store = DocumentStore::in_memory();
        let state = AppState::new(test_config(), store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/employees", addr))
            .json(&serde_json::json!({"jobTitle": "Programmer"}))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        assert_eq!(
            body,
            serde_json::json!({
                "statusCode": 400,
                "error": "Bad Request",
                "message": "\"name\" is required"
            })
        );
        assert!(all(&store, "employees").await.is_empty());
        assert!(all(&store, "employees_history").await.is_empty());
    }

    #[tokio::test]
    async fn actor_falls_back_to_default_then_unauthorized() {
        let mut config = test_config();
        config.default_actor = Some("system@hr.com".to_string());
        let store = DocumentStore::in_memory();
        let state = AppState::new(config, store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/users", addr))
            .json(&serde_json::json!({"name": "John", "username": "john35"}))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");
        assert_eq!(body["updatedBy"], "system@hr.com");
        assert_eq!(body["username"], "john35");

        shutdown.send(()).ok();
        let _ = task.await;

        let state = AppState::new(test_config(), DocumentStore::in_memory(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/users", addr))
            .json(&serde_json::json!({"name": "John"}))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        assert_eq!(
            body,
            serde_json::json!({
                "statusCode": 401,
                "error": "Unauthorized",
                "message": "missing x-roster-actor header"
            })
        );
    }

    #[tokio::test]
    async fn history_write_failure_returns_internal_error() {
        let store = DocumentStore::in_memory();
        store.make_unresponsive("employees_history").await;
        let state = AppState::new(test_config(), store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/employees", addr))
            .header(ACTOR_HEADER, "mary@hr.com")
            .json(&serde_json::json!({"name": "John"}))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = resp.json().await.expect("body should be JSON");

        shutdown.send(()).ok();
        let _ = task.await;

        assert_eq!(
            body,
            serde_json::json!({
                "statusCode": 500,
                "error": "Internal Server Error",
                "message": "An internal server error occurred"
            })
        );
        assert_eq!(all(&store, "employees").await.len(), 1);
    }

    #[tokio::test]
    async fn legacy_format_can_be_disabled_for_employees() {
        let mut config = test_config();
        config.employees_legacy_format = false;
        let store = DocumentStore::in_memory();
        let state = AppState::new(config, store.clone(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/employees", addr))
            .header(ACTOR_HEADER, "mary@hr.com")
            .json(&serde_json::json!({"name": "John", "jobTitle": "Programmer"}))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        shutdown.send(()).ok();
        let _ = task.await;

        let stored = all(&store, "employees").await;
        assert_eq!(stored[0]["name"], "John");
        assert_eq!(stored[0]["jobTitle"], "Programmer");
        assert!(stored[0].get("fullname").is_none());
    }

    #[tokio::test]
    async fn probes_and_metrics_respond() {
        let state = AppState::new(test_config(), DocumentStore::in_memory(), fixed_clock());
        let (addr, shutdown, task) = spawn_app(state).await;
        let client = reqwest::Client::new();

        let health = client
            .get(format!("http://{}/healthz", addr))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(health.text().await.expect("body"), "ok");

        let ready: serde_json::Value = client
            .get(format!("http://{}/readyz", addr))
            .send()
            .await
            .expect("request should succeed")
            .json()
            .await
            .expect("body should be JSON");
        assert_eq!(ready["status"], "ready");
        assert_eq!(ready["backend"], "memory");
        assert_eq!(ready["checks"]["store"], true);

        let metrics = client
            .get(format!("http://{}/metrics", addr))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(metrics.status(), reqwest::StatusCode::OK);
        assert!(
            metrics
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/plain"))
        );

        shutdown.send(()).ok();
        let _ = task.await;
    }

    #[test]
    fn request_ids_are_sanitized() {
        assert_eq!(sanitize_request_id("abc DEF/1.2_3-4").as_deref(), Some("abcDEF1.2_3-4"));
        assert_eq!(sanitize_request_id("!!!"), None);
        assert_eq!(sanitize_request_id(&"a".repeat(100)).map(|s| s.len()), Some(64));
    }
}
