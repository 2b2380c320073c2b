use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use crate::commands::{build_plan, build_service, validate_horizon};
use crate::openai::OpenAiClient;
use whisper_core::db::Database;
use whisper_core::error::StoreError;
use whisper_core::goals::GoalReport;
use whisper_core::models::{
    Badge, JournalEntry, MealRecord, MetricRecord, MetricValues, Preferences, PreferencesUpdate,
    Profile, ProfileUpdate, validate_meal_type, validate_metric_values, validate_preferences,
    validate_profile, validate_source,
};
use whisper_core::nudge::Reply;
use whisper_core::service::{
    DEFAULT_SUMMARY_DAYS, MAX_SUMMARY_DAYS, MealEntry, MetricEntry, Summary, WhisperService,
};
use whisper_core::twin::{DEFAULT_HORIZON_DAYS, Projection};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const MAX_UID_LEN: usize = 128;
const MAX_IDLE_CONNECTIONS: usize = 8;

/// SQLite connections handed out one per request. A request keeps its
/// connection until it finishes, including any language model calls, so a
/// slow completion never stalls other requests. WAL mode and the busy
/// timeout serialize the actual writes.
struct DbPool {
    path: PathBuf,
    idle: Mutex<Vec<Database>>,
}

impl DbPool {
    fn new(path: PathBuf, first: Database) -> Self {
        Self {
            path,
            idle: Mutex::new(vec![first]),
        }
    }

    fn take(&self) -> anyhow::Result<Database> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(db) => Ok(db),
            None => Database::open(&self.path),
        }
    }

    fn release(&self, db: Database) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(db);
        }
    }

    /// Run `f` on a connection of its own. A panicking `f` drops the
    /// connection instead of returning it.
    fn with<T>(&self, f: impl FnOnce(&Database) -> T) -> anyhow::Result<T> {
        let db = self.take()?;
        let out = f(&db);
        self.release(db);
        Ok(out)
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Clone)]
struct AppState {
    db: Arc<DbPool>,
    llm: Option<Arc<OpenAiClient>>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct LogMetricsRequest {
    source: Option<String>,
    #[serde(flatten)]
    values: MetricValues,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct CreateMealRequest {
    meal_type: String,
    text: String,
    #[serde(default)]
    estimate: bool,
    at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct JournalRequest {
    text: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct SummaryQuery {
    days: Option<u32>,
}

/// Flat query fields; `serde(flatten)` does not mix with query-string numbers.
#[derive(Deserialize)]
struct TwinQuery {
    steps: Option<f64>,
    sleep_minutes: Option<f64>,
    water_ml: Option<f64>,
    intake_kcal: Option<f64>,
    #[serde(default)]
    suggested: bool,
    days: Option<u32>,
}

#[derive(Deserialize, Default)]
struct NudgeRequest {
    ask: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct ChatRequest {
    text: String,
}

#[derive(Serialize)]
struct NudgeResponse {
    due: bool,
    #[serde(flatten)]
    reply: Option<Reply>,
}

#[derive(Serialize)]
struct GoalsResponse {
    #[serde(flatten)]
    report: GoalReport,
    badges: Vec<Badge>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let expired = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<StoreError>())
            .any(StoreError::is_auth_expired);
        if expired {
            Self::Unauthorized("Datastore session expired; sign in again".to_string())
        } else {
            Self::Internal(err)
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn bad_request(err: anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err}"))
}

fn validate_uid(uid: String) -> Result<String, ApiError> {
    let ok = !uid.is_empty()
        && uid.len() <= MAX_UID_LEN
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'));
    if ok {
        Ok(uid)
    } else {
        Err(ApiError::BadRequest(format!(
            "Invalid user id. Use up to {MAX_UID_LEN} letters, digits or -_.@:"
        )))
    }
}

/// Run core work on the blocking pool with a connection of its own; the
/// language model client blocks on the runtime handle and must never run on
/// an async worker.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&WhisperService<'_>) -> Result<T, ApiError> + Send + 'static,
{
    let pool = Arc::clone(&state.db);
    let llm = state.llm.clone();
    tokio::task::spawn_blocking(move || {
        pool.with(|db| f(&build_service(db, llm.as_deref())))
            .context("failed to open database")?
    })
    .await
    .context("request task failed")?
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn log_metrics(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<LogMetricsRequest>,
) -> Result<(StatusCode, Json<MetricRecord>), ApiError> {
    let uid = validate_uid(uid)?;
    let source = validate_source(req.source.as_deref().unwrap_or("manual")).map_err(bad_request)?;
    validate_metric_values(&req.values).map_err(bad_request)?;
    if req.values.is_empty() && req.notes.as_deref().is_none_or(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest(
            "Provide at least one metric or a note".to_string(),
        ));
    }

    let entry = MetricEntry {
        source,
        values: req.values,
        notes: req.notes,
    };
    let record = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.log_metrics(&ctx, &entry)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn create_meal(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<CreateMealRequest>,
) -> Result<(StatusCode, Json<MealRecord>), ApiError> {
    let uid = validate_uid(uid)?;
    let meal_type = validate_meal_type(&req.meal_type).map_err(bad_request)?;
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Meal description cannot be empty".to_string(),
        ));
    }

    let entry = MealEntry {
        meal_type,
        text: req.text,
        estimate: req.estimate,
        at: req.at,
    };
    let record = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.log_meal(&ctx, &entry)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn recent_meals(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uid = validate_uid(uid)?;
    let view = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.recent_meals(&ctx)?)
    })
    .await?;

    let value = match view {
        Some(v) => serde_json::to_value(v).context("failed to serialize meals")?,
        None => serde_json::json!({ "meals": [] }),
    };
    Ok(Json(value))
}

async fn create_journal(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<JournalRequest>,
) -> Result<(StatusCode, Json<JournalEntry>), ApiError> {
    let uid = validate_uid(uid)?;
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Journal entry cannot be empty".to_string(),
        ));
    }
    let entry = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.journal(&ctx, &req.text, &req.tags)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Summary>, ApiError> {
    let uid = validate_uid(uid)?;
    let days = query.days.unwrap_or(DEFAULT_SUMMARY_DAYS);
    if days == 0 || days > MAX_SUMMARY_DAYS {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {MAX_SUMMARY_DAYS}"
        )));
    }
    let summary = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.summary(&ctx, days)?)
    })
    .await?;
    Ok(Json(summary))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uid = validate_uid(uid)?;
    let snapshot = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.snapshot(&ctx)?)
    })
    .await?
    .ok_or_else(|| ApiError::NotFound("Nothing logged in the last 48 hours".to_string()))?;

    let value = serde_json::to_value(snapshot).context("failed to serialize snapshot")?;
    Ok(Json(value))
}

async fn get_goals(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<GoalsResponse>, ApiError> {
    let uid = validate_uid(uid)?;
    let response = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        let report = svc.goals(&ctx)?;
        let badges = svc.badges(&uid)?;
        Ok(GoalsResponse { report, badges })
    })
    .await?;
    Ok(Json(response))
}

async fn get_twin(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<TwinQuery>,
) -> Result<Json<Projection>, ApiError> {
    let uid = validate_uid(uid)?;
    let plan = build_plan(
        query.steps,
        query.sleep_minutes,
        query.water_ml,
        query.intake_kcal,
        query.suggested,
    )
    .map_err(bad_request)?;
    let days = query.days.unwrap_or(DEFAULT_HORIZON_DAYS);
    validate_horizon(days).map_err(bad_request)?;

    let projection = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.twin(&ctx, &plan, days)?)
    })
    .await?;
    Ok(Json(projection))
}

async fn create_nudge(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    req: Option<Json<NudgeRequest>>,
) -> Result<Json<NudgeResponse>, ApiError> {
    let uid = validate_uid(uid)?;
    let Json(req) = req.unwrap_or_default();
    let response = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        let ask = req.ask.as_deref().map(str::trim).filter(|a| !a.is_empty());
        if !req.force && ask.is_none() && !svc.nudge_due(&ctx)? {
            return Ok(NudgeResponse {
                due: false,
                reply: None,
            });
        }
        Ok(NudgeResponse {
            due: true,
            reply: Some(svc.nudge(&ctx, ask)?),
        })
    })
    .await?;
    Ok(Json(response))
}

async fn chat(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Reply>, ApiError> {
    let uid = validate_uid(uid)?;
    let reply = blocking(&state, move |svc| {
        let ctx = svc.context(&uid)?;
        Ok(svc.chat(&ctx, &req.text)?)
    })
    .await?;
    Ok(Json(reply))
}

async fn get_preferences(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Preferences>, ApiError> {
    let uid = validate_uid(uid)?;
    let prefs = blocking(&state, move |svc| Ok(svc.preferences(&uid)?)).await?;
    Ok(Json(prefs))
}

async fn put_preferences(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(update): Json<PreferencesUpdate>,
) -> Result<Json<Preferences>, ApiError> {
    let uid = validate_uid(uid)?;
    let prefs = blocking(&state, move |svc| {
        let mut merged = update.apply(svc.preferences(&uid)?);
        merged.uid.clone_from(&uid);
        validate_preferences(&merged).map_err(bad_request)?;
        Ok(svc.save_preferences(&merged)?)
    })
    .await?;
    Ok(Json(prefs))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let uid = validate_uid(uid)?;
    let profile = blocking(&state, move |svc| Ok(svc.profile(&uid)?)).await?;
    Ok(Json(profile))
}

async fn put_profile(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<Profile>, ApiError> {
    let uid = validate_uid(uid)?;
    let profile = blocking(&state, move |svc| {
        let mut merged = update.apply(svc.profile(&uid)?);
        merged.uid.clone_from(&uid);
        validate_profile(&merged).map_err(bad_request)?;
        Ok(svc.save_profile(&merged)?)
    })
    .await?;
    Ok(Json(profile))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/users/{uid}/metrics", post(log_metrics))
        .route("/api/users/{uid}/meals", post(create_meal).get(recent_meals))
        .route("/api/users/{uid}/journal", post(create_journal))
        .route("/api/users/{uid}/summary", get(get_summary))
        .route("/api/users/{uid}/snapshot", get(get_snapshot))
        .route("/api/users/{uid}/goals", get(get_goals))
        .route("/api/users/{uid}/twin", get(get_twin))
        .route("/api/users/{uid}/nudge", post(create_nudge))
        .route("/api/users/{uid}/chat", post(chat))
        .route(
            "/api/users/{uid}/preferences",
            get(get_preferences).put(put_preferences),
        )
        .route(
            "/api/users/{uid}/profile",
            get(get_profile).put(put_profile),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    db_path: PathBuf,
    llm: Option<OpenAiClient>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    if llm.is_none() {
        eprintln!("Note: OPENAI_API_KEY is not set. Chat and nudges will use fallback replies.");
    }

    let state = AppState {
        db: Arc::new(DbPool::new(db_path, db)),
        llm: llm.map(Arc::new),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {}...{} (see api_key file in data directory)",
            &key[..4],
            &key[key.len() - 4..],
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    tracing::info!("listening on http://{bind}:{port}");
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use whisper_core::store::HealthStore;

    fn test_state(api_key: Option<String>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whisper.db");
        let db = Database::open(&path).unwrap();
        let state = AppState {
            db: Arc::new(DbPool::new(path, db)),
            llm: None,
            api_key,
        };
        (state, dir)
    }

    fn test_app(api_key: Option<String>) -> (Router, tempfile::TempDir) {
        let (state, dir) = test_state(api_key);
        (build_router(state), dir)
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap()
    }

    // --- Auth & hardening ---

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let (app, _dir) = test_app(Some("test-key-abc123".to_string()));
        let (status, json) = send(&app, get_req("/api/users/u1/preferences")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let (app, _dir) = test_app(Some("test-key-abc123".to_string()));
        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1/preferences")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let (app, _dir) = test_app(Some("test-key-abc123".to_string()));
        let response = app
            .oneshot(
                axum::http::Request::get("/api/users/u1/preferences")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_auth_mode_allows_requests() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(&app, get_req("/api/users/u1/preferences")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["uid"], "u1");
        assert_eq!(json["timezone"], "America/New_York");
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let (app, _dir) = test_app(Some("secret".to_string()));
        let response = app
            .oneshot(get_req("/api/users/u1/goals"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let (app, _dir) = test_app(None);
        let big_body = vec![b' '; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/users/u1/meals")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/whisper.db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }

    #[tokio::test]
    async fn expired_datastore_session_maps_to_401() {
        let err = anyhow::Error::new(StoreError::AuthExpired).context("Failed to save meal");
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let other = anyhow::Error::new(StoreError::Transient("busy".into()));
        assert_eq!(
            ApiError::from(other).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn invalid_uid_returns_400() {
        let (app, _dir) = test_app(None);
        let long = "x".repeat(MAX_UID_LEN + 1);
        let (status, _) = send(&app, get_req(&format!("/api/users/{long}/profile"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, get_req("/api/users/bad%20id/profile")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // --- Connections ---

    #[test]
    fn pool_reuses_returned_connections() {
        let (state, _dir) = test_state(None);
        let pool = &state.db;
        assert_eq!(pool.idle_count(), 1);
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(pool.idle_count(), 0);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.with(|_| 7).unwrap(), 7);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn busy_connection_does_not_block_other_requests() {
        let (state, _dir) = test_state(None);
        let app = build_router(state.clone());

        // A request parked on a slow model call keeps its connection checked out.
        let held = state.db.take().unwrap();
        let mut prefs = Preferences::defaults("u2");
        prefs.timezone = "Europe/Berlin".to_string();
        held.save_preferences(&prefs).unwrap();

        let response = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            app.oneshot(get_req("/api/users/u2/preferences")),
        )
        .await
        .expect("request waited on a busy connection")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["timezone"], "Europe/Berlin");
        state.db.release(held);
    }

    // --- Logging ---

    #[tokio::test]
    async fn metrics_then_snapshot() {
        let (app, _dir) = test_app(None);
        let (status, _) = send(&app, get_req("/api/users/u1/snapshot")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/metrics",
                &serde_json::json!({"steps": 8200, "mood": 4, "notes": "walked to work"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["source"], "manual");
        assert_eq!(json["steps"], 8200.0);

        let (status, json) = send(&app, get_req("/api/users/u1/snapshot")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["scope"], "today");
        assert_eq!(json["steps"], 8200.0);
    }

    #[tokio::test]
    async fn metrics_validation_returns_400() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req("POST", "/api/users/u1/metrics", &serde_json::json!({"mood": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("mood"));

        let (status, _) = send(
            &app,
            json_req("POST", "/api/users/u1/metrics", &serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/metrics",
                &serde_json::json!({"steps": 10, "source": "satellite"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn meal_create_and_list() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(&app, get_req("/api/users/u1/meals")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["meals"].as_array().unwrap().len(), 0);

        let (status, json) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/meals",
                &serde_json::json!({"meal_type": "snack", "text": "apple; 95"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["meal_type"], "snacks");
        assert!(json["blurb"].as_str().unwrap().starts_with("Snacks • apple → kcal 95"));

        let (status, json) = send(&app, get_req("/api/users/u1/meals")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["meals"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn meal_validation_returns_400() {
        let (app, _dir) = test_app(None);
        let (status, _) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/meals",
                &serde_json::json!({"meal_type": "brunch", "text": "eggs"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/meals",
                &serde_json::json!({"meal_type": "lunch", "text": "   "}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn journal_entries() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/journal",
                &serde_json::json!({"text": "Slept badly", "tags": ["sleep"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["tags"][0], "sleep");

        let (status, _) = send(
            &app,
            json_req("POST", "/api/users/u1/journal", &serde_json::json!({"text": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // --- Views ---

    #[tokio::test]
    async fn summary_days_bounds() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(&app, get_req("/api/users/u1/summary")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["days"].is_array());

        let (status, _) = send(&app, get_req("/api/users/u1/summary?days=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, get_req("/api/users/u1/summary?days=365")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn goals_report_with_no_history() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(&app, get_req("/api/users/u1/goals")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["streak"], 0);
        assert_eq!(json["badges"].as_array().unwrap().len(), 0);
        assert_eq!(json["goals"]["steps"], 8000.0);
    }

    #[tokio::test]
    async fn twin_applies_query_plan() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            get_req("/api/users/u1/twin?steps=2000&intake_kcal=-150&days=90"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["days"], 90);
        assert_eq!(json["baseline"]["habits"]["steps"], 6000.0);
        assert_eq!(json["planned"]["habits"]["steps"], 8000.0);
        assert_eq!(json["planned"]["habits"]["intake_kcal"], 1850.0);
        assert_eq!(json["baseline"]["weights"].as_array().unwrap().len(), 91);

        let (status, _) = send(&app, get_req("/api/users/u1/twin?days=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // --- Conversation ---

    #[tokio::test]
    async fn chat_without_model_falls_back() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req(
                "POST",
                "/api/users/u1/chat",
                &serde_json::json!({"text": "any tips for tomorrow?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["source"], "fallback");
        assert!(!json["text"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forced_nudge_is_returned() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req("POST", "/api/users/u1/nudge", &serde_json::json!({"force": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["due"], true);
        assert!(json["text"].is_string());
    }

    #[tokio::test]
    async fn nudge_respects_disabled_cadence() {
        let (app, _dir) = test_app(None);
        let (status, _) = send(
            &app,
            json_req(
                "PUT",
                "/api/users/u1/preferences",
                &serde_json::json!({"nudge_cadence": "off"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::post("/api/users/u1/nudge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["due"], false);
        assert!(json.get("text").is_none());
    }

    // --- Settings ---

    #[tokio::test]
    async fn preferences_partial_update() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req(
                "PUT",
                "/api/users/u1/preferences",
                &serde_json::json!({"timezone": "Europe/Berlin", "daily_step_goal": 10000}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["timezone"], "Europe/Berlin");

        let (_, json) = send(&app, get_req("/api/users/u1/preferences")).await;
        assert_eq!(json["daily_step_goal"], 10000.0);
        assert_eq!(json["daily_water_ml"], 2000.0);

        let (status, _) = send(
            &app,
            json_req(
                "PUT",
                "/api/users/u1/preferences",
                &serde_json::json!({"timezone": "Mars/Olympus"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn profile_update_and_validation() {
        let (app, _dir) = test_app(None);
        let (status, json) = send(
            &app,
            json_req(
                "PUT",
                "/api/users/u1/profile",
                &serde_json::json!({"age": 34, "weight_kg": 70.5, "gender": "female"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["uid"], "u1");
        assert_eq!(json["age"], 34);

        let (status, _) = send(
            &app,
            json_req("PUT", "/api/users/u1/profile", &serde_json::json!({"age": 300})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = send(&app, get_req("/api/users/u1/profile")).await;
        assert_eq!(json["age"], 34);
    }
}
