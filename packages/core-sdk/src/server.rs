use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::document::{DocumentSnapshot, MemoryDocument};
use crate::models::{ModelDescriptor, Status};
use crate::session::{Action, Session};
use crate::telemetry::{FileLogger, LogEntry, Logger, MemoryLogger};

/**
 * \brief 服务共享状态：会话及其内存宿主文档与日志面板。
 */
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub document: Arc<MemoryDocument>,
    pub log: Arc<MemoryLogger>,
    pub file_logger: Arc<FileLogger>,
}

impl AppState {
    /**
     * \brief 组装默认状态：内存文档 + 文件日志 + 日志面板，并恢复上次设置。
     */
    pub fn bootstrap(store: crate::db::SettingsStore) -> Result<Self> {
        let telemetry_enabled = store.telemetry_enabled().unwrap_or(false);
        let file_logger = Arc::new(FileLogger::new("logs", telemetry_enabled));
        let log = Arc::new(MemoryLogger::forwarding(200, file_logger.clone()));
        let document = Arc::new(MemoryDocument::default());
        let session = Arc::new(Session::with_openrouter(
            store,
            document.clone(),
            log.clone(),
        ));
        session.restore()?;
        Ok(Self {
            session,
            document,
            log,
            file_logger,
        })
    }
}

/**
 * \brief 构建路由；静态前端从 PLANKTON_UI_DIR（默认 web）提供。
 */
pub fn router(state: AppState) -> Router {
    let ui_root = std::env::var("PLANKTON_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    Router::new()
        .route("/api/settings", get(get_settings))
        .route("/api/settings/api-key", post(set_api_key))
        .route("/api/settings/model", post(set_model))
        .route("/api/settings/autocomplete", post(set_autocomplete))
        .route("/api/settings/telemetry", post(set_telemetry))
        .route("/api/models", get(list_models))
        .route("/api/models/refresh", post(refresh_models))
        .route("/api/actions", post(run_action))
        .route("/api/status", get(get_status))
        .route("/api/log", get(get_log))
        .route("/api/document", get(get_document).put(put_document))
        .route("/api/document/selection", post(set_selection))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5174"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    state.log.info(&format!("server listening on http://{}", addr));
    println!("Server listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Serialize, Debug)]
struct SettingsView {
    api_key_set: bool,
    selected_model: Option<String>,
    autocomplete_enabled: bool,
    autocomplete_delay_ms: u64,
    autocomplete_armed: bool,
    telemetry_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct ApiKeyInput {
    api_key: String,
}

#[derive(Deserialize, Debug)]
struct ModelInput {
    model: String,
}

#[derive(Deserialize, Debug)]
struct AutocompleteInput {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct TelemetryInput {
    enabled: bool,
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    #[serde(default)]
    q: Option<String>,
}

#[derive(Serialize, Debug)]
struct ModelList {
    models: Vec<ModelDescriptor>,
    total: usize,
}

#[derive(Deserialize, Debug)]
struct DocumentInput {
    text: String,
    #[serde(default)]
    selection_start: Option<usize>,
    #[serde(default)]
    selection_end: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct SelectionInput {
    start: usize,
    end: usize,
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<SettingsView> {
    let settings = state.session.settings();
    Ok(Json(SettingsView {
        api_key_set: settings.api_key.is_some(),
        selected_model: settings.selected_model,
        autocomplete_enabled: settings.autocomplete_enabled,
        autocomplete_delay_ms: settings.autocomplete_delay_ms,
        autocomplete_armed: state.session.autocomplete_armed(),
        telemetry_enabled: state.file_logger.is_enabled(),
    }))
}

async fn set_api_key(
    State(state): State<AppState>,
    Json(input): Json<ApiKeyInput>,
) -> ApiResult<Status> {
    Ok(Json(state.session.set_api_key(&input.api_key)))
}

async fn set_model(
    State(state): State<AppState>,
    Json(input): Json<ModelInput>,
) -> ApiResult<Status> {
    Ok(Json(state.session.select_model(&input.model)))
}

/**
 * \brief 先更新延迟再切换开关，任一步失败即返回该状态。
 */
async fn set_autocomplete(
    State(state): State<AppState>,
    Json(input): Json<AutocompleteInput>,
) -> ApiResult<Status> {
    let mut status = state.session.status();
    if let Some(delay_ms) = input.delay_ms {
        status = state.session.set_autocomplete_delay(delay_ms);
        if !status.is_success() {
            return Ok(Json(status));
        }
    }
    if let Some(enabled) = input.enabled {
        status = state.session.set_autocomplete(enabled);
    }
    Ok(Json(status))
}

async fn set_telemetry(
    State(state): State<AppState>,
    Json(input): Json<TelemetryInput>,
) -> ApiResult<serde_json::Value> {
    state
        .session
        .settings_store()
        .save_telemetry_enabled(input.enabled)
        .map_err(internal_err)?;
    state.file_logger.set_enabled(input.enabled);
    Ok(Json(serde_json::json!({ "telemetry_enabled": input.enabled })))
}

async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> ApiResult<ModelList> {
    let total = state.session.models().len();
    let models = state.session.filter_models(q.q.as_deref().unwrap_or(""));
    Ok(Json(ModelList { models, total }))
}

async fn refresh_models(State(state): State<AppState>) -> ApiResult<Status> {
    Ok(Json(state.session.refresh_models().await))
}

async fn run_action(
    State(state): State<AppState>,
    Json(action): Json<Action>,
) -> ApiResult<Status> {
    Ok(Json(state.session.run(action).await))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<Status> {
    Ok(Json(state.session.status()))
}

async fn get_log(State(state): State<AppState>) -> ApiResult<Vec<LogEntry>> {
    Ok(Json(state.log.entries()))
}

async fn get_document(State(state): State<AppState>) -> ApiResult<DocumentSnapshot> {
    Ok(Json(state.document.snapshot().map_err(internal_err)?))
}

async fn put_document(
    State(state): State<AppState>,
    Json(input): Json<DocumentInput>,
) -> ApiResult<DocumentSnapshot> {
    let len = input.text.chars().count();
    let end = input.selection_end.unwrap_or(len);
    let start = input.selection_start.unwrap_or(end);
    state
        .document
        .load(input.text, start, end)
        .map_err(bad_request)?;
    Ok(Json(state.document.snapshot().map_err(internal_err)?))
}

/**
 * \brief 模拟用户移动选区，会触发自动补全计时。
 */
async fn set_selection(
    State(state): State<AppState>,
    Json(input): Json<SelectionInput>,
) -> ApiResult<DocumentSnapshot> {
    state
        .document
        .set_selection(input.start, input.end)
        .map_err(bad_request)?;
    Ok(Json(state.document.snapshot().map_err(internal_err)?))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(Json(serde_json::json!({
        "ok": true,
        "client": state.session.has_client(),
        "models": state.session.models().len(),
        "autocomplete": state.session.autocomplete_armed(),
    })))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}
