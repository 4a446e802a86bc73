use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::agent::ChatAgent;
use crate::scheduler::{SummaryScheduler, TriggerOutcome};
use crate::store::{ConversationStore, MessageRole};

const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    Disabled,
}

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<ConversationStore>,
    pub agent: Arc<ChatAgent>,
    pub scheduler: Arc<SummaryScheduler>,
    pub auth_token: Option<String>,
    pub auth_mode: AuthMode,
}

fn parse_auth_mode(raw: Option<String>) -> AuthMode {
    match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if v == "disabled" || v == "off" || v == "none" => AuthMode::Disabled,
        _ => AuthMode::Required,
    }
}

async fn authorize(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    if state.auth_mode == AuthMode::Disabled {
        return Ok(next.run(req).await);
    }

    let Some(expected) = state.auth_token.as_deref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Server auth token not configured".to_string(),
        ));
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => Err((StatusCode::UNAUTHORIZED, "Invalid bearer token".to_string())),
    }
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!("Request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn not_found(what: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} not found", what))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(50).clamp(1, 500)
}

// ==================== Handlers ====================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_summary_view(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state
        .store
        .summary_view(&agent_name)
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(snapshot).map_err(|e| {
        internal_error(anyhow::Error::new(e))
    })?))
}

#[derive(Deserialize)]
struct SaveSummaryRequest {
    summary: String,
}

async fn save_summary(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
    Json(body): Json<SaveSummaryRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .store
        .append_summary_record(&agent_name, &body.summary)
        .map_err(internal_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn add_summary_message(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
    Json(body): Json<SaveSummaryRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let message_id = state
        .store
        .append_visible_summary(&agent_name, &body.summary)
        .map_err(internal_error)?;
    Ok(Json(json!({ "success": true, "messageId": message_id })))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ListMessagesQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit);
    let messages = state
        .store
        .get_messages(&agent_name, limit)
        .map_err(internal_error)?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
    #[serde(default)]
    role: Option<String>,
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(agent_name): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if body.content.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message content is empty".to_string()));
    }

    // A raw append lets clients record turns without invoking the model.
    if let Some(role) = body.role.as_deref() {
        let role = MessageRole::from_db(role);
        let message_id = state
            .store
            .append_text_message(&agent_name, role, &body.content)
            .map_err(internal_error)?;
        return Ok(Json(json!({ "success": true, "messageId": message_id })));
    }

    let reply = state
        .agent
        .handle_user_message(&agent_name, &body.content)
        .await
        .map_err(internal_error)?;
    Ok(Json(
        serde_json::to_value(reply).map_err(|e| internal_error(anyhow::Error::new(e)))?,
    ))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TriggerSummaryRequest {
    #[serde(default)]
    agent_name: Option<String>,
}

async fn trigger_summary(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<TriggerSummaryRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let agent = body
        .and_then(|Json(b)| b.agent_name)
        .unwrap_or_else(|| crate::store::DEFAULT_AGENT_NAME.to_string());

    match state.scheduler.trigger(&agent).await.map_err(internal_error)? {
        TriggerOutcome::Started { run_id } => Ok((
            StatusCode::OK,
            Json(json!({
                "success": true,
                "runId": run_id,
                "message": "Summary workflow triggered",
            })),
        )),
        TriggerOutcome::Skipped { reason } => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "success": false, "message": reason })),
        )),
    }
}

async fn get_run(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let run = state
        .store
        .get_run(&run_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Workflow run"))?;
    let steps = state
        .store
        .list_step_outcomes(&run_id)
        .map_err(internal_error)?;
    Ok(Json(json!({ "run": run, "steps": steps })))
}

// ==================== Router / entry ====================

pub fn build_router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/agents/:name/summary-view", get(get_summary_view))
        .route("/agents/:name/summary", post(save_summary))
        .route("/agents/:name/summary-message", post(add_summary_message))
        .route("/agents/:name/messages", get(list_messages).post(post_message))
        .route("/trigger-summary", post(trigger_summary))
        .route("/runs/:id", get(get_run))
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .with_state(state);

    Router::new().nest("/v1", api)
}

pub async fn serve_backend(
    state: Arc<ServerState>,
    spawn_scheduler: bool,
) -> anyhow::Result<()> {
    if state.auth_mode == AuthMode::Disabled {
        warn!("Bearer auth is DISABLED; do not expose this bind address");
    } else if state.auth_token.is_none() {
        warn!("RECAP_BACKEND_TOKEN is not set; all requests will be rejected");
    }

    if spawn_scheduler {
        let scheduler = state.scheduler.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    let bind = std::env::var("RECAP_BACKEND_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind, e))?;
    info!("Backend listening on http://{}", bind);

    let router = build_router(state);
    axum::serve(listener, router)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
    Ok(())
}


impl ServerState {
    pub fn from_env(
        store: Arc<ConversationStore>,
        agent: Arc<ChatAgent>,
        scheduler: Arc<SummaryScheduler>,
    ) -> Self {
        let auth_token = std::env::var("RECAP_BACKEND_TOKEN").ok().filter(|t| !t.is_empty());
        let auth_mode = parse_auth_mode(std::env::var("RECAP_BACKEND_AUTH_MODE").ok());
        Self {
            store,
            agent,
            scheduler,
            auth_token,
            auth_mode,
        }
    }
}
