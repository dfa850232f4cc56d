//! The public HTTP surface: A2A JSON-RPC, its REST mirror, the discovery
//! document, and the health endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use porter_shared::a2a::{JsonRpcRequest, JsonRpcResponse, error_codes};
use porter_shared::auth::AuthContext;
use serde::Serialize;

use crate::admin;
use crate::auth_gate::AuthError;
use crate::orchestrator::{MessageSendParams, SendRejection};
use crate::state::ApiState;

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub error: String,
    pub message: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/a2a/jsonrpc",
            post({
                let state = state.clone();
                move |headers: HeaderMap, Json(request): Json<JsonRpcRequest>| {
                    let state = state.clone();
                    async move { jsonrpc_handler(state, headers, request).await }
                }
            }),
        )
        .route(
            "/a2a/rest/message/send",
            post({
                let state = state.clone();
                move |headers: HeaderMap, Json(params): Json<MessageSendParams>| {
                    let state = state.clone();
                    async move { rest_send_handler(state, headers, params).await }
                }
            }),
        )
        .route(
            "/a2a/rest/tasks/{task_id}",
            get({
                let state = state.clone();
                move |headers: HeaderMap, Path(task_id): Path<String>| {
                    let state = state.clone();
                    async move { rest_task_get_handler(state, headers, task_id).await }
                }
            }),
        )
        .route(
            "/a2a/rest/tasks/{task_id}/cancel",
            post({
                let state = state.clone();
                move |headers: HeaderMap, Path(task_id): Path<String>| {
                    let state = state.clone();
                    async move { rest_task_cancel_handler(state, headers, task_id).await }
                }
            }),
        )
        .route(
            "/.well-known/agent-card.json",
            get({
                let state = state.clone();
                move || {
                    let state = state.clone();
                    async move { agent_card_handler(state).await }
                }
            }),
        )
        .route(
            "/health",
            get({
                let state = state.clone();
                move || {
                    let state = state.clone();
                    async move { health_handler(state).await }
                }
            }),
        )
        .merge(admin::router(state))
}

/// Authenticate the request or produce the 401 response. When token-debug
/// mode is on the verify-failure detail rides in the body.
pub(crate) fn authenticate(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<AuthContext, Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    state.auth.authenticate(authorization).map_err(|error| {
        let message = match (&error, state.token_debug) {
            (AuthError::Missing, _) => "Missing bearer credential".to_string(),
            (_, true) => error.to_string(),
            (_, false) => "Invalid bearer credential".to_string(),
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "unauthorized".to_string(),
                message,
            }),
        )
            .into_response()
    })
}

/// Apply the per-client rate limit or produce the 429 response.
pub(crate) fn check_rate(state: &ApiState, auth: &AuthContext) -> Option<Response> {
    match state
        .rate_limiter
        .check(&auth.client_name, auth.rate_limit_rpm)
    {
        Ok(()) => None,
        Err(retry_after) => Some(
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(ApiError {
                    error: "rate_limited".to_string(),
                    message: format!("Rate limit exceeded; retry after {retry_after}s"),
                }),
            )
                .into_response(),
        ),
    }
}

fn scope_denied_response(agent: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError {
            error: "scope_denied".to_string(),
            message: format!("Caller lacks a scope for agent '{agent}'"),
        }),
    )
        .into_response()
}

fn internal_response(detail: String) -> Response {
    tracing::error!(detail = %detail, "internal error while serving request");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: "internal".to_string(),
            message: "Internal server error".to_string(),
        }),
    )
        .into_response()
}

async fn jsonrpc_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    request: JsonRpcRequest,
) -> Response {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Some(response) = check_rate(&state, &auth) {
        return response;
    }

    let id = request.id.clone();
    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::failure(
            id,
            error_codes::INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ))
        .into_response();
    }

    match request.method.as_str() {
        "message/send" => {
            let params: MessageSendParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(error) => {
                    return Json(JsonRpcResponse::failure(
                        id,
                        error_codes::INVALID_PARAMS,
                        format!("invalid message/send params: {error}"),
                    ))
                    .into_response();
                }
            };
            match state.orchestrator.handle_message_send(&auth, params).await {
                Ok(message) => match serde_json::to_value(&message) {
                    Ok(result) => Json(JsonRpcResponse::success(id, result)).into_response(),
                    Err(error) => internal_response(error.to_string()),
                },
                Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
                Err(SendRejection::Internal(detail)) => internal_response(detail),
            }
        }
        "tasks/get" => {
            let Some(task_id) = request.params.get("id").and_then(|value| value.as_str()) else {
                return Json(JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tasks/get requires params.id",
                ))
                .into_response();
            };
            match state.orchestrator.handle_tasks_get(&auth, task_id) {
                Ok(Some(task)) => match serde_json::to_value(&task) {
                    Ok(result) => Json(JsonRpcResponse::success(id, result)).into_response(),
                    Err(error) => internal_response(error.to_string()),
                },
                Ok(None) => Json(JsonRpcResponse::failure(
                    id,
                    error_codes::TASK_NOT_FOUND,
                    "Task not found",
                ))
                .into_response(),
                Err(SendRejection::Internal(detail)) => internal_response(detail),
                Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
            }
        }
        "tasks/cancel" => {
            let Some(task_id) = request.params.get("id").and_then(|value| value.as_str()) else {
                return Json(JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tasks/cancel requires params.id",
                ))
                .into_response();
            };
            match state.orchestrator.handle_tasks_cancel(&auth, task_id).await {
                Ok(Some(task)) => match serde_json::to_value(&task) {
                    Ok(result) => Json(JsonRpcResponse::success(id, result)).into_response(),
                    Err(error) => internal_response(error.to_string()),
                },
                Ok(None) => Json(JsonRpcResponse::failure(
                    id,
                    error_codes::TASK_NOT_FOUND,
                    "Task not found",
                ))
                .into_response(),
                Err(SendRejection::Internal(detail)) => internal_response(detail),
                Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
            }
        }
        other => Json(JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown method '{other}'"),
        ))
        .into_response(),
    }
}

async fn rest_send_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    params: MessageSendParams,
) -> Response {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Some(response) = check_rate(&state, &auth) {
        return response;
    }

    match state.orchestrator.handle_message_send(&auth, params).await {
        Ok(message) => (StatusCode::OK, Json(message)).into_response(),
        Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
        Err(SendRejection::Internal(detail)) => internal_response(detail),
    }
}

async fn rest_task_get_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    task_id: String,
) -> Response {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Some(response) = check_rate(&state, &auth) {
        return response;
    }

    match state.orchestrator.handle_tasks_get(&auth, &task_id) {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: "task_not_found".to_string(),
                message: "Task not found".to_string(),
            }),
        )
            .into_response(),
        Err(SendRejection::Internal(detail)) => internal_response(detail),
        Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
    }
}

async fn rest_task_cancel_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    task_id: String,
) -> Response {
    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    if let Some(response) = check_rate(&state, &auth) {
        return response;
    }

    match state.orchestrator.handle_tasks_cancel(&auth, &task_id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: "task_not_found".to_string(),
                message: "Task not found".to_string(),
            }),
        )
            .into_response(),
        Err(SendRejection::Internal(detail)) => internal_response(detail),
        Err(SendRejection::Scope { agent }) => scope_denied_response(&agent),
    }
}

// ── Discovery & health ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentCard {
    name: String,
    description: String,
    version: String,
    capabilities: AgentCapabilities,
    default_input_modes: Vec<String>,
    default_output_modes: Vec<String>,
    skills: Vec<AgentSkill>,
    security_schemes: serde_json::Value,
    security: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentCapabilities {
    streaming: bool,
    push_notifications: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentSkill {
    id: String,
    name: String,
    description: String,
    tags: Vec<String>,
}

const INPUT_MIME_TYPES: &[&str] = &[
    "text",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
];

async fn agent_card_handler(state: Arc<ApiState>) -> impl IntoResponse {
    let skills = state
        .agents
        .iter()
        .filter(|agent| agent.enabled)
        .map(|agent| AgentSkill {
            id: agent.name.clone(),
            name: agent.name.clone(),
            description: agent.description.clone(),
            tags: vec!["conversation".to_string()],
        })
        .collect();

    Json(AgentCard {
        name: state.server_name.clone(),
        description: "A2A gateway for a local worker CLI".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: AgentCapabilities {
            streaming: false,
            push_notifications: false,
        },
        default_input_modes: INPUT_MIME_TYPES.iter().map(ToString::to_string).collect(),
        default_output_modes: vec!["text".to_string()],
        skills,
        security_schemes: serde_json::json!({
            "bearer": {"type": "http", "scheme": "bearer"}
        }),
        security: serde_json::json!([{"bearer": []}]),
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_processes: usize,
    active_sessions: usize,
    budget: porter_store::BudgetSnapshot,
}

async fn health_handler(state: Arc<ApiState>) -> Response {
    let budget = match state.budget.snapshot() {
        Ok(snapshot) => snapshot,
        Err(error) => return internal_response(error.to_string()),
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            active_processes: state.pool.session_count().await,
            active_sessions: state.sessions.count(),
            budget,
        }),
    )
        .into_response()
}
