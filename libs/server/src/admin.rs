//! The admin surface. Every route requires the shared-secret tier.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use porter_shared::auth::AuthContext;
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, authenticate, check_rate};
use crate::state::ApiState;
use crate::tokens::{TokenError, TokenGrant};

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/admin/tokens",
            post({
                let state = state.clone();
                move |headers: HeaderMap, Json(grant): Json<TokenGrant>| {
                    let state = state.clone();
                    async move { create_token_handler(state, headers, grant).await }
                }
            }),
        )
        .route(
            "/admin/tokens/refresh",
            post({
                let state = state.clone();
                move |headers: HeaderMap, Json(request): Json<RefreshRequest>| {
                    let state = state.clone();
                    async move { refresh_token_handler(state, headers, request).await }
                }
            }),
        )
        .route(
            "/admin/tokens/revoked",
            get({
                let state = state.clone();
                move |headers: HeaderMap| {
                    let state = state.clone();
                    async move { list_revoked_handler(state, headers).await }
                }
            }),
        )
        .route(
            "/admin/tokens/{jti}",
            delete({
                let state = state.clone();
                move |headers: HeaderMap, Path(jti): Path<String>| {
                    let state = state.clone();
                    async move { revoke_token_handler(state, headers, jti).await }
                }
            }),
        )
        .route(
            "/admin/sessions",
            get({
                let state = state.clone();
                move |headers: HeaderMap, Query(filter): Query<SessionFilter>| {
                    let state = state.clone();
                    async move { list_sessions_handler(state, headers, filter).await }
                }
            }),
        )
        .route(
            "/admin/sessions/{session_id}",
            delete({
                let state = state.clone();
                move |headers: HeaderMap, Path(session_id): Path<String>| {
                    let state = state.clone();
                    async move { delete_session_handler(state, headers, session_id).await }
                }
            }),
        )
        .route(
            "/admin/stats",
            get(move |headers: HeaderMap| {
                let state = state.clone();
                async move { stats_handler(state, headers).await }
            }),
        )
}

/// Authenticate and require the shared-secret tier.
fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<AuthContext, Response> {
    let auth = authenticate(state, headers)?;
    if let Some(response) = check_rate(state, &auth) {
        return Err(response);
    }
    if !auth.is_admin() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiError {
                error: "admin_required".to_string(),
                message: "This endpoint requires the shared-secret tier".to_string(),
            }),
        )
            .into_response());
    }
    Ok(auth)
}

fn tokens_unconfigured() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiError {
            error: "tokens_unconfigured".to_string(),
            message: "Token auth is not configured (no JWT secret set)".to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct CreatedTokenResponse {
    token_type: &'static str,
    access_token: String,
    jti: String,
    expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_jti: Option<String>,
}

async fn create_token_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    grant: TokenGrant,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let Some(tokens) = &state.tokens else {
        return tokens_unconfigured();
    };

    if grant.client_name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "invalid_grant".to_string(),
                message: "client_name must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    let access = match tokens.issue_access(&grant) {
        Ok(access) => access,
        Err(error) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    error: "token_issue_failed".to_string(),
                    message: error.to_string(),
                }),
            )
                .into_response();
        }
    };

    let refresh = if tokens.refresh_enabled() {
        tokens.issue_refresh(&grant).ok()
    } else {
        None
    };

    tracing::info!(
        client = %grant.client_name,
        jti = %access.jti,
        "issued access token"
    );

    (
        StatusCode::OK,
        Json(CreatedTokenResponse {
            token_type: "Bearer",
            access_token: access.token,
            jti: access.jti,
            expires_at: access.expires_at,
            refresh_token: refresh.as_ref().map(|issued| issued.token.clone()),
            refresh_jti: refresh.map(|issued| issued.jti),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh_token_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    request: RefreshRequest,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let Some(tokens) = &state.tokens else {
        return tokens_unconfigured();
    };

    match tokens.refresh_access(&request.refresh_token) {
        Ok(access) => (
            StatusCode::OK,
            Json(CreatedTokenResponse {
                token_type: "Bearer",
                access_token: access.token,
                jti: access.jti,
                expires_at: access.expires_at,
                refresh_token: None,
                refresh_jti: None,
            }),
        )
            .into_response(),
        Err(TokenError::RefreshDisabled) => tokens_unconfigured(),
        Err(error) => (
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "refresh_failed".to_string(),
                message: error.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn revoke_token_handler(state: Arc<ApiState>, headers: HeaderMap, jti: String) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    match state.revocations.revoke(&jti) {
        Ok(()) => {
            tracing::info!(jti = %jti, "revoked token");
            (StatusCode::OK, Json(serde_json::json!({"revoked": jti}))).into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                error: "revoke_failed".to_string(),
                message: error.to_string(),
            }),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct RevokedTokenItem {
    jti: String,
    revoked_at: String,
}

async fn list_revoked_handler(state: Arc<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    match state.revocations.list() {
        Ok(rows) => {
            let revoked: Vec<RevokedTokenItem> = rows
                .into_iter()
                .map(|(jti, revoked_at)| RevokedTokenItem { jti, revoked_at })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({"revoked": revoked}))).into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                error: "list_failed".to_string(),
                message: error.to_string(),
            }),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionFilter {
    #[serde(default)]
    client: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionItem {
    session_id: String,
    agent_name: String,
    client_name: Option<String>,
    context_id: String,
    task_id: Option<String>,
    created_at: i64,
    last_accessed_at: i64,
    total_cost_usd: f64,
    message_count: i64,
    process_alive: bool,
    last_pid: Option<u32>,
}

impl From<porter_store::SessionMetadata> for SessionItem {
    fn from(meta: porter_store::SessionMetadata) -> Self {
        Self {
            session_id: meta.session_id,
            agent_name: meta.agent_name,
            client_name: meta.client_name,
            context_id: meta.context_id,
            task_id: meta.task_id,
            created_at: meta.created_at,
            last_accessed_at: meta.last_accessed_at,
            total_cost_usd: meta.total_cost_usd,
            message_count: meta.message_count,
            process_alive: meta.process_alive,
            last_pid: meta.last_pid,
        }
    }
}

async fn list_sessions_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    filter: SessionFilter,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    let sessions: Vec<SessionItem> = match filter.client {
        Some(client) => state.sessions.list_for_client(&client),
        None => state.sessions.list_all(),
    }
    .into_iter()
    .map(SessionItem::from)
    .collect();

    (StatusCode::OK, Json(serde_json::json!({"sessions": sessions}))).into_response()
}

async fn delete_session_handler(
    state: Arc<ApiState>,
    headers: HeaderMap,
    session_id: String,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    let Some(meta) = state.sessions.get(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: "session_not_found".to_string(),
                message: format!("Session '{session_id}' was not found"),
            }),
        )
            .into_response();
    };

    let destroyed = state.pool.destroy_session(&meta.context_id).await;
    if let Err(error) = state.sessions.delete(&session_id) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                error: "delete_failed".to_string(),
                message: error.to_string(),
            }),
        )
            .into_response();
    }

    tracing::info!(session_id = %session_id, destroyed, "admin deleted session");
    (
        StatusCode::OK,
        Json(serde_json::json!({"deleted": session_id, "worker_destroyed": destroyed})),
    )
        .into_response()
}

async fn stats_handler(state: Arc<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    let budget = match state.budget.snapshot() {
        Ok(snapshot) => snapshot,
        Err(error) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    error: "stats_failed".to_string(),
                    message: error.to_string(),
                }),
            )
                .into_response();
        }
    };

    let enabled_agents: Vec<&str> = state
        .agents
        .iter()
        .filter(|agent| agent.enabled)
        .map(|agent| agent.name.as_str())
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "sessions": state.sessions.count(),
            "active_processes": state.pool.session_count().await,
            "enabled_agents": enabled_agents,
            "budget": budget,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use http_body_util::BodyExt;
    use porter_shared::AgentDefinition;
    use porter_store::{
        BudgetOptions, BudgetTracker, Database, RevocationStore, SessionStore,
        SessionStoreOptions, TaskStore,
    };
    use porter_worker::{PoolOptions, SessionPool};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::auth_gate::AuthGate;
    use crate::orchestrator::Orchestrator;
    use crate::rate_limit::{RateLimiter, RateLimiterOptions};
    use crate::tokens::{TokenOptions, TokenService};

    fn test_state(dir: &tempfile::TempDir, enable_refresh: bool) -> Arc<ApiState> {
        let db = Database::open(&dir.path().join("porter.db"))
            .unwrap_or_else(|error| panic!("db open failed: {error}"));
        let sessions = Arc::new(
            SessionStore::open(db.clone(), SessionStoreOptions::default())
                .unwrap_or_else(|error| panic!("session store failed: {error}")),
        );
        let tasks = Arc::new(TaskStore::new(db.clone()));
        let budget = Arc::new(BudgetTracker::new(db.clone(), BudgetOptions::default()));
        let revocations = Arc::new(
            RevocationStore::open(db).unwrap_or_else(|error| panic!("revocations failed: {error}")),
        );
        let tokens = Arc::new(TokenService::new(
            TokenOptions {
                enable_refresh,
                ..TokenOptions::new("jwt-secret")
            },
            Arc::clone(&revocations),
        ));
        let pool = Arc::new(SessionPool::new(PoolOptions {
            request_timeout: Duration::from_secs(5),
            ..PoolOptions::default()
        }));
        let agents: Arc<Vec<AgentDefinition>> = Arc::new(Vec::new());

        Arc::new(ApiState {
            orchestrator: Orchestrator::new(
                Arc::clone(&agents),
                Arc::clone(&pool),
                Arc::clone(&sessions),
                Arc::clone(&tasks),
                Arc::clone(&budget),
            ),
            auth: AuthGate::new(Some("master-key".to_string()), Some(Arc::clone(&tokens))),
            rate_limiter: RateLimiter::new(RateLimiterOptions::default()),
            tokens: Some(tokens),
            revocations,
            sessions,
            tasks,
            pool,
            budget,
            agents,
            started_at: Instant::now(),
            server_name: "porter-test".to_string(),
            token_debug: false,
        })
    }

    async fn call(
        state: &Arc<ApiState>,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = axum::http::Request::builder().method(method).uri(uri);
        if let Some(bearer) = bearer {
            request = request.header("authorization", format!("Bearer {bearer}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => request.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|error| panic!("request build failed: {error}"));

        let response = router(Arc::clone(state))
            .oneshot(request)
            .await
            .unwrap_or_else(|error| panic!("request failed: {error}"));
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .unwrap_or_else(|error| panic!("body read failed: {error}"))
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null));
        (status, value)
    }

    #[tokio::test]
    async fn token_lifecycle_issue_use_revoke() {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let state = test_state(&dir, false);

        let (status, created) = call(
            &state,
            "POST",
            "/admin/tokens",
            Some("master-key"),
            Some(serde_json::json!({"client_name": "alice", "scopes": ["general"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let jti = created["jti"]
            .as_str()
            .unwrap_or_else(|| panic!("jti missing"))
            .to_string();

        let (status, _) = call(
            &state,
            "DELETE",
            &format!("/admin/tokens/{jti}"),
            Some("master-key"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, listed) = call(
            &state,
            "GET",
            "/admin/tokens/revoked",
            Some("master-key"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["revoked"][0]["jti"], serde_json::json!(jti));

        // The revoked access token no longer authenticates.
        let token = created["access_token"]
            .as_str()
            .unwrap_or_else(|| panic!("token missing"));
        let (status, _) = call(&state, "GET", "/admin/stats", Some(token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_reject_the_token_tier() {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let state = test_state(&dir, false);

        let (_, created) = call(
            &state,
            "POST",
            "/admin/tokens",
            Some("master-key"),
            Some(serde_json::json!({"client_name": "alice", "scopes": ["*"]})),
        )
        .await;
        let token = created["access_token"]
            .as_str()
            .unwrap_or_else(|| panic!("token missing"));

        let (status, body) = call(&state, "GET", "/admin/stats", Some(token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "admin_required");
    }

    #[tokio::test]
    async fn refresh_exchange_returns_a_fresh_access_token() {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let state = test_state(&dir, true);

        let (_, created) = call(
            &state,
            "POST",
            "/admin/tokens",
            Some("master-key"),
            Some(serde_json::json!({"client_name": "alice", "scopes": ["general"]})),
        )
        .await;
        let refresh_token = created["refresh_token"]
            .as_str()
            .unwrap_or_else(|| panic!("refresh token missing"));

        let (status, refreshed) = call(
            &state,
            "POST",
            "/admin/tokens/refresh",
            Some("master-key"),
            Some(serde_json::json!({"refresh_token": refresh_token})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(refreshed["access_token"].is_string());

        // The refresh token itself must not work as an access credential.
        let (status, _) = call(&state, "GET", "/admin/stats", Some(refresh_token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stats_reports_sessions_and_budget() {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let state = test_state(&dir, false);

        state
            .sessions
            .create(porter_store::SessionMetadata::new(
                "s1",
                "general",
                Some("alice".to_string()),
                "ctx-1",
                None,
            ))
            .unwrap_or_else(|error| panic!("create failed: {error}"));

        let (status, body) = call(&state, "GET", "/admin/stats", Some("master-key"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["active_processes"], 0);

        let (status, listed) = call(
            &state,
            "GET",
            "/admin/sessions?client=alice",
            Some("master-key"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["sessions"][0]["session_id"], "s1");
    }
}
