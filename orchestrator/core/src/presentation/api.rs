// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::application::ServiceRuntime;
use crate::domain::lifecycle::AgentError;
use crate::domain::requests::{InitRequest, LoadRequest, StartRequest};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

pub struct AppState {
    pub runtime: ServiceRuntime,
}

pub fn app(runtime: ServiceRuntime) -> Router {
    let state = std::sync::Arc::new(AppState { runtime });

    Router::new()
        .route("/load", post(load))
        .route("/init", post(init))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/reset", post(reset))
        .route("/destroy", post(destroy))
        .route("/test", post(test))
        .route("/information", get(information))
        .route("/health", get(health))
        .with_state(state)
}

type SharedState = State<std::sync::Arc<AppState>>;

/// `AgentError` rendered as `{ "phase", "error" }`
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::Configuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::Resolution { .. } | AgentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "phase": self.0.phase(),
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

async fn load(State(state): SharedState, Json(request): Json<LoadRequest>) -> Result<Response, ApiError> {
    let response = state.runtime.load(request).await?;
    Ok(Json(response).into_response())
}

async fn init(State(state): SharedState, Json(request): Json<InitRequest>) -> Result<Response, ApiError> {
    let response = state.runtime.init(request).await?;
    Ok(Json(response).into_response())
}

async fn start(State(state): SharedState, Json(request): Json<StartRequest>) -> Result<Response, ApiError> {
    state.runtime.start(request).await?;
    Ok(Json(json!({ "status": "started" })).into_response())
}

async fn stop(State(state): SharedState) -> Result<Response, ApiError> {
    state.runtime.stop().await?;
    Ok(Json(json!({ "status": "stopped" })).into_response())
}

async fn reset(State(state): SharedState) -> Result<Response, ApiError> {
    state.runtime.reset().await?;
    Ok(Json(json!({ "status": "reset" })).into_response())
}

async fn destroy(State(state): SharedState) -> Result<Response, ApiError> {
    state.runtime.destroy().await?;
    Ok(Json(json!({ "status": "destroyed" })).into_response())
}

async fn test(State(state): SharedState) -> Result<Response, ApiError> {
    let result = state.runtime.test().await?;
    Ok(Json(result).into_response())
}

async fn information(State(state): SharedState) -> impl IntoResponse {
    Json(state.runtime.information().await)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
