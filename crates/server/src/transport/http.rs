// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers translating orchestrator operations to JSON.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode};
use crate::orchestrator::{CreateOptions, Orchestrator};

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse().map_err(|_| ApiError::new(ErrorCode::NotFound, format!("no such session: {raw}")))
}

// -- Handlers -----------------------------------------------------------------

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "service": "corral",
    }))
}

/// `GET /sessions`
pub async fn list_sessions(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": orch.list_active(),
        "stats": orch.stats(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub working_directory: String,
    #[serde(flatten)]
    pub options: CreateOptions,
}

/// `POST /sessions`
pub async fn create_session(
    State(orch): State<Arc<Orchestrator>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = orch.create(&body.working_directory, body.options).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `GET /sessions/{id}`
pub async fn session_details(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    Ok(Json(orch.details(id).await?))
}

/// `GET /sessions/{id}/status`
pub async fn session_status(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    Ok(Json(orch.status(id)?))
}

/// `DELETE /sessions/{id}`
pub async fn delete_session(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    if orch.terminate(id).await {
        Ok(Json(serde_json::json!({
            "success": true,
            "message": "session terminated",
        })))
    } else {
        Err(ApiError::new(ErrorCode::NotFound, "no such session"))
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub message: String,
    /// Accepted for wire compatibility; ordering is strictly by sequence.
    #[serde(default)]
    #[allow(dead_code)]
    pub priority: Option<String>,
}

/// `POST /sessions/{id}/messages`
pub async fn enqueue_message(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let item = orch.enqueue(id, body.message).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
