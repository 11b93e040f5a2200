//! Administrative HTTP API
//!
//! Thin axum wrapper over [`AgentService`]:
//! - `GET /health`
//! - `POST /pub` raw publish on a logical topic
//! - `POST /exec` run a control command and return its response records
//! - `GET /config`, `POST /config` view or replace the agent configuration
//! - `GET /services` heartbeat registry snapshot

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AgentError, ErrorKind};
use crate::heartbeat::ServiceInfo;
use crate::senml::{self, Record};
use crate::service::AgentService;

pub type AppState = Arc<AgentService>;

#[derive(Debug, Deserialize)]
pub struct PubRequest {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub bn: String,
    pub n: String,
    pub vs: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

/// Agent error rendered as a JSON body with a status matching its kind
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Malformed | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownCommand => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Resource => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = ErrorBody {
            kind,
            message: self.0.to_string(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

pub fn build_router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/pub", post(publish))
        .route("/exec", post(exec))
        .route("/config", get(view_config).post(add_config))
        .route("/services", get(view_services))
        .with_state(service)
}

async fn publish(
    State(service): State<AppState>,
    Json(req): Json<PubRequest>,
) -> Result<StatusCode, ApiError> {
    service.publish(&req.topic, req.payload.into_bytes()).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn exec(
    State(service): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let uuid = req.bn.trim_end_matches(':').to_string();
    let payload = senml::encode(&req.bn, &req.n, &req.vs).map_err(AgentError::from)?;
    let records = match service.execute(&uuid, &payload).await? {
        Some(response) => senml::decode(&response).map_err(AgentError::from)?,
        None => Vec::new(),
    };
    Ok(Json(records))
}

async fn view_config(State(service): State<AppState>) -> Json<Config> {
    Json(service.config())
}

async fn add_config(
    State(service): State<AppState>,
    Json(config): Json<Config>,
) -> Result<Json<Config>, ApiError> {
    service.add_config(config).await?;
    Ok(Json(service.config()))
}

async fn view_services(State(service): State<AppState>) -> Json<Vec<ServiceInfo>> {
    Json(service.services())
}
