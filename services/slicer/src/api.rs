//! HTTP upload API
//!
//! Provides the multipart upload endpoint that feeds the slicing pipeline.

use crate::config::ApiConfig;
use crate::orchestrator::{Orchestrator, PipelineResult, UploadRequest};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Outcome class of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    Accepted,
    BadRequest,
    ServerError,
}

impl UploadStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            UploadStatus::Accepted => StatusCode::OK,
            UploadStatus::BadRequest => StatusCode::BAD_REQUEST,
            UploadStatus::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Upload response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub status: UploadStatus,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    pub frame_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_frames: Vec<u32>,
}

impl UploadResponse {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::BadRequest,
            message: message.into(),
            request_id: String::new(),
            label: None,
            sequence: None,
            frame_count: 0,
            failed_frames: Vec::new(),
        }
    }
}

impl From<&PipelineResult> for UploadResponse {
    fn from(result: &PipelineResult) -> Self {
        let (status, message) = match &result.error {
            None => (UploadStatus::Accepted, "File uploaded successfully".to_string()),
            Some(e) if e.is_client_error() => (UploadStatus::BadRequest, e.to_string()),
            Some(e) => (
                UploadStatus::ServerError,
                format!("An error occurred while slicing the video: {}", e),
            ),
        };

        Self {
            status,
            message,
            request_id: result.request_id.to_string(),
            label: result.slot.as_ref().map(|slot| slot.label.clone()),
            sequence: result.slot.as_ref().map(|slot| slot.sequence_number),
            frame_count: result.frame_count,
            failed_frames: result.report.failed_indices(),
        }
    }
}

/// Form fields collected from a multipart body
#[derive(Debug, Default)]
struct UploadForm {
    video: Option<Bytes>,
    label: Option<String>,
    sequence_name: Option<String>,
}

impl UploadForm {
    fn wants_text(name: &str) -> bool {
        matches!(name, "label" | "sequenceName" | "sequence_name")
    }

    fn set_text(&mut self, name: &str, value: String) {
        match name {
            "label" => self.label = Some(value),
            "sequenceName" | "sequence_name" => self.sequence_name = Some(value),
            _ => {}
        }
    }

    fn into_request(self) -> UploadRequest {
        UploadRequest {
            video: self.video,
            label: self.label,
            sequence_name: self.sequence_name,
        }
    }
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, String> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "video" {
            form.video = Some(field.bytes().await.map_err(|e| e.body_text())?);
        } else if UploadForm::wants_text(&name) {
            let value = field.text().await.map_err(|e| e.body_text())?;
            form.set_text(&name, value);
        }
    }

    Ok(form)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", post(upload_video))
        .route("/api/v1/upload", post(upload_video))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "slicer-service",
        "backend": state.orchestrator.backend().name(),
    }))
}

/// Accept a video upload and slice it into frames
async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> (StatusCode, Json<UploadResponse>) {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Upload is not a multipart body");
            let response = UploadResponse::bad_request(rejection.body_text());
            return (response.status.status_code(), Json(response));
        }
    };

    let form = match read_form(multipart).await {
        Ok(form) => form,
        Err(message) => {
            warn!(error = %message, "Malformed multipart body");
            let response = UploadResponse::bad_request(message);
            return (response.status.status_code(), Json(response));
        }
    };

    let result = state.orchestrator.process(form.into_request()).await;
    let response = UploadResponse::from(&result);
    (response.status.status_code(), Json(response))
}

/// Start the API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
