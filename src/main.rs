//! xprotect-export — thin HTTP collaborator around the `Exporter` facade.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xprotect_export::config::Config;
use xprotect_export::error::ExportError;
use xprotect_export::{AuthBroker, ConfigClient, Exporter, ExportRegistry};

#[derive(Clone)]
struct AppState {
    exporter: Arc<Exporter>,
    config_client: Arc<ConfigClient>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
    error_tag: String,
}

fn error_response(err: &ExportError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ApiError {
            error: err.to_string(),
            error_tag: err.tag().to_string(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct StartExportRequest {
    camera_id: String,
    start_time: chrono::DateTime<chrono::Utc>,
    end_time: chrono::DateTime<chrono::Utc>,
}

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    match state.config_client.list_cameras().await {
        Ok(cameras) => (StatusCode::OK, Json(cameras)).into_response(),
        Err(e) => error_response(&ExportError::from(e)),
    }
}

async fn start_export(
    State(state): State<AppState>,
    Json(req): Json<StartExportRequest>,
) -> impl IntoResponse {
    let t0_ms = req.start_time.timestamp_millis();
    let t1_ms = req.end_time.timestamp_millis();
    match state.exporter.start(req.camera_id, t0_ms, t1_ms) {
        Ok(export_id) => {
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "export_id": export_id }))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn export_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.exporter.status(&id) {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("no such export: {id}"),
                error_tag: "not_found".into(),
            }),
        )
            .into_response(),
    }
}

async fn export_download(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.exporter.status(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if job.state != xprotect_export::ExportState::Succeeded {
        return (
            StatusCode::CONFLICT,
            Json(ApiError {
                error: format!("export {id} is not finished"),
                error_tag: "not_ready".into(),
            }),
        )
            .into_response();
    }
    let Some(path) = state.exporter.output_path(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "video/mp4")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to read export output");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn cancel_export(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.exporter.cancel(&id) {
        Some(true) => StatusCode::ACCEPTED.into_response(),
        Some(false) => StatusCode::CONFLICT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xprotect_export=info".into()),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(server = %config.server_url, "starting xprotect-export");

    tokio::fs::create_dir_all(&config.export_dir).await?;

    let auth = AuthBroker::new(&config)?;
    let config_client = Arc::new(ConfigClient::new(&config, Arc::clone(&auth))?);
    let registry = Arc::new(ExportRegistry::new());
    let exporter = Arc::new(Exporter::new(
        &config,
        Arc::clone(&auth),
        Arc::clone(&config_client),
        registry,
    ));

    let state = AppState {
        exporter,
        config_client,
    };

    let static_dir = config.static_dir.clone();
    let app = Router::new()
        .route("/api/cameras", get(list_cameras))
        .route("/api/export", post(start_export))
        .route("/api/export/{id}", get(export_status))
        .route("/api/export/{id}/download", get(export_download))
        .route("/api/export/{id}/cancel", post(cancel_export))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(ServeDir::new(static_dir));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
