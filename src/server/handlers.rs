//! HTTP handlers. Every path ends in a response; nothing here panics on
//! bad input.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::path::Path;
use tracing::{error, info, warn};

use super::AppState;
use crate::error::Pdf2JpgError;
use crate::janitor::Scope;

/// Log file served when `/log` is called without `file`.
pub const DEFAULT_LOG_FILE: &str = "pdf2jpg.log";

#[derive(Debug, Deserialize)]
pub struct ConvertParams {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub file: Option<String>,
}

/// Map a library error onto a status and a short plain-text body.
fn error_response(err: &Pdf2JpgError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
        return (status, "Internal server error").into_response();
    }
    (status, err.to_string()).into_response()
}

/// `GET /convert?url=<url>`: the JPEG thumbnail of the PDF's first page.
pub async fn convert(State(state): State<AppState>, Query(params): Query<ConvertParams>) -> Response {
    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        return error_response(&Pdf2JpgError::InvalidRequest {
            reason: "missing url".into(),
        });
    };

    match state.service.convert_url(&url).await {
        Ok(thumb) => {
            info!(url = %url, fingerprint = %thumb.fingerprint, cached = thumb.cached, "Image sent");
            (
                [
                    (header::CONTENT_TYPE, "image/jpeg".to_string()),
                    (header::CONTENT_LENGTH, thumb.bytes.len().to_string()),
                ],
                thumb.bytes,
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn clear(state: &AppState, scope: Scope) -> String {
    state.service.clear(scope).await.to_string()
}

pub async fn clear_images(State(state): State<AppState>) -> String {
    clear(&state, Scope::Images).await
}

pub async fn clear_staging(State(state): State<AppState>) -> String {
    clear(&state, Scope::Staging).await
}

pub async fn clear_blocklist(State(state): State<AppState>) -> String {
    clear(&state, Scope::Blocklist).await
}

pub async fn clear_all(State(state): State<AppState>) -> String {
    clear(&state, Scope::All).await
}

/// Liveness probe.
pub async fn status() -> &'static str {
    "OK"
}

/// `true` for a bare file name that cannot leave the directory it is joined to.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

/// `GET /log?file=<name>`: a file from the log directory.
pub async fn log_file(State(state): State<AppState>, Query(params): Query<LogParams>) -> Response {
    let name = params.file.unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    if !is_plain_file_name(&name) {
        warn!(file = %name, "Rejected log file name");
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }

    let path = state.log_dir.join(&name);
    let is_file = tokio::fs::metadata(&path)
        .await
        .is_ok_and(|m| m.is_file());
    if !is_file {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }
    match tokio::fs::read(&path).await {
        Ok(content) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            content,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read log file");
            (StatusCode::NOT_FOUND, "File not found").into_response()
        }
    }
}

/// `GET /kill`: answer, then drain connections and stop.
pub async fn kill(State(state): State<AppState>) -> &'static str {
    info!("Shutdown requested");
    state.shutdown.notify_one();
    "Shutting down"
}
