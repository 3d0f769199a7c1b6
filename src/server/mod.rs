//! HTTP front end for the conversion service.
//!
//! | Route | Effect |
//! |-------|--------|
//! | `GET /convert?url=` | JPEG of the first page |
//! | `GET /clearimg` `/clearpdf` `/clearblocks` `/clearall` | empty state dirs, body = count |
//! | `GET /status` | liveness |
//! | `GET /log?file=` | a file from the log directory |
//! | `GET /kill` | graceful shutdown |

mod handlers;
mod routes;

pub use handlers::DEFAULT_LOG_FILE;
pub use routes::create_router;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::Pdf2JpgError;
use crate::service::ConversionService;

/// Shared state for the web server.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: ConversionService,
    pub log_dir: PathBuf,
    /// Signalled by `/kill`.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(service: ConversionService) -> Self {
        let log_dir = service.config().log_dir.clone();
        Self {
            service,
            log_dir,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Bind `addr` and serve until `/kill` or Ctrl-C.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<(), Pdf2JpgError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Pdf2JpgError::Internal(format!("Failed to bind {addr}: {e}")))?;
    serve_on(listener, state).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<(), Pdf2JpgError> {
    let shutdown = Arc::clone(&state.shutdown);
    let app = create_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("Starting server at http://{}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|e| Pdf2JpgError::Internal(format!("Server error: {e}")))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(kill: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = kill.notified() => info!("Stopping on /kill"),
        _ = ctrl_c => info!("Stopping on Ctrl-C"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn setup_test_app() -> (axum::Router, AppState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let service = ConversionService::new(ServiceConfig::with_base_dir(dir.path())).unwrap();
        let state = AppState::new(service);
        (create_router(state.clone()), state, dir)
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn status_is_ok() {
        let (app, _state, _dir) = setup_test_app();
        let (status, body) = get(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn convert_without_url_is_bad_request() {
        let (app, _state, _dir) = setup_test_app();
        assert_eq!(get(app.clone(), "/convert").await.0, StatusCode::BAD_REQUEST);
        assert_eq!(get(app.clone(), "/convert?url=").await.0, StatusCode::BAD_REQUEST);
        assert_eq!(
            get(app, "/convert?url=not%20a%20url").await.0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn convert_serves_cached_jpeg() {
        let (app, state, _dir) = setup_test_app();
        let url = "http://192.0.2.1:9/a.pdf";
        let fp = crate::fingerprint::Fingerprint::of(url);
        std::fs::write(state.service.cache().artifact_path(&fp), b"\xFF\xD8\xFFjpeg").unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/convert?url={}", urlencoding::encode(url)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/jpeg");
        assert_eq!(response.headers()["content-length"], "7");
    }

    #[tokio::test]
    async fn clear_routes_report_counts() {
        let (app, state, _dir) = setup_test_app();
        let cfg = state.service.config().clone();
        std::fs::write(cfg.cache_dir.join("a.jpg"), b"x").unwrap();
        std::fs::write(cfg.cache_dir.join("b.jpg"), b"x").unwrap();
        std::fs::write(cfg.staging_dir.join("a.pdf"), b"x").unwrap();

        assert_eq!(get(app.clone(), "/clearimg").await.1, b"2");
        assert_eq!(get(app.clone(), "/clearimg").await.1, b"0");
        assert_eq!(get(app.clone(), "/clearblocks").await.1, b"0");
        assert_eq!(get(app, "/clearall").await.1, b"1");
    }

    #[tokio::test]
    async fn log_serves_only_plain_names() {
        let (app, state, _dir) = setup_test_app();
        std::fs::write(state.log_dir.join(DEFAULT_LOG_FILE), b"line one\n").unwrap();

        let (status, body) = get(app.clone(), "/log").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"line one\n");

        assert_eq!(
            get(app.clone(), "/log?file=..%2Fstatus%2Fx").await.0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(get(app.clone(), "/log?file=missing.log").await.0, StatusCode::NOT_FOUND);

        std::fs::create_dir(state.log_dir.join("archive")).unwrap();
        assert_eq!(get(app, "/log?file=archive").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn kill_signals_shutdown() {
        let (app, state, _dir) = setup_test_app();
        assert_eq!(get(app, "/kill").await.0, StatusCode::OK);
        tokio::time::timeout(Duration::from_secs(1), state.shutdown.notified())
            .await
            .expect("shutdown was not signalled");
    }
}
