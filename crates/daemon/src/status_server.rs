//! Status HTTP server for the fetch daemon
//!
//! Serves a read-only JSON snapshot of the queue and the result history.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{ServerContext, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(ctx): State<Arc<ServerContext>>) -> Json<StatusSnapshot> {
    Json(ctx.status_snapshot().await)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(ctx)
}

/// Parses `status.bind`; an empty value disables the server.
pub fn parse_bind(bind: &str) -> Result<Option<SocketAddr>, ServerError> {
    let bind = bind.trim();
    if bind.is_empty() {
        return Ok(None);
    }
    bind.parse()
        .map(Some)
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Runs the status server until `cancel` fires.
///
/// Returns immediately when the bind address is empty.
pub async fn run_status_server(
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let Some(addr) = parse_bind(&ctx.config.status.bind)? else {
        tracing::info!("status server disabled");
        return Ok(());
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status server listening");

    let app = create_status_router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::request::DownRequest;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn context(temp_dir: &TempDir) -> Arc<ServerContext> {
        let mut config = Config::default();
        config.paths.work_dir = temp_dir.path().to_path_buf();
        Arc::new(ServerContext::new(config, CancellationToken::new()).unwrap())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        ctx.queue
            .try_enqueue(DownRequest::new("https://youtu.be/abc123", 720, "720p.txt").unwrap())
            .await
            .unwrap();

        let (status, json) = get_json(create_status_router(ctx), "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["queue"]["state"], "has_pending");
        assert_eq!(json["queue"]["pending"][0], "abc123");
        assert_eq!(json["next_rid"], 1);
        assert_eq!(json["results"]["total"], 0);
        assert!(json["last_result"].is_null());
    }

    #[tokio::test]
    async fn test_status_is_read_only() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_status_router(context(&temp_dir));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let (status, _) = get_json(create_status_router(context(&temp_dir)), "/submit").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_parse_bind() {
        assert_eq!(parse_bind("").unwrap(), None);
        assert_eq!(
            parse_bind("127.0.0.1:7879").unwrap(),
            Some(SocketAddr::from(([127, 0, 0, 1], 7879)))
        );
        assert!(matches!(
            parse_bind("localhost"),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_server_returns_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.work_dir = temp_dir.path().to_path_buf();
        config.status.bind = String::new();
        let ctx = Arc::new(ServerContext::new(config, CancellationToken::new()).unwrap());

        run_status_server(ctx, CancellationToken::new()).await.unwrap();
    }
}
