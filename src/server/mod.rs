use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, Method, Response},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::pipeline::{DownloadRequest, InspectRequest, Pipeline};
use crate::process::Platform;
use crate::transfer::{self, error_response};
use crate::DownlyError;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub pipeline: Arc<Pipeline>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION, header::CONTENT_LENGTH]);

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/inspect", post(inspect))
        .route("/download", post(download))
        .route("/youtube/inspect", post(youtube_inspect))
        .route("/youtube/download", post(youtube_download));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn inspect(
    State(ctx): State<AppContext>,
    body: std::result::Result<Json<InspectRequest>, JsonRejection>,
) -> Response<Body> {
    match body {
        Ok(Json(request)) => run_inspect(&ctx, request).await,
        Err(rejection) => rejected(rejection),
    }
}

async fn youtube_inspect(
    State(ctx): State<AppContext>,
    body: std::result::Result<Json<InspectRequest>, JsonRejection>,
) -> Response<Body> {
    let mut request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return rejected(rejection),
    };

    if let Err(e) = require_youtube(&request.url) {
        return error_response(&e);
    }
    request.platform = Some(Platform::Youtube);
    run_inspect(&ctx, request).await
}

async fn download(
    State(ctx): State<AppContext>,
    body: std::result::Result<Json<DownloadRequest>, JsonRejection>,
) -> Response<Body> {
    match body {
        Ok(Json(request)) => run_download(&ctx, request).await,
        Err(rejection) => rejected(rejection),
    }
}

async fn youtube_download(
    State(ctx): State<AppContext>,
    body: std::result::Result<Json<DownloadRequest>, JsonRejection>,
) -> Response<Body> {
    let mut request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return rejected(rejection),
    };

    if let Err(e) = require_youtube(&request.url) {
        return error_response(&e);
    }
    request.platform = Some(Platform::Youtube);
    run_download(&ctx, request).await
}

async fn run_inspect(ctx: &AppContext, request: InspectRequest) -> Response<Body> {
    match ctx.pipeline.inspect(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            tracing::warn!("Inspect failed for {}: {}", request.url, e);
            error_response(&e)
        }
    }
}

async fn run_download(ctx: &AppContext, request: DownloadRequest) -> Response<Body> {
    let delivered = match ctx.pipeline.download(&request).await {
        Ok(payload) => transfer::deliver(payload.source, payload.metadata).await,
        Err(e) => Err(e),
    };

    match delivered {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Download failed for {}: {}", request.url, e);
            error_response(&e)
        }
    }
}

fn require_youtube(url: &str) -> crate::Result<()> {
    let url = url.trim();
    if url.is_empty() || Platform::detect(url) != Platform::Youtube {
        return Err(DownlyError::Validation("Invalid YouTube url".to_string()));
    }
    Ok(())
}

fn rejected(rejection: JsonRejection) -> Response<Body> {
    error_response(&DownlyError::Validation(rejection.body_text()))
}

/// Start the HTTP server
pub async fn start_server(bind: &str, pipeline: Pipeline) -> Result<()> {
    let addr: SocketAddr = bind.parse().context("Invalid server address")?;

    let app = create_router(AppContext {
        pipeline: Arc::new(pipeline),
    });

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_youtube() {
        assert!(require_youtube("https://www.youtube.com/watch?v=x").is_ok());
        assert!(require_youtube("https://youtu.be/x").is_ok());
        assert!(require_youtube("https://www.tiktok.com/@u/video/1").is_err());
        assert!(require_youtube("  ").is_err());
    }
}
