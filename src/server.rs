//! HTTP surface: the Telegram webhook and a liveness probe.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::logging::request_span;
use crate::pipeline::{MessagePipeline, Outcome, RequestContext};
use crate::telegram::{Message, Update};

pub const HEALTH_RESPONSE: &str = "Hello from reddit-save-bot!";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<MessagePipeline>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Arc<MessagePipeline>, shutdown: CancellationToken) -> Self {
        Self { pipeline, shutdown }
    }
}

#[derive(Debug)]
struct WebhookError {
    status: StatusCode,
    message: String,
}

impl WebhookError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type WebhookResult<T> = Result<T, WebhookError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/", post(webhook))
        .with_state(state)
}

async fn hello() -> &'static str {
    HEALTH_RESPONSE
}

async fn webhook(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult<StatusCode> {
    let span = request_span(&method, uri.path(), &headers);

    let update: Update = serde_json::from_slice(&body).map_err(|err| {
        span.in_scope(|| error!(cause = %err, "Failed to decode update"));
        WebhookError::bad_request(err.to_string())
    })?;

    let Some(message) = update.message.as_ref().and_then(Message::inbound) else {
        span.in_scope(|| info!(update_id = update.update_id, "No text message in update, ignoring"));
        return Ok(StatusCode::OK);
    };
    span.in_scope(|| {
        info!(
            update_id = update.update_id,
            sender = ?message.sender_id,
            "Received message"
        )
    });

    // The token is cancelled on shutdown and whenever this future is dropped
    // before finishing, since the guard goes with it.
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let ctx = RequestContext::new(span, cancel);

    match state.pipeline.handle(&message, &ctx).await {
        Ok(Outcome::Cancelled) => Err(WebhookError::unavailable("request cancelled")),
        Ok(_) => Ok(StatusCode::OK),
        Err(err) => Err(WebhookError::internal(err.to_string())),
    }
}

/// Binds `host:port` and serves until Ctrl+C or SIGTERM, cancelling in-flight
/// requests on the way down.
pub async fn serve(host: &str, port: u16, pipeline: Arc<MessagePipeline>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let app = router(AppState::new(pipeline, shutdown.clone()));

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding to {}:{}", host, port))?;
    let addr = listener.local_addr().context("reading bound address")?;
    info!(%addr, "Webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("running webhook server")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, cancelling in-flight requests");
    shutdown.cancel();
}
