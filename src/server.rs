// src/server.rs
//
// Gateway HTTP surface: document upload, status queries and the live status
// socket. Uploads are accepted fast (blob write + one row + one queue
// publish); everything else happens in the workers.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Multipart, Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use lapin::Channel;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::BlobStore;
use crate::data_model::{Document, DocumentStatus, ExtractionTask, StatusUpdate};
use crate::documents::DocumentStateManager;
use crate::messaging::queues::{publish_json, MessageHandler};
use crate::processing::ChannelBroadcaster;
use crate::utils::metrics_server::metrics_handler;
use crate::utils::prometheus_metrics::{
    CONNECTED_STATUS_SUBSCRIBERS, DOCUMENTS_UPLOADED_TOTAL, STATUS_UPDATES_RELAYED_TOTAL,
    TASK_DESERIALIZATION_ERRORS_TOTAL, UPLOAD_ERRORS_TOTAL,
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub state_manager: Arc<DocumentStateManager>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    pub blob_store: Arc<dyn BlobStore>,
    pub publish_channel: Channel,
    pub extraction_queue: String,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "error": message.into() }))
}

fn blob_extension(file_name: Option<&str>) -> Option<&str> {
    file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

/// POST /documents. Multipart form: a `user_id` field, an optional
/// `business_date` field (YYYY-MM-DD) and one or more `file` parts. Each
/// file becomes its own document; the response carries one id per file.
async fn upload_handler(
    State(app_state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut user_id: Option<Uuid> = None;
    let mut business_date: Option<NaiveDate> = None;
    let mut files: Vec<(Option<String>, Vec<u8>)> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                UPLOAD_ERRORS_TOTAL.inc();
                return (
                    StatusCode::BAD_REQUEST,
                    error_body(format!("malformed multipart body: {}", e)),
                )
                    .into_response();
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => {
                let value = match field.text().await {
                    Ok(v) => v,
                    Err(e) => {
                        UPLOAD_ERRORS_TOTAL.inc();
                        return (
                            StatusCode::BAD_REQUEST,
                            error_body(format!("unreadable user_id field: {}", e)),
                        )
                            .into_response();
                    }
                };
                match value.parse::<Uuid>() {
                    Ok(id) => user_id = Some(id),
                    Err(_) => {
                        UPLOAD_ERRORS_TOTAL.inc();
                        return (
                            StatusCode::BAD_REQUEST,
                            error_body("user_id is not a valid UUID"),
                        )
                            .into_response();
                    }
                }
            }
            "business_date" => {
                let value = match field.text().await {
                    Ok(v) => v,
                    Err(e) => {
                        UPLOAD_ERRORS_TOTAL.inc();
                        return (
                            StatusCode::BAD_REQUEST,
                            error_body(format!("unreadable business_date field: {}", e)),
                        )
                            .into_response();
                    }
                };
                match value.parse::<NaiveDate>() {
                    Ok(date) => business_date = Some(date),
                    Err(_) => {
                        UPLOAD_ERRORS_TOTAL.inc();
                        return (
                            StatusCode::BAD_REQUEST,
                            error_body("business_date must be YYYY-MM-DD"),
                        )
                            .into_response();
                    }
                }
            }
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => files.push((file_name, bytes.to_vec())),
                    Err(e) => {
                        UPLOAD_ERRORS_TOTAL.inc();
                        return (
                            StatusCode::BAD_REQUEST,
                            error_body(format!("unreadable file part: {}", e)),
                        )
                            .into_response();
                    }
                }
            }
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let Some(user_id) = user_id else {
        UPLOAD_ERRORS_TOTAL.inc();
        return (StatusCode::BAD_REQUEST, error_body("missing user_id field")).into_response();
    };
    if files.is_empty() {
        UPLOAD_ERRORS_TOTAL.inc();
        return (StatusCode::BAD_REQUEST, error_body("no files in upload")).into_response();
    }

    let mut document_ids = Vec::with_capacity(files.len());
    for (file_name, bytes) in files {
        match accept_document(&app_state, user_id, business_date, file_name.as_deref(), bytes).await
        {
            Ok(document_id) => document_ids.push(document_id),
            Err(response) => return response,
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "document_ids": document_ids })),
    )
        .into_response()
}

/// One file -> blob write, PENDING row, extraction task, PROCESSING row.
/// Order matters: the row exists before the task is queued, so a worker can
/// never report feedback for an unknown document.
async fn accept_document(
    app_state: &AppState,
    user_id: Uuid,
    business_date: Option<NaiveDate>,
    file_name: Option<&str>,
    bytes: Vec<u8>,
) -> Result<Uuid, axum::response::Response> {
    let blob_key = app_state
        .blob_store
        .put(&bytes, blob_extension(file_name))
        .await
        .map_err(|e| {
            UPLOAD_ERRORS_TOTAL.inc();
            error!(error = %e, "Failed to store uploaded blob");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to store uploaded file"),
            )
                .into_response()
        })?;

    let document = app_state
        .state_manager
        .create(Document::new(user_id, blob_key.clone()))
        .await
        .map_err(|e| {
            UPLOAD_ERRORS_TOTAL.inc();
            error!(error = %e, "Failed to persist document record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to record document"),
            )
                .into_response()
        })?;

    let task = ExtractionTask {
        document_id: document.id,
        user_id,
        blob_key,
        business_date,
    };
    if let Err(e) = publish_json(&app_state.publish_channel, &app_state.extraction_queue, &task).await
    {
        UPLOAD_ERRORS_TOTAL.inc();
        error!(document_id = %document.id, error = %e, "Failed to enqueue extraction task");
        // The row stays PENDING; fail it so the client is not left polling.
        let _ = app_state
            .state_manager
            .update_status(
                document.id,
                DocumentStatus::Failed,
                Some("failed to enqueue document for processing".to_string()),
            )
            .await;
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("failed to enqueue document for processing"),
        )
            .into_response());
    }

    if let Err(e) = app_state
        .state_manager
        .update_status(document.id, DocumentStatus::Processing, None)
        .await
    {
        // The task is already on the wire; the worker's feedback will move
        // the status forward anyway.
        warn!(document_id = %document.id, error = %e, "Failed to mark document as processing");
    }

    DOCUMENTS_UPLOADED_TOTAL.inc();
    info!(document_id = %document.id, user_id = %user_id, "Document accepted");
    Ok(document.id)
}

async fn document_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> impl IntoResponse {
    match app_state.state_manager.find(document_id).await {
        Ok(Some(document)) => (StatusCode::OK, Json(document.to_status_update())).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("document not found")).into_response(),
        Err(e) => {
            error!(document_id = %document_id, error = %e, "Status lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("status lookup failed"),
            )
                .into_response()
        }
    }
}

async fn user_documents_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    match app_state.state_manager.find_by_user(user_id).await {
        Ok(documents) => {
            let updates: Vec<StatusUpdate> =
                documents.iter().map(Document::to_status_update).collect();
            (StatusCode::OK, Json(updates)).into_response()
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Document listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("document listing failed"),
            )
                .into_response()
        }
    }
}

async fn ws_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_status_socket(socket, app_state, user_id))
}

/// Streams status snapshots to one connected client until the socket closes.
/// A lagged receiver just skips ahead; the client resyncs via the status
/// query if it cares about the gap.
async fn serve_status_socket(mut socket: WebSocket, app_state: Arc<AppState>, user_id: Uuid) {
    let mut rx = app_state.broadcaster.subscribe(user_id).await;
    CONNECTED_STATUS_SUBSCRIBERS.inc();
    debug!(user_id = %user_id, "Status socket connected");

    loop {
        tokio::select! {
            update = rx.recv() => {
                match update {
                    Ok(update) => {
                        let Ok(text) = serde_json::to_string(&update) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user_id = %user_id, skipped, "Status socket lagged; updates skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Pings are answered by axum; other inbound frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    CONNECTED_STATUS_SUBSCRIBERS.dec();
    drop(rx);
    app_state.broadcaster.prune(user_id).await;
    debug!(user_id = %user_id, "Status socket disconnected");
}

pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .route("/documents", post(upload_handler))
        .route("/documents/:document_id", get(document_status_handler))
        .route("/users/:user_id/documents", get(user_documents_handler))
        .route("/ws/:user_id", get(ws_handler))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

pub async fn run_server(app_state: Arc<AppState>, listen_addr: &str) -> crate::error::Result<()> {
    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Gateway listening on {}", listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Consumes the status queue and fans snapshots into the in-process
/// broadcaster, bridging worker-side updates to this gateway's sockets.
pub struct StatusRelay {
    pub broadcaster: Arc<ChannelBroadcaster>,
}

#[async_trait]
impl MessageHandler for StatusRelay {
    fn name(&self) -> &'static str {
        "status_relay"
    }

    async fn handle(&self, payload: &[u8]) {
        let update: StatusUpdate = match serde_json::from_slice(payload) {
            Ok(u) => u,
            Err(e) => {
                TASK_DESERIALIZATION_ERRORS_TOTAL.inc();
                error!(error = %e, "Failed to deserialize status snapshot");
                return;
            }
        };

        use crate::processing::StatusBroadcaster;
        self.broadcaster.publish(&update).await;
        STATUS_UPDATES_RELAYED_TOTAL.inc();
    }
}
