//! HTTP endpoint that receives photo batches from the phone.
//!
//! Every request path is accepted. `POST` bodies carry the framing described in
//! [`crate::protocol`]; uploads are handled one at a time so a single
//! [`TransferSession`] owns the save directory while it runs.

use crate::error::TransferError;
use crate::events::{
    EventBus, TransferCompleteInfo, TransferEvent, TransferProgressInfo, TransferStartInfo,
};
use crate::protocol::{FileHeader, Frame, UploadParser};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tower_http::set_header::SetResponseHeaderLayer;

pub const SERVER_VERSION: &str = "1.0.0";
/// How long a stop waits for an in-flight upload before abandoning it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ========================
// Session
// ========================

/// Per-file state while its body streams in.
pub struct FileTransferState {
    pub file_name: String,
    pub file_size: u64,
    pub received_bytes: u64,
    pub path: PathBuf,
    file: File,
}

enum CurrentFile {
    Idle,
    Writing(FileTransferState),
    /// The file already failed; its remaining body bytes are dropped
    Discarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Server-side state for one batch on one connection.
pub struct TransferSession {
    id: String,
    parser: UploadParser,
    save_dir: PathBuf,
    bus: EventBus,
    current: CurrentFile,
    summary: BatchSummary,
    malformed: Option<String>,
}

impl TransferSession {
    pub fn new(save_dir: PathBuf, bus: EventBus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            parser: UploadParser::new(),
            save_dir,
            bus,
            current: CurrentFile::Idle,
            summary: BatchSummary::default(),
            malformed: None,
        }
    }

    /// All declared files have been processed, or the stream was abandoned as malformed.
    pub fn is_finished(&self) -> bool {
        self.parser.is_finished()
    }

    pub fn summary(&self) -> BatchSummary {
        self.summary
    }

    /// Feed one chunk from the transport and act on every frame it completes.
    pub async fn receive(&mut self, chunk: &[u8]) {
        self.parser.push(chunk);
        while let Some(frame) = self.parser.next_frame() {
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::BatchStart { total } => {
                log::info!("[Transfer {}] Expecting {} file(s)", self.id, total);
                self.summary.total = total;
            }
            Frame::FileHeader(header) => self.begin_file(header).await,
            Frame::InvalidHeader {
                name,
                index,
                total,
                reason,
            } => {
                self.fail_file(index, total, &name, &reason);
                self.current = CurrentFile::Idle;
            }
            Frame::Body(bytes) => self.write_body(&bytes).await,
            Frame::FileEnd => self.end_file().await,
            Frame::BatchEnd => {
                log::info!(
                    "[Transfer {}] Batch done: {} completed, {} failed",
                    self.id,
                    self.summary.completed,
                    self.summary.failed
                );
            }
            Frame::Malformed(reason) => {
                log::warn!("[Transfer {}] Malformed stream: {}", self.id, reason);
                self.bus
                    .emit(TransferEvent::error(format!("Malformed upload: {}", reason)));
                self.malformed = Some(reason);
            }
        }
    }

    async fn begin_file(&mut self, header: FileHeader) {
        log::info!(
            "[Transfer {}] Receiving {}/{}: {} ({} bytes)",
            self.id,
            header.index,
            header.total,
            header.name,
            header.size
        );
        self.bus.emit(TransferEvent::Start(TransferStartInfo {
            file_name: header.name.clone(),
            file_size: header.size,
            index: header.index,
            total: header.total,
        }));

        let name = match sanitize_file_name(&header.name) {
            Ok(name) => name,
            Err(reason) => {
                self.fail_file(header.index, header.total, &header.name, &reason);
                self.current = CurrentFile::Discarding;
                return;
            }
        };

        let path = self.save_dir.join(name);
        match File::create(&path).await {
            Ok(file) => {
                self.current = CurrentFile::Writing(FileTransferState {
                    file_name: header.name,
                    file_size: header.size,
                    received_bytes: 0,
                    path,
                    file,
                });
            }
            Err(e) => {
                let reason = format!("cannot create {:?}: {}", path, e);
                self.fail_file(header.index, header.total, &header.name, &reason);
                self.current = CurrentFile::Discarding;
            }
        }
    }

    async fn write_body(&mut self, bytes: &[u8]) {
        let CurrentFile::Writing(state) = &mut self.current else {
            return;
        };

        let written = state.file.write_all(bytes).await;
        if let Err(e) = written {
            let name = state.file_name.clone();
            let reason = format!("write failed: {}", e);
            let index = self.parser.current_index();
            let total = self.parser.total();
            self.fail_file(index, total, &name, &reason);
            self.current = CurrentFile::Discarding;
            return;
        }

        state.received_bytes += bytes.len() as u64;
        self.bus.emit(TransferEvent::Progress(progress_of(state)));
    }

    async fn end_file(&mut self) {
        match std::mem::replace(&mut self.current, CurrentFile::Idle) {
            CurrentFile::Writing(mut state) => {
                if state.file_size == 0 {
                    self.bus.emit(TransferEvent::Progress(progress_of(&state)));
                }
                if let Err(e) = state.file.flush().await {
                    let index = self.parser.current_index();
                    let total = self.parser.total();
                    self.fail_file(index, total, &state.file_name, &format!("flush failed: {}", e));
                    return;
                }
                log::info!("[Transfer {}] Saved {:?}", self.id, state.path);
                self.summary.completed += 1;
                self.bus.emit(TransferEvent::Complete(TransferCompleteInfo {
                    file_name: state.file_name,
                    file_path: state.path,
                    size: state.file_size,
                }));
            }
            CurrentFile::Discarding | CurrentFile::Idle => {}
        }
    }

    fn fail_file(&mut self, index: usize, total: usize, name: &str, reason: &str) {
        log::warn!(
            "[Transfer {}] File {}/{} ({}) failed: {}",
            self.id,
            index,
            total,
            name,
            reason
        );
        self.summary.failed += 1;
        self.bus.emit(TransferEvent::error(format!(
            "Error while processing image {} ({}): {}",
            index, name, reason
        )));
    }

    /// Close the session once the transport has no more data.
    ///
    /// A batch that stopped short leaves any partial file on disk without a
    /// Complete event and reports the shortfall as an error.
    pub async fn finish(mut self) -> Result<BatchSummary, String> {
        if let Some(reason) = self.malformed.take() {
            return Err(format!("Malformed upload: {}", reason));
        }
        if self.parser.is_finished() {
            return Ok(self.summary);
        }

        let message = match std::mem::replace(&mut self.current, CurrentFile::Idle) {
            CurrentFile::Writing(mut state) => {
                if let Err(e) = state.file.flush().await {
                    log::warn!(
                        "[Transfer {}] Flush of partial {:?} failed: {}",
                        self.id,
                        state.path,
                        e
                    );
                }
                format!(
                    "Connection closed while receiving {} ({}/{} bytes)",
                    state.file_name, state.received_bytes, state.file_size
                )
            }
            _ => format!(
                "Connection closed after {} of {} file(s)",
                self.summary.completed + self.summary.failed,
                self.summary.total
            ),
        };
        log::warn!("[Transfer {}] {}", self.id, message);
        self.bus.emit(TransferEvent::error(message.clone()));
        Err(message)
    }

    /// Abandon the session after a transport error.
    pub async fn abort(self, reason: String) -> String {
        let message = format!("Server error: {}", reason);
        if let CurrentFile::Writing(mut state) = self.current {
            if let Err(e) = state.file.flush().await {
                log::warn!(
                    "[Transfer {}] Flush of partial {:?} failed: {}",
                    self.id,
                    state.path,
                    e
                );
            }
        }
        log::warn!("[Transfer {}] {}", self.id, message);
        self.bus.emit(TransferEvent::error(message.clone()));
        message
    }
}

fn progress_of(state: &FileTransferState) -> TransferProgressInfo {
    let progress = if state.file_size == 0 {
        1.0
    } else {
        state.received_bytes as f64 / state.file_size as f64
    };
    TransferProgressInfo {
        file_name: state.file_name.clone(),
        progress,
        received_bytes: state.received_bytes,
        total_bytes: state.file_size,
    }
}

/// Accept only a bare file name so uploads cannot escape the save directory.
pub fn sanitize_file_name(name: &str) -> Result<&str, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(format!("invalid file name {:?}", name));
    }
    if trimmed
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
    {
        return Err(format!("file name {:?} contains a path separator", name));
    }
    if Path::new(trimmed).components().count() != 1 {
        return Err(format!("invalid file name {:?}", name));
    }
    Ok(trimmed)
}

// ========================
// HTTP
// ========================

#[derive(Clone)]
struct ServerState {
    save_dir: Arc<PathBuf>,
    bus: EventBus,
    /// Held for the duration of an upload; one batch at a time
    upload_lock: Arc<Mutex<()>>,
}

fn router(state: ServerState) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        ))
}

async fn handle_request(
    State(state): State<ServerState>,
    method: Method,
    body: Body,
) -> Response {
    match method {
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        Method::GET => Json(status_info()).into_response(),
        Method::POST => handle_upload(&state, body).await,
        _ => (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({ "status": "error", "message": "method not supported" })),
        )
            .into_response(),
    }
}

fn status_info() -> serde_json::Value {
    json!({
        "status": "active",
        "version": SERVER_VERSION,
        "serverTime": chrono::Utc::now().to_rfc3339(),
        "endpoints": {
            "post": "/upload",
            "get": "/status"
        }
    })
}

async fn handle_upload(state: &ServerState, body: Body) -> Response {
    let _guard = state.upload_lock.lock().await;
    log::info!("[Server] Upload request received");

    let mut session = TransferSession::new(state.save_dir.as_ref().clone(), state.bus.clone());
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                session.receive(&bytes).await;
                if session.is_finished() {
                    break;
                }
            }
            Err(e) => {
                let message = session.abort(e.to_string()).await;
                return server_error(message);
            }
        }
    }

    match session.finish().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": format!(
                    "Transfer completed: {} of {} file(s) received",
                    summary.completed, summary.total
                ),
            })),
        )
            .into_response(),
        Err(message) => server_error(message),
    }
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

// ========================
// Listener
// ========================

/// A bound, running transfer endpoint.
pub struct ImageServer {
    local_addr: SocketAddr,
    save_dir: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ImageServer {
    /// Create `save_dir` if needed, bind `addr` and start serving in the background.
    pub async fn start(
        addr: SocketAddr,
        save_dir: PathBuf,
        bus: EventBus,
    ) -> Result<Self, TransferError> {
        if !save_dir.exists() {
            tokio::fs::create_dir_all(&save_dir)
                .await
                .map_err(|e| TransferError::SaveDirectory(format!("{:?}: {}", save_dir, e)))?;
        }

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                log::warn!("[Server] Bind on {} failed: {}", addr, source);
                bus.emit(TransferEvent::error(format!("Server error: {}", source)));
                return Err(TransferError::Bind {
                    port: addr.port(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr().map_err(|source| TransferError::Bind {
            port: addr.port(),
            source,
        })?;

        let state = ServerState {
            save_dir: Arc::new(save_dir.clone()),
            bus: bus.clone(),
            upload_lock: Arc::new(Mutex::new(())),
        };
        let app = router(state);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                log::warn!("[Server] Server error: {}", e);
                bus.emit(TransferEvent::error(format!("Server error: {}", e)));
            }
        });

        log::info!(
            "[Server] Listening on {}, saving to {:?}",
            local_addr,
            save_dir
        );

        Ok(Self {
            local_addr,
            save_dir,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Stop accepting connections and wait for in-flight uploads, up to a grace period.
    pub async fn shutdown(self) {
        self.shutdown_with_grace(SHUTDOWN_GRACE).await
    }

    pub async fn shutdown_with_grace(mut self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            log::warn!("[Server] In-flight upload did not finish, abandoning it");
            self.task.abort();
            let _ = self.task.await;
        }
        log::info!("[Server] Stopped listening on {}", self.local_addr);
    }
}
