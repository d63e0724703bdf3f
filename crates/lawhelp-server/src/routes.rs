use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::Utc;
use lawhelp_core::{
    completion::CompletionBackend,
    db::Db,
    drafting,
    extract::{self, FileKind},
    signing::{self, SignRequest},
    storage::ObjectStore,
    types::{
        truncate_chars, DraftRequest, NewDocument, SettingsPatch, DEFAULT_USER_ID, MAX_LABEL_CHARS,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::AppState;

const TRACING_TARGET: &str = "lawhelp_server::documents";

// ── Error type ────────────────────────────────────────────────────────────

/// Handler error rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn unavailable(what: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{what} is not configured"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e:#}");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

type ApiResult<T> = Result<T, ApiError>;

fn check_length(field: &str, value: &str) -> ApiResult<()> {
    if value.chars().count() > MAX_LABEL_CHARS {
        return Err(ApiError::bad_request(format!(
            "{field} must be at most {MAX_LABEL_CHARS} characters"
        )));
    }
    Ok(())
}

impl AppState {
    fn db(&self) -> ApiResult<&Db> {
        self.db.as_deref().ok_or_else(|| ApiError::unavailable("Database"))
    }

    fn store(&self) -> ApiResult<&dyn ObjectStore> {
        self.store
            .as_deref()
            .ok_or_else(|| ApiError::unavailable("Object storage"))
    }

    fn completion(&self) -> ApiResult<&dyn CompletionBackend> {
        match &self.completion {
            Ok(backend) => Ok(backend.as_ref()),
            Err(reason) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, reason.clone())),
        }
    }
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct SettingsQuery {
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct SaveBody {
    pub title: String,
    pub content: String,
    pub user_id: Option<String>,
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn root() -> Json<Value> {
    Json(json!({ "message": "Backend running OK 🚀" }))
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let backend = match &state.completion {
        Ok(b) => json!({ "name": b.name(), "ready": true }),
        Err(reason) => json!({ "name": state.config.backend, "ready": false, "error": reason }),
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
        "assistant_name": state.config.assistant_name,
        "model": state.config.model,
        "backend": backend,
        "active_sessions": state.sessions.len().await,
        "law_facts": state.law_facts,
        "database": state.db.is_some(),
        "storage": state.store.as_ref().map(|s| s.name()),
    }))
}

// ── Settings ──────────────────────────────────────────────────────────────

pub(crate) async fn get_settings(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SettingsQuery>,
) -> ApiResult<Json<Value>> {
    let user_id = q
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_USER_ID);
    check_length("user_id", user_id)?;
    let settings = state
        .db()?
        .get_or_create_settings(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!(settings.redacted())))
}

pub(crate) async fn post_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Value>> {
    if let Some(field) = patch.oversized_field() {
        return Err(ApiError::bad_request(format!("{field} is too long")));
    }
    let settings = state.db()?.update_settings(patch).await.map_err(internal)?;
    info!(user_id = %settings.user_id, "settings updated");
    Ok(Json(json!({
        "status": "success",
        "updated": true,
        "data": settings.redacted(),
    })))
}

// ── Documents ─────────────────────────────────────────────────────────────

pub(crate) async fn save_document(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SaveBody>,
) -> ApiResult<Json<Value>> {
    let title = body.title.trim();
    if title.is_empty() || body.content.trim().is_empty() {
        return Err(ApiError::bad_request("Title and content are required."));
    }
    check_length("title", title)?;
    if let Some(user_id) = &body.user_id {
        check_length("user_id", user_id.trim())?;
    }
    let doc = NewDocument {
        title: title.to_string(),
        content: body.content,
        user_id: body.user_id.filter(|u| !u.trim().is_empty()),
    };
    let doc_id = state.db()?.insert_document(&doc).await.map_err(internal)?;
    info!(target: TRACING_TARGET, doc_id, "document saved");
    Ok(Json(json!({ "doc_id": doc_id })))
}

pub(crate) async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    match state.db()?.get_document(id).await.map_err(internal)? {
        Some(doc) => Ok(Json(json!(doc))),
        None => Err(ApiError::not_found("Document not found.")),
    }
}

// ── Generation ────────────────────────────────────────────────────────────

pub(crate) async fn generate_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DraftRequest>,
) -> ApiResult<Json<Value>> {
    let backend = state.completion()?;
    let content = backend
        .complete(drafting::draft_request(&req))
        .await
        .map_err(|e| {
            warn!(target: TRACING_TARGET, kind = %req.kind, "draft generation failed: {e:#}");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error generating text: {e}"),
            )
        })?;
    info!(target: TRACING_TARGET, kind = %req.kind, len = content.len(), "draft generated");
    Ok(Json(json!({ "status": "success", "content": content })))
}

// ── Upload & analysis ─────────────────────────────────────────────────────

struct UploadedFile {
    filename: String,
    bytes: Vec<u8>,
}

pub(crate) async fn upload_document(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut file: Option<UploadedFile> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        file = Some(UploadedFile {
            filename,
            bytes: bytes.to_vec(),
        });
    }
    let file = file.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;

    if file.bytes.is_empty() {
        return Err(ApiError::bad_request("Empty file"));
    }
    let kind =
        FileKind::from_filename(&file.filename).ok_or_else(|| ApiError::bad_request("Unsupported file"))?;

    let text = extract::extract(&file.bytes, kind).map_err(|e| {
        warn!(target: TRACING_TARGET, filename = %file.filename, "extraction failed: {e:#}");
        ApiError::bad_request(format!("Could not read file: {e}"))
    })?;
    if text.trim().chars().count() < state.config.min_document_chars {
        return Err(ApiError::bad_request("Document too short"));
    }

    let db = state.db()?;
    let backend = state.completion()?;
    let request = drafting::analysis_request(&text, state.config.analysis_char_limit);
    let analysis = backend.complete(request).await.map_err(|e| {
        warn!(target: TRACING_TARGET, filename = %file.filename, "analysis failed: {e:#}");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error analyzing document: {e}"),
        )
    })?;
    let analysis = analysis.trim().to_string();

    let doc_id = db
        .insert_document(&NewDocument {
            title: truncate_chars(&file.filename, MAX_LABEL_CHARS).to_string(),
            content: analysis.clone(),
            user_id: None,
        })
        .await
        .map_err(internal)?;
    info!(
        target: TRACING_TARGET,
        doc_id,
        filename = %file.filename,
        chars = text.len(),
        "document analyzed"
    );
    Ok(Json(json!({ "doc_id": doc_id, "ai_summary": analysis })))
}

// ── Signature ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct SignForm {
    doc_id: Option<String>,
    signer_name: Option<String>,
    signature: Option<UploadedFile>,
    content_type: Option<String>,
}

async fn read_sign_form(mut multipart: Multipart) -> ApiResult<SignForm> {
    let mut form = SignForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "doc_id" | "signer_name" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                if name == "doc_id" {
                    form.doc_id = Some(value);
                } else {
                    form.signer_name = Some(value);
                }
            }
            "signature" => {
                let filename = field.file_name().unwrap_or("signature.png").to_string();
                form.content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                form.signature = Some(UploadedFile {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }
    Ok(form)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) async fn sign_document(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let form = read_sign_form(multipart).await?;
    let doc_id: i64 = form
        .doc_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("doc_id is required"))?
        .parse()
        .map_err(|_| ApiError::bad_request("doc_id must be an integer"))?;
    let signer_name = form
        .signer_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("signer_name is required"))?
        .to_string();
    check_length("signer_name", &signer_name)?;
    let signature = form
        .signature
        .filter(|f| !f.bytes.is_empty())
        .ok_or_else(|| ApiError::bad_request("signature image is required"))?;

    let db = state.db()?;
    let store = state.store()?;
    let doc = db
        .get_document(doc_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("Document not found."))?;

    let signature_hash = sha256_hex(&signature.bytes);
    let content_type = form
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let record = signing::sign_document(
        store,
        db,
        SignRequest {
            document: &doc,
            signer_name: &signer_name,
            image: &signature.bytes,
            filename: &signature.filename,
            content_type: &content_type,
            signature_hash: &signature_hash,
            signed_at: Utc::now(),
        },
    )
    .await
    .map_err(internal)?;

    info!(target: TRACING_TARGET, doc_id, signer = %signer_name, "document signed");
    Ok(Json(json!({
        "status": "success",
        "signature_url": record.signature_url,
        "signed_pdf_url": record.signed_pdf_url,
    })))
}

// ── Logs ──────────────────────────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

pub(crate) async fn recent_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let entries: Vec<Value> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    Json(json!({ "entries": entries }))
}
