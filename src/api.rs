use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::spawn;
use tracing::info;

use crate::{
    app_state::{AppState, SessionSnapshot},
    error::{RagError, RagResult},
    models::{Answer, Document},
};

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    session_id: String,
    document_name: String,
    message: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    status: &'static str,
    provider: String,
    chat_model: String,
    embedding_model: String,
    project_id: String,
    location: String,
    sessions: usize,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let body_limit = app_state.settings.max_upload_bytes;
    Router::new()
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", get(session_handler).delete(delete_session_handler))
        .route("/api/sessions/:id/document", post(upload_handler))
        .route("/api/sessions/:id/ask", post(ask_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.sessions.create();
    (StatusCode::CREATED, Json(session.snapshot()))
}

#[axum::debug_handler]
async fn session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, RagError> {
    let session = state.sessions.get(&id)?;
    Ok(Json(session.snapshot()))
}

#[axum::debug_handler]
async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, RagError> {
    state.sessions.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, RagError> {
    let session = state.sessions.get(&id)?;
    let doc = read_pdf_field(multipart).await?;
    let document_name = doc.name.clone();

    // 1) Transición a Processing (rechaza si ya hay un documento en proceso)
    let epoch = session.start_upload(&document_name)?;

    // 2) Extracción, troceado e indexado en segundo plano
    let engine = state.engine.clone();
    let background = session.clone();
    spawn(async move {
        // El resultado queda reflejado en el estado de la sesión.
        let _ = background.run_upload(&engine, epoch, doc).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            session_id: session.id().to_string(),
            message: format!("Procesando {document_name}..."),
            document_name,
        }),
    ))
}

#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<AskPayload>,
) -> Result<Json<Answer>, RagError> {
    let session = state.sessions.get(&id)?;
    let answer = session.ask(&state.engine, &payload.question).await?;
    Ok(Json(answer))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let settings = &state.settings;
    Json(StatusResponse {
        status: "ok",
        provider: settings.llm_provider.to_string(),
        chat_model: settings.llm_chat_model.clone(),
        embedding_model: settings.llm_embedding_model.clone(),
        project_id: settings.project_id.clone(),
        location: settings.location.clone(),
        sessions: state.sessions.len(),
    })
}

// --- Handler de Apagado y Utilidades ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

/// Lee el campo `file` del formulario y comprueba que es un PDF.
async fn read_pdf_field(mut multipart: Multipart) -> RagResult<Document> {
    let invalid = |document: &str, reason: String| RagError::InvalidDocument {
        document: document.to_string(),
        reason,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid("", e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("documento.pdf").to_string();
        let declared_pdf = field.content_type() == Some(mime_guess::mime::APPLICATION_PDF.as_ref());
        let guessed = mime_guess::from_path(&name).first_or_octet_stream();
        if !declared_pdf && guessed != mime_guess::mime::APPLICATION_PDF {
            return Err(invalid(&name, format!("tipo de fichero no soportado ({guessed})")));
        }

        let bytes = field.bytes().await.map_err(|e| invalid(&name, e.body_text()))?;
        return Ok(Document::new(name, bytes.to_vec()));
    }

    Err(invalid("", "falta el campo 'file' con el PDF".to_string()))
}
