//! Taxonomía de errores del sistema RAG y su traducción a respuestas HTTP.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Configuración ausente o inválida. Fatal en el arranque.
    #[error("Error de configuración: {0}")]
    Configuration(String),

    /// El documento no contiene texto extraíble (p.ej. un PDF escaneado).
    #[error("El documento '{document}' no contiene texto extraíble")]
    NoExtractableText { document: String },

    #[error("Documento inválido '{document}': {reason}")]
    InvalidDocument { document: String, reason: String },

    #[error("Fallo del servicio de embeddings: {0}")]
    EmbeddingService(String),

    #[error("Fallo del servicio de generación: {0}")]
    GenerationService(String),

    /// Se ha enviado una pregunta antes de que exista un índice.
    #[error("El índice aún no está listo; sube un documento y espera a que termine el procesamiento")]
    IndexNotReady,

    #[error("La sesión está ocupada: {0}")]
    SessionBusy(String),

    #[error("La pregunta está vacía")]
    EmptyQuestion,

    #[error("Sesión no encontrada: {0}")]
    SessionNotFound(String),
}

impl RagError {
    /// Identificador estable del tipo de error, expuesto en la API.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Configuration(_) => "configuration_error",
            RagError::NoExtractableText { .. } => "no_extractable_text",
            RagError::InvalidDocument { .. } => "invalid_document",
            RagError::EmbeddingService(_) => "embedding_service_error",
            RagError::GenerationService(_) => "generation_service_error",
            RagError::IndexNotReady => "index_not_ready",
            RagError::SessionBusy(_) => "session_busy",
            RagError::EmptyQuestion => "empty_question",
            RagError::SessionNotFound(_) => "session_not_found",
        }
    }

    /// Indica si el usuario puede reintentar la misma acción más tarde.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingService(_)
                | RagError::GenerationService(_)
                | RagError::IndexNotReady
                | RagError::SessionBusy(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RagError::NoExtractableText { .. } | RagError::InvalidDocument { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RagError::EmbeddingService(_) | RagError::GenerationService(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::IndexNotReady | RagError::SessionBusy(_) => StatusCode::CONFLICT,
            RagError::EmptyQuestion => StatusCode::BAD_REQUEST,
            RagError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "retryable": self.is_retryable(),
        }));
        (self.status_code(), body).into_response()
    }
}

pub type RagResult<T> = std::result::Result<T, RagError>;
