//! Modelos de dominio (documentos, chunks, turnos de conversación y citas).

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Un PDF subido, vivo solo durante un ciclo de procesamiento.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Texto extraído de una página (numeración desde 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: usize,
    pub text: String,
}

/// Trozo contiguo del texto del documento. Su identidad es su posición (`index`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub page: usize,
    pub text: String,
    /// Offsets en caracteres sobre el texto concatenado del documento.
    pub start_char: usize,
    pub end_char: usize,
}

/// Referencia a un chunk citado en una respuesta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub chunk_index: usize,
    pub page: usize,
    /// Distancia al vector de la pregunta según la métrica del índice (menor es mejor).
    pub distance: f32,
    pub excerpt: String,
}

/// Pregunta, respuesta y fuentes citadas. Solo se añade, nunca se edita.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub created_at: DateTime<Utc>,
}

/// Resultado de una consulta RAG antes de registrarse como turno.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

impl Answer {
    pub fn into_turn(self, question: &str) -> ConversationTurn {
        ConversationTurn {
            question: question.to_string(),
            answer: self.answer,
            sources: self.sources,
            created_at: Utc::now(),
        }
    }
}
