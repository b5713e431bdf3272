//! Motor RAG conversacional sobre el índice en memoria.
//!
//! Flujo de una pregunta:
//!   1. Embedding de la pregunta con el mismo modelo usado al indexar.
//!   2. Búsqueda de los `top_k` chunks más cercanos.
//!   3. Construcción del prompt: instrucciones + contexto recuperado + los
//!      turnos más recientes que quepan en el presupuesto de tokens.
//!   4. Llamada al modelo generativo (con timeout, sin reintentos).
//!
//! El registro del turno en la conversación lo hace la sesión, y solo si la
//! respuesta se generó correctamente.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::{ChunkingConfig, EmbeddingConfig, RetrievalConfig, Settings},
    error::{RagError, RagResult},
    ingest,
    llm::{Embedder, GenerationRequest, Generator},
    models::{Answer, ConversationTurn, Document, SourceRef},
    vector_store::{self, SearchHit, VectorIndex},
};

const SYSTEM_PROMPT: &str = r#"
Eres un asistente que responde preguntas sobre un documento PDF.
- Usa ÚNICAMENTE la información del contexto suministrado. No inventes datos.
- Si el contexto no basta para responder, dilo explícitamente.
- Si te piden opiniones o información ajena al documento, indica que solo puedes responder sobre su contenido.
- Si te piden un resumen, ofrécelo estructurado y cubriendo los puntos clave del contexto.
- Cita las páginas de los fragmentos en los que te basas, p.ej. (pág. 3).
- Responde siempre en el idioma de la pregunta, de forma clara y concisa.
"#;

const EXCERPT_CHARS: usize = 200;
const CHARS_PER_TOKEN: usize = 4;

/// Documento ya indexado, listo para recibir preguntas.
#[derive(Debug)]
pub struct IndexedDocument {
    pub page_count: usize,
    pub chunk_count: usize,
    pub index: VectorIndex,
}

/// Orquesta ingesta, indexado y respuesta sobre los servicios de modelos.
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
    retrieval: RetrievalConfig,
}

impl RagEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        chunking: ChunkingConfig,
        embedding: EmbeddingConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            generator,
            chunking,
            embedding,
            retrieval,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self::new(
            embedder,
            generator,
            settings.chunking.clone(),
            settings.embedding.clone(),
            settings.retrieval.clone(),
        )
    }

    /// Extrae, trocea e indexa un documento. `on_progress` recibe
    /// (lotes completados, lotes totales) durante la fase de embeddings.
    pub async fn index_document(
        &self,
        doc: Document,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> RagResult<IndexedDocument> {
        let name = doc.name.clone();
        let processed = ingest::process_document_blocking(doc, self.chunking.clone()).await?;
        let chunk_count = processed.chunks.len();

        let index = vector_store::build_index(
            self.embedder.as_ref(),
            processed.chunks,
            &self.embedding,
            self.retrieval.metric,
            on_progress,
        )
        .await?;

        info!(
            "Índice construido para {name}: {chunk_count} chunks de dimensión {}",
            index.dims()
        );
        Ok(IndexedDocument {
            page_count: processed.page_count,
            chunk_count,
            index,
        })
    }

    /// Recupera los chunks más relevantes para la pregunta.
    pub async fn retrieve(&self, index: &VectorIndex, question: &str) -> RagResult<Vec<SearchHit>> {
        let texts = [question.to_string()];
        let vectors = vector_store::embed_with_retry(self.embedder.as_ref(), &texts, &self.embedding)
            .await
            .map_err(|e| RagError::EmbeddingService(format!("embedding de la pregunta: {e}")))?;
        let query = vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingService("No se pudo generar embedding de la pregunta".to_string()))?;
        index.search(&query, self.retrieval.top_k)
    }

    /// Responde una pregunta usando el índice y el historial previo.
    /// No modifica el historial.
    pub async fn answer(
        &self,
        index: &VectorIndex,
        history: &[ConversationTurn],
        question: &str,
    ) -> RagResult<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }

        // 1) + 2) Recuperación
        let hits = self.retrieve(index, question).await?;

        // 3) Prompt con contexto e historial acotado
        let window = history_window(history, self.retrieval.history_token_budget);
        if window.len() < history.len() {
            info!(
                "Historial truncado: {} de {} turnos caben en el presupuesto",
                window.len(),
                history.len()
            );
        }
        let request = GenerationRequest {
            system: SYSTEM_PROMPT.trim().to_string(),
            prompt: build_prompt(question, &hits, window),
            temperature: self.retrieval.temperature,
            max_output_tokens: self.retrieval.max_output_tokens,
        };

        // 4) Generación
        let answer = match tokio::time::timeout(self.retrieval.timeout, self.generator.generate(&request)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!("Fallo del modelo generativo: {e}");
                return Err(RagError::GenerationService(e.to_string()));
            }
            Err(_) => {
                warn!("Timeout del modelo generativo tras {:?}", self.retrieval.timeout);
                return Err(RagError::GenerationService(format!(
                    "timeout tras {:?}",
                    self.retrieval.timeout
                )));
            }
        };

        Ok(Answer {
            answer: answer.trim().to_string(),
            sources: hits.iter().map(source_ref).collect(),
        })
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Sufijo más largo del historial que cabe en `budget` tokens. Se descartan
/// primero los turnos más antiguos y se conserva el orden de llegada.
pub fn history_window(history: &[ConversationTurn], budget: usize) -> &[ConversationTurn] {
    let mut used = 0;
    let mut first = history.len();
    for (i, turn) in history.iter().enumerate().rev() {
        let cost = estimate_tokens(&turn.question) + estimate_tokens(&turn.answer);
        if used + cost > budget {
            break;
        }
        used += cost;
        first = i;
    }
    &history[first..]
}

/// Construye el texto del prompt: contexto numerado, conversación previa y pregunta.
pub fn build_prompt(question: &str, hits: &[SearchHit], history: &[ConversationTurn]) -> String {
    let mut prompt = String::from("Contexto del PDF:\n");
    for (i, hit) in hits.iter().enumerate() {
        if i > 0 {
            prompt.push_str("\n---\n");
        }
        prompt.push_str(&format!(
            "[{}] (pág. {})\n{}\n",
            i + 1,
            hit.chunk.page,
            hit.chunk.text.trim()
        ));
    }

    if !history.is_empty() {
        prompt.push_str("\nConversación previa:\n");
        for turn in history {
            prompt.push_str(&format!("Usuario: {}\nAsistente: {}\n", turn.question, turn.answer));
        }
    }

    prompt.push_str(&format!("\nPregunta: {question}\n\nRespuesta:"));
    prompt
}

fn source_ref(hit: &SearchHit) -> SourceRef {
    let text = hit.chunk.text.trim();
    let excerpt = match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    };
    SourceRef {
        chunk_index: hit.chunk.index,
        page: hit.chunk.page,
        distance: hit.distance,
        excerpt,
    }
}
