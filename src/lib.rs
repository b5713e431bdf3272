//! Chat sobre documentos PDF con recuperación aumentada (RAG).
//!
//! Un usuario sube un PDF, el texto se trocea e indexa en memoria mediante
//! embeddings y las preguntas se responden con un LLM a partir de los
//! fragmentos más relevantes y del historial reciente de la conversación.

pub mod api;
pub mod app_state;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod models;
pub mod rag;
pub mod vector_store;

pub use error::{RagError, RagResult};
