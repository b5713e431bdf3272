//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//!
//! El pipeline depende solo de los traits [`Embedder`] y [`Generator`];
//! [`LlmManager`] los implementa con los clientes de Rig (OpenAI y Gemini).

use async_trait::async_trait;
use rig::completion::Prompt as _;
use rig::embeddings::EmbeddingModel as _;
use thiserror::Error;

use crate::config::{LlmProvider, Settings};
use crate::credentials::Credentials;

/// Fallo de una llamada a un servicio de modelos.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceCallError {
    /// Fallo que puede resolverse reintentando (red, límites de tasa, timeout).
    #[error("fallo transitorio: {0}")]
    Transient(String),
    /// Respuesta inválida o error que no se resolverá reintentando.
    #[error("fallo permanente: {0}")]
    Permanent(String),
}

impl ServiceCallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceCallError::Transient(_))
    }
}

/// Servicio de embeddings. Devuelve un vector por texto, en el mismo orden.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError>;
}

/// Petición al modelo generativo.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_output_tokens: u64,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ServiceCallError>;
}

/// Gestor de LLMs y embeddings sobre Rig.
#[derive(Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
    credentials: Credentials,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            provider: settings.llm_provider,
            embedding_model: settings.llm_embedding_model.clone(),
            chat_model: settings.llm_chat_model.clone(),
            credentials: settings.credentials.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ServiceCallError> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::openai;

        let client = openai::Client::new(self.credentials.api_key());
        let model = client.embedding_model(&self.embedding_model);
        let embeddings = model
            .embed_texts(texts)
            .await
            .map_err(|e| classify_provider_error(e.to_string()))?;
        Ok(embeddings.into_iter().map(|e| to_f32(&e.vec)).collect())
    }

    async fn embed_with_gemini(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ServiceCallError> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::gemini;

        let client = gemini::Client::new(self.credentials.api_key());
        let model = client.embedding_model(&self.embedding_model);
        let embeddings = model
            .embed_texts(texts)
            .await
            .map_err(|e| classify_provider_error(e.to_string()))?;
        Ok(embeddings.into_iter().map(|e| to_f32(&e.vec)).collect())
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    async fn generate_with_openai(&self, request: &GenerationRequest) -> Result<String, ServiceCallError> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        let client = openai::Client::new(self.credentials.api_key());
        let agent = client
            .agent(&self.chat_model)
            .preamble(&request.system)
            .temperature(request.temperature)
            .max_tokens(request.max_output_tokens)
            .build();

        agent
            .prompt(request.prompt.as_str())
            .await
            .map_err(|e| classify_provider_error(e.to_string()))
    }

    async fn generate_with_gemini(&self, request: &GenerationRequest) -> Result<String, ServiceCallError> {
        use rig::client::CompletionClient as _;
        use rig::providers::gemini;

        let client = gemini::Client::new(self.credentials.api_key());
        let agent = client
            .agent(&self.chat_model)
            .preamble(&request.system)
            .temperature(request.temperature)
            .max_tokens(request.max_output_tokens)
            .build();

        agent
            .prompt(request.prompt.as_str())
            .await
            .map_err(|e| classify_provider_error(e.to_string()))
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
        let vectors = match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts.to_vec()).await?,
            LlmProvider::Gemini => self.embed_with_gemini(texts.to_vec()).await?,
        };
        if vectors.len() != texts.len() {
            return Err(ServiceCallError::Permanent(format!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Generator for LlmManager {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ServiceCallError> {
        let answer = match self.provider {
            LlmProvider::OpenAI => self.generate_with_openai(request).await?,
            LlmProvider::Gemini => self.generate_with_gemini(request).await?,
        };
        if answer.trim().is_empty() {
            return Err(ServiceCallError::Permanent(
                "El modelo devolvió una respuesta vacía".to_string(),
            ));
        }
        Ok(answer)
    }
}

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|v| *v as f32).collect()
}

/// Marcadores de errores del proveedor que no se resuelven reintentando
/// (credenciales, permisos, petición o modelo inválidos).
const PERMANENT_MARKERS: &[&str] = &[
    "400",
    "401",
    "403",
    "404",
    "422",
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "permission",
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "api key not valid",
    "invalid_request",
    "invalid_argument",
    "model not found",
    "model_not_found",
];

/// Clasifica un error de Rig. Los límites de tasa y los errores de red o de
/// servidor se consideran transitorios.
fn classify_provider_error(message: String) -> ServiceCallError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("resource_exhausted") {
        return ServiceCallError::Transient(message);
    }
    if PERMANENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ServiceCallError::Permanent(message)
    } else {
        ServiceCallError::Transient(message)
    }
}
