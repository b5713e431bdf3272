//! Carga y gestión de configuración de la aplicación (modelos, credenciales y
//! parámetros del pipeline RAG).
//!
//! La configuración se resuelve mediante una cadena fija de proveedores:
//!   1. `environment`: variables de entorno del proceso.
//!   2. `dotenv`: fichero `.env` local.
//!   3. `encoded-secrets`: fichero TOML de secretos (despliegue en la nube).
//!
//! El primer proveedor aplicable produce el `Settings` completo.

use std::{
    collections::HashMap,
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    credentials::Credentials,
    error::{RagError, RagResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> RagResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" | "vertex" | "vertexai" => Ok(Self::Gemini),
            other => Err(RagError::Configuration(format!(
                "Proveedor LLM no soportado: {other}"
            ))),
        }
    }

    fn default_chat_model(self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Gemini => "gemini-2.5-pro",
        }
    }

    fn default_embedding_model(self) -> &'static str {
        match self {
            Self::OpenAI => "text-embedding-3-small",
            Self::Gemini => "text-embedding-004",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Métrica de distancia del índice vectorial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn from_str(s: &str) -> RagResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::L2),
            other => Err(RagError::Configuration(format!(
                "Métrica de distancia no soportada: {other}"
            ))),
        }
    }
}

/// Parámetros del troceado de documentos (en caracteres).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_chars: 20,
        }
    }
}

/// Parámetros de las llamadas de embeddings durante la construcción del índice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            concurrency: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Parámetros de recuperación y generación de respuestas.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub metric: DistanceMetric,
    pub history_token_budget: usize,
    pub temperature: f64,
    pub max_output_tokens: u64,
    pub timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            metric: DistanceMetric::Cosine,
            history_token_budget: 2000,
            temperature: 0.0,
            max_output_tokens: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Configuración completa de la aplicación. Inmutable tras su construcción.
#[derive(Clone, Debug)]
pub struct Settings {
    pub project_id: String,
    pub location: String,
    pub credentials: Credentials,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    pub llm_embedding_model: String,

    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,

    pub server_addr: String,
    pub max_upload_bytes: usize,
    /// Tiempo sin actividad tras el cual una sesión se libera.
    pub session_idle_ttl: Duration,
    pub log_dir: PathBuf,
    pub log_max_files: usize,
    pub open_browser: bool,
}

/// Vista de solo lectura sobre los pares clave/valor de un proveedor.
struct Values<'a>(&'a HashMap<String, String>);

impl<'a> Values<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> RagResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|_| {
                RagError::Configuration(format!("Valor inválido para {key}: '{raw}'"))
            }),
        }
    }

    fn flag_or(&self, key: &str, default: bool) -> RagResult<bool> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(RagError::Configuration(format!(
                "Valor booleano inválido para {key}: '{v}'"
            ))),
        }
    }
}

impl Settings {
    /// Construye la configuración a partir de un mapa de claves. Falla si faltan
    /// el identificador de proyecto o las credenciales, o si algún valor es inválido.
    pub fn from_values(values: &HashMap<String, String>) -> RagResult<Self> {
        let v = Values(values);

        // 1) Credenciales: Base64 > fichero > clave en claro
        let credentials = if let Some(encoded) = v.get("CREDENTIALS_B64") {
            Credentials::from_base64(encoded)?
        } else if let Some(path) = v.get("CREDENTIALS_FILE") {
            Credentials::from_file(Path::new(path))?
        } else if let Some(key) = v.get("API_KEY") {
            Credentials::from_api_key(key)?
        } else {
            return Err(RagError::Configuration(
                "Faltan credenciales: define CREDENTIALS_B64, CREDENTIALS_FILE o API_KEY".to_string(),
            ));
        };

        // 2) Proyecto: explícito o el del documento de credenciales
        let project_id = v
            .get("PROJECT_ID")
            .map(str::to_string)
            .or_else(|| credentials.project_id.clone())
            .ok_or_else(|| RagError::Configuration("Falta PROJECT_ID".to_string()))?;
        let location = v.get("LOCATION").unwrap_or("us-central1").to_string();

        // 3) Modelos
        let llm_provider = LlmProvider::from_str(v.get("LLM_PROVIDER").unwrap_or("gemini"))?;
        let llm_chat_model = v
            .get("MODEL_NAME")
            .unwrap_or(llm_provider.default_chat_model())
            .to_string();
        let llm_embedding_model = v
            .get("EMBEDDING_MODEL")
            .unwrap_or(llm_provider.default_embedding_model())
            .to_string();

        // 4) Pipeline
        let defaults_chunking = ChunkingConfig::default();
        let chunking = ChunkingConfig {
            chunk_size: v.parse_or("CHUNK_SIZE", defaults_chunking.chunk_size)?,
            chunk_overlap: v.parse_or("CHUNK_OVERLAP", defaults_chunking.chunk_overlap)?,
            min_chunk_chars: v.parse_or("MIN_CHUNK_CHARS", defaults_chunking.min_chunk_chars)?,
        };
        if chunking.chunk_size == 0 || chunking.chunk_overlap >= chunking.chunk_size {
            return Err(RagError::Configuration(format!(
                "CHUNK_OVERLAP ({}) debe ser menor que CHUNK_SIZE ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if chunking.min_chunk_chars == 0 || chunking.min_chunk_chars > chunking.chunk_size {
            return Err(RagError::Configuration(
                "MIN_CHUNK_CHARS debe estar entre 1 y CHUNK_SIZE".to_string(),
            ));
        }

        let timeout = Duration::from_secs(v.parse_or("MODEL_TIMEOUT_SECS", 60u64)?);
        if timeout.is_zero() {
            return Err(RagError::Configuration(
                "MODEL_TIMEOUT_SECS debe ser mayor que cero".to_string(),
            ));
        }

        let defaults_embedding = EmbeddingConfig::default();
        let embedding = EmbeddingConfig {
            batch_size: v.parse_or("EMBEDDING_BATCH_SIZE", defaults_embedding.batch_size)?,
            concurrency: v.parse_or("EMBEDDING_CONCURRENCY", defaults_embedding.concurrency)?,
            max_retries: v.parse_or("EMBEDDING_MAX_RETRIES", defaults_embedding.max_retries)?,
            retry_base_delay: Duration::from_millis(v.parse_or("RETRY_BASE_DELAY_MS", 500u64)?),
            timeout,
        };
        if embedding.batch_size == 0 || embedding.concurrency == 0 {
            return Err(RagError::Configuration(
                "EMBEDDING_BATCH_SIZE y EMBEDDING_CONCURRENCY deben ser mayores que cero".to_string(),
            ));
        }

        let defaults_retrieval = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            top_k: v.parse_or("TOP_K", defaults_retrieval.top_k)?,
            metric: DistanceMetric::from_str(v.get("DISTANCE_METRIC").unwrap_or("cosine"))?,
            history_token_budget: v
                .parse_or("HISTORY_TOKEN_BUDGET", defaults_retrieval.history_token_budget)?,
            temperature: v.parse_or("TEMPERATURE", defaults_retrieval.temperature)?,
            max_output_tokens: v.parse_or("MAX_OUTPUT_TOKENS", defaults_retrieval.max_output_tokens)?,
            timeout,
        };
        if retrieval.top_k == 0 {
            return Err(RagError::Configuration("TOP_K debe ser mayor que cero".to_string()));
        }
        if !(0.0..=2.0).contains(&retrieval.temperature) {
            return Err(RagError::Configuration(format!(
                "TEMPERATURE fuera de rango [0, 2]: {}",
                retrieval.temperature
            )));
        }
        if retrieval.max_output_tokens == 0 {
            return Err(RagError::Configuration(
                "MAX_OUTPUT_TOKENS debe ser mayor que cero".to_string(),
            ));
        }

        // 5) Servidor y logging
        let server_addr = v.get("SERVER_ADDR").unwrap_or("127.0.0.1:8501").to_string();
        let max_upload_mb: usize = v.parse_or("MAX_UPLOAD_MB", 50)?;
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .filter(|bytes| *bytes > 0)
            .ok_or_else(|| {
                RagError::Configuration(format!("MAX_UPLOAD_MB fuera de rango: {max_upload_mb}"))
            })?;
        let session_idle_mins: u64 = v.parse_or("SESSION_IDLE_TTL_MINS", 60)?;
        let session_idle_ttl = session_idle_mins
            .checked_mul(60)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                RagError::Configuration(format!(
                    "SESSION_IDLE_TTL_MINS fuera de rango: {session_idle_mins}"
                ))
            })?;
        let log_dir = PathBuf::from(v.get("LOG_DIR").unwrap_or("logs"));
        let log_max_files = v.parse_or("LOG_MAX_FILES", 5usize)?;
        if log_max_files == 0 {
            return Err(RagError::Configuration(
                "LOG_MAX_FILES debe ser mayor que cero".to_string(),
            ));
        }
        let open_browser = v.flag_or("OPEN_BROWSER", true)?;

        Ok(Self {
            project_id,
            location,
            credentials,
            llm_provider,
            llm_chat_model,
            llm_embedding_model,
            chunking,
            embedding,
            retrieval,
            server_addr,
            max_upload_bytes,
            session_idle_ttl,
            log_dir,
            log_max_files,
            open_browser,
        })
    }
}

/// Fuente de configuración de la cadena de resolución.
pub trait SettingsProvider {
    fn name(&self) -> &'static str;

    /// `Ok(None)` significa "no aplicable en este despliegue".
    fn resolve(&self) -> RagResult<Option<Settings>>;
}

/// Variables de entorno explícitas del proceso.
pub struct EnvironmentProvider {
    vars: HashMap<String, String>,
}

impl EnvironmentProvider {
    pub fn from_process() -> Self {
        Self::from_vars(env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }
}

impl SettingsProvider for EnvironmentProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn resolve(&self) -> RagResult<Option<Settings>> {
        if Values(&self.vars).get("PROJECT_ID").is_none() {
            return Ok(None);
        }
        Settings::from_values(&self.vars).map(Some)
    }
}

/// Fichero `.env` local. Se lee sin modificar el entorno del proceso.
pub struct DotenvProvider {
    path: PathBuf,
}

impl DotenvProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsProvider for DotenvProvider {
    fn name(&self) -> &'static str {
        "dotenv"
    }

    fn resolve(&self) -> RagResult<Option<Settings>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let iter = dotenvy::from_path_iter(&self.path).map_err(|e| {
            RagError::Configuration(format!("No se pudo leer {}: {e}", self.path.display()))
        })?;
        let mut values = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                RagError::Configuration(format!("Entrada inválida en {}: {e}", self.path.display()))
            })?;
            values.insert(key, value);
        }
        Settings::from_values(&values).map(Some)
    }
}

/// Fichero TOML de secretos con las mismas claves (credenciales en Base64).
pub struct EncodedSecretsProvider {
    path: PathBuf,
}

impl EncodedSecretsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsProvider for EncodedSecretsProvider {
    fn name(&self) -> &'static str {
        "encoded-secrets"
    }

    fn resolve(&self) -> RagResult<Option<Settings>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            RagError::Configuration(format!("No se pudo leer {}: {e}", self.path.display()))
        })?;
        let table: toml::Table = content.parse().map_err(|e| {
            RagError::Configuration(format!("TOML inválido en {}: {e}", self.path.display()))
        })?;

        let mut values = HashMap::new();
        for (key, value) in table {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    warn!(
                        "Ignorando la clave '{key}' de {}: tipo no escalar ({})",
                        self.path.display(),
                        other.type_str()
                    );
                    continue;
                }
            };
            values.insert(key, text);
        }
        Settings::from_values(&values).map(Some)
    }
}

/// Recorre la cadena de proveedores en orden y devuelve la primera configuración aplicable.
pub fn resolve_settings(providers: &[Box<dyn SettingsProvider>]) -> RagResult<Settings> {
    for provider in providers {
        if let Some(settings) = provider.resolve()? {
            info!("Configuración cargada desde el proveedor '{}'", provider.name());
            return Ok(settings);
        }
    }
    let tried: Vec<&str> = providers.iter().map(|p| p.name()).collect();
    Err(RagError::Configuration(format!(
        "Ninguna fuente de configuración aplicable (probadas: {})",
        tried.join(", ")
    )))
}

/// Cadena por defecto: entorno > `.env` > secretos codificados.
pub fn default_providers() -> Vec<Box<dyn SettingsProvider>> {
    let dotenv_path = env::var("DOTENV_FILE").unwrap_or_else(|_| ".env".to_string());
    let secrets_path = env::var("SECRETS_FILE").unwrap_or_else(|_| "secrets.toml".to_string());
    vec![
        Box::new(EnvironmentProvider::from_process()),
        Box::new(DotenvProvider::new(dotenv_path)),
        Box::new(EncodedSecretsProvider::new(secrets_path)),
    ]
}
