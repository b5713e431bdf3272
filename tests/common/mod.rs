//! Utilidades compartidas por los tests de integración: PDFs mínimos y
//! servicios de modelos falsos.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use pdf_rag_chat::{
    config::{ChunkingConfig, EmbeddingConfig, RetrievalConfig},
    llm::{Embedder, GenerationRequest, Generator, ServiceCallError},
    rag::RagEngine,
};

pub const DIMS: usize = 256;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "into", "is",
    "it", "its", "of", "on", "or", "that", "the", "their", "they", "this", "to", "was", "what",
    "when", "which", "who", "with",
];

/// PDF mínimo con una página por texto (fuente Helvetica, una frase por línea).
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let page_count = pages.len();
    let mut objects: Vec<String> = Vec::new();

    // 1: catálogo, 2: árbol de páginas, 3: fuente; después (página, contenido) por página.
    let kids: Vec<String> = (0..page_count).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        page_count
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    for (i, text) in pages.iter().enumerate() {
        let content_id = 5 + 2 * i;
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {content_id} 0 R /Resources << /Font << /F1 3 0 R >> >> >>"
        ));
        let mut stream = String::from("BT /F1 10 Tf 40 750 Td\n");
        for sentence in text.split_inclusive(". ").filter(|s| !s.trim().is_empty()) {
            stream.push_str(&format!("({}) Tj 0 -14 Td\n", escape_pdf_text(sentence)));
        }
        stream.push_str("ET");
        objects.push(format!(
            "<< /Length {} >> stream\n{}\nendstream",
            stream.len(),
            stream
        ));
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj {} endobj\n", i + 1, body).as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}

fn escape_pdf_text(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Embeddings deterministas por bolsa de palabras con hashing (FNV-1a).
/// Puede fallar siempre (de forma transitoria) en los lotes que contengan
/// la palabra `fail_on_word`.
pub struct HashingEmbedder {
    calls: AtomicUsize,
    failures: AtomicUsize,
    fail_on_word: Option<String>,
    delay: Duration,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            fail_on_word: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_on_word(word: &str) -> Self {
        Self {
            fail_on_word: Some(word.to_lowercase()),
            ..Self::new()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMS];
        for token in tokens(text) {
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % DIMS as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(word) = &self.fail_on_word {
            if texts.iter().any(|t| tokens(t).contains(word)) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(ServiceCallError::Transient(format!(
                    "fallo inyectado en el lote con '{word}'"
                )));
            }
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Generador que guarda las peticiones recibidas y responde un texto fijo.
pub struct RecordingGenerator {
    reply: String,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl RecordingGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ServiceCallError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.reply.clone())
    }
}

/// Generador que responde bien hasta que se le indica que falle.
pub struct FlakyGenerator {
    failing: Mutex<bool>,
}

impl FlakyGenerator {
    pub fn new() -> Self {
        Self {
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl Generator for FlakyGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, ServiceCallError> {
        if *self.failing.lock().unwrap() {
            return Err(ServiceCallError::Transient("servicio no disponible".to_string()));
        }
        Ok("respuesta".to_string())
    }
}

/// Generador que tarda `delay` en responder.
pub struct SlowGenerator {
    delay: Duration,
}

impl SlowGenerator {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Generator for SlowGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, ServiceCallError> {
        tokio::time::sleep(self.delay).await;
        Ok("respuesta lenta".to_string())
    }
}

pub fn chunking() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 200,
        chunk_overlap: 20,
        min_chunk_chars: 10,
    }
}

pub fn embedding() -> EmbeddingConfig {
    EmbeddingConfig {
        batch_size: 2,
        concurrency: 2,
        max_retries: 1,
        retry_base_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
    }
}

pub fn engine(embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> RagEngine {
    RagEngine::new(
        embedder,
        generator,
        chunking(),
        embedding(),
        RetrievalConfig {
            top_k: 3,
            ..RetrievalConfig::default()
        },
    )
}

pub fn dogs_page() -> String {
    "Dogs are loyal domestic animals. Dogs enjoy long walks in the park. \
     Many dogs are trained to herd sheep and guard houses. Puppies need food, \
     sleep and play every day. "
        .repeat(2)
}

pub fn francium_page() -> String {
    "Francium is an extremely rare radioactive alkali metal. Francium was \
     discovered by Marguerite Perey in 1939. Francium decays quickly into \
     astatine, radium and radon. "
        .repeat(2)
}

pub fn cats_page() -> String {
    "Cats are independent pets that sleep most of the day. Cats hunt mice \
     and birds at night. Kittens learn to groom themselves early. "
        .repeat(2)
}
