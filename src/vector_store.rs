//! Índice vectorial en memoria sobre los chunks de un único documento.
//!
//! API pública:
//!   - `build_index(...)`: embeddings por lotes concurrentes con reintentos.
//!   - `VectorIndex::search(...)`: búsqueda exacta de los `top_k` vecinos.
//!
//! El índice se construye completo o no se construye: nunca se expone un
//! índice parcial.

use std::{
    cmp::Ordering,
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
};

use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::{
    config::{DistanceMetric, EmbeddingConfig},
    error::{RagError, RagResult},
    llm::{Embedder, ServiceCallError},
    models::Chunk,
};

/// Chunk recuperado junto con su distancia a la consulta.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub distance: f32,
}

#[derive(Debug)]
struct IndexEntry {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// Colección inmutable de pares (vector, chunk) de un documento.
#[derive(Debug)]
pub struct VectorIndex {
    metric: DistanceMetric,
    dims: usize,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Crea el índice a partir de chunks y vectores alineados por posición.
    pub fn new(
        metric: DistanceMetric,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
    ) -> RagResult<Self> {
        if chunks.len() != vectors.len() {
            return Err(RagError::EmbeddingService(format!(
                "Número de embeddings ({}) distinto al número de chunks ({})",
                vectors.len(),
                chunks.len()
            )));
        }
        let dims = vectors.first().map(Vec::len).unwrap_or(0);
        if dims == 0 {
            return Err(RagError::EmbeddingService(
                "El servicio devolvió embeddings vacíos".to_string(),
            ));
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            return Err(RagError::EmbeddingService(format!(
                "Dimensión inconsistente en el embedding {bad}: {} != {dims}",
                vectors[bad].len()
            )));
        }

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();
        Ok(Self {
            metric,
            dims,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Devuelve los `top_k` chunks más cercanos, ordenados por distancia
    /// ascendente; los empates se resuelven por posición del chunk.
    pub fn search(&self, query: &[f32], top_k: usize) -> RagResult<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(RagError::EmbeddingService(format!(
                "Dimensión de la consulta ({}) distinta a la del índice ({})",
                query.len(),
                self.dims
            )));
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, distance(self.metric, query, &entry.vector)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(i, distance)| SearchHit {
                chunk: self.entries[i].chunk.clone(),
                distance,
            })
            .collect())
    }
}

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Llama al servicio de embeddings con timeout y reintentos con backoff
/// exponencial (`base * 2^(intento-1)`, tope 2^5) para fallos transitorios.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    cfg: &EmbeddingConfig,
) -> Result<Vec<Vec<f32>>, ServiceCallError> {
    let mut last_err = None;

    for attempt in 0..=cfg.max_retries {
        if attempt > 0 {
            let factor = 1u32 << (attempt - 1).min(5);
            tokio::time::sleep(cfg.retry_base_delay * factor).await;
        }

        let outcome = match tokio::time::timeout(cfg.timeout, embedder.embed(texts)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceCallError::Transient(format!(
                "timeout tras {:?}",
                cfg.timeout
            ))),
        };

        match outcome {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => {
                return Err(ServiceCallError::Permanent(format!(
                    "Número de embeddings ({}) distinto al número de textos ({})",
                    vectors.len(),
                    texts.len()
                )))
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "Intento {}/{} de embeddings fallido: {err}",
                    attempt + 1,
                    cfg.max_retries + 1
                );
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        ServiceCallError::Transient("Embeddings fallidos tras los reintentos".to_string())
    }))
}

/// Genera los embeddings de todos los chunks y construye el índice.
///
/// Los lotes se procesan con concurrencia acotada y los resultados se
/// reensamblan en el orden original de los chunks. Si un lote agota sus
/// reintentos, la construcción completa falla.
pub async fn build_index(
    embedder: &dyn Embedder,
    chunks: Vec<Chunk>,
    cfg: &EmbeddingConfig,
    metric: DistanceMetric,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> RagResult<VectorIndex> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let batches: Vec<Vec<String>> = texts
        .chunks(cfg.batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect();
    let total = batches.len();
    let completed = AtomicUsize::new(0);

    info!(
        "Generando embeddings de {} chunks en {} lotes (concurrencia {})",
        chunks.len(),
        total,
        cfg.concurrency
    );

    let per_batch: Vec<Vec<Vec<f32>>> = stream::iter(batches.into_iter().enumerate())
        .map(|(i, batch)| {
            let completed = &completed;
            async move {
                let vectors = embed_with_retry(embedder, &batch, cfg)
                    .await
                    .map_err(|e| {
                        RagError::EmbeddingService(format!("lote {}/{}: {e}", i + 1, total))
                    })?;
                let done = completed.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                debug!("Lote {}/{} de embeddings completado", i + 1, total);
                on_progress(done, total);
                Ok::<_, RagError>(vectors)
            }
        })
        .buffered(cfg.concurrency.max(1))
        .try_collect()
        .await?;

    let vectors: Vec<Vec<f32>> = per_batch.into_iter().flatten().collect();
    VectorIndex::new(metric, chunks, vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            index,
            page: 1,
            text: text.to_string(),
            start_char: 0,
            end_char: text.len(),
        }
    }

    fn fast_cfg(batch_size: usize, concurrency: usize, max_retries: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size,
            concurrency,
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
        }
    }

    /// Codifica cada texto "n" como el vector [n, 1].
    struct NumberEmbedder {
        calls: Mutex<Vec<Vec<String>>>,
        fail_first: Mutex<usize>,
        delay_ms_for_first_batch: u64,
    }

    impl NumberEmbedder {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_first: Mutex::new(0),
                delay_ms_for_first_batch: 0,
            }
        }
    }

    #[async_trait]
    impl Embedder for NumberEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
            self.calls.lock().unwrap().push(texts.to_vec());
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ServiceCallError::Transient("503".into()));
                }
            }
            if texts.first().map(String::as_str) == Some("0") && self.delay_ms_for_first_batch > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms_for_first_batch)).await;
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.parse::<f32>().unwrap_or(0.0), 1.0])
                .collect())
        }
    }

    #[test]
    fn cosine_search_orders_by_similarity() {
        let index = VectorIndex::new(
            DistanceMetric::Cosine,
            vec![chunk(0, "a"), chunk(1, "b"), chunk(2, "c")],
            vec![vec![0.8, 0.2], vec![0.1, 0.9], vec![0.9, 0.0]],
        )
        .unwrap();
        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.chunk.index).collect();
        assert_eq!(order, vec![2, 0, 1]);
        assert!(hits[0].distance.abs() < 1e-5);
    }

    #[test]
    fn l2_search_and_tie_breaking() {
        let index = VectorIndex::new(
            DistanceMetric::L2,
            vec![chunk(0, "a"), chunk(1, "b"), chunk(2, "c")],
            vec![vec![1.0, 1.0], vec![0.0, 0.0], vec![0.0, 0.0]],
        )
        .unwrap();
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].chunk.index, 1);
        assert_eq!(hits[1].chunk.index, 2);
    }

    #[test]
    fn rejects_inconsistent_dimensions() {
        let err = VectorIndex::new(
            DistanceMetric::Cosine,
            vec![chunk(0, "a"), chunk(1, "b")],
            vec![vec![1.0, 0.0], vec![1.0]],
        )
        .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingService(_)));

        let index = VectorIndex::new(DistanceMetric::Cosine, vec![chunk(0, "a")], vec![vec![1.0, 0.0]])
            .unwrap();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[tokio::test]
    async fn builds_index_in_chunk_order_despite_completion_order() {
        let mut embedder = NumberEmbedder::new();
        embedder.delay_ms_for_first_batch = 50;
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, &i.to_string())).collect();
        let progress = Mutex::new(Vec::new());

        let index = build_index(
            &embedder,
            chunks,
            &fast_cfg(3, 4, 0),
            DistanceMetric::L2,
            &|done, total| progress.lock().unwrap().push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(index.len(), 10);
        for i in 0..10 {
            let hits = index.search(&[i as f32, 1.0], 1).unwrap();
            assert_eq!(hits[0].chunk.index, i);
            assert_eq!(hits[0].chunk.text, i.to_string());
        }
        let progress = progress.into_inner().unwrap();
        assert_eq!(progress.len(), 4);
        assert_eq!(progress.last(), Some(&(4, 4)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let embedder = NumberEmbedder::new();
        *embedder.fail_first.lock().unwrap() = 2;
        let texts = vec!["1".to_string(), "2".to_string()];
        let vectors = embed_with_retry(&embedder, &texts, &fast_cfg(2, 1, 3)).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(embedder.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_call() {
        let embedder = NumberEmbedder::new();
        *embedder.fail_first.lock().unwrap() = 10;
        let texts = vec!["1".to_string()];
        let err = embed_with_retry(&embedder, &texts, &fast_cfg(1, 1, 2)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(embedder.calls.lock().unwrap().len(), 3);
    }

    /// Falla siempre, de forma transitoria, en el lote que empieza por `first`.
    struct FailingBatchEmbedder {
        first: String,
        attempts: Mutex<usize>,
    }

    #[async_trait]
    impl Embedder for FailingBatchEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
            if texts.first() == Some(&self.first) {
                *self.attempts.lock().unwrap() += 1;
                return Err(ServiceCallError::Transient("503".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn one_failing_batch_of_five_fails_the_whole_build() {
        let embedder = FailingBatchEmbedder {
            first: "2".to_string(),
            attempts: Mutex::new(0),
        };
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, &i.to_string())).collect();
        let max_retries = 2;

        // Lotes de 2: [0,1] [2,3] [4,5] [6,7] [8,9]; falla el segundo.
        let result = build_index(
            &embedder,
            chunks,
            &fast_cfg(2, 2, max_retries),
            DistanceMetric::Cosine,
            &|_, _| {},
        )
        .await;

        assert_eq!(*embedder.attempts.lock().unwrap(), max_retries as usize + 1);
        match result {
            Err(RagError::EmbeddingService(msg)) => assert!(msg.contains("lote 2/5"), "{msg}"),
            other => panic!("se esperaba un fallo de embeddings, no {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_index_runs_on_a_spawned_task() {
        let embedder = Arc::new(NumberEmbedder::new());
        let chunks: Vec<Chunk> = (0..5).map(|i| chunk(i, &i.to_string())).collect();
        let task = tokio::spawn(async move {
            build_index(
                embedder.as_ref(),
                chunks,
                &fast_cfg(2, 2, 0),
                DistanceMetric::L2,
                &|_, _| {},
            )
            .await
            .map(|index| index.len())
        });
        assert_eq!(task.await.unwrap().unwrap(), 5);
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test]
    async fn timeout_is_an_embedding_failure() {
        let mut cfg = fast_cfg(1, 1, 0);
        cfg.timeout = Duration::from_millis(20);
        let err = build_index(
            &SlowEmbedder,
            vec![chunk(0, "x")],
            &cfg,
            DistanceMetric::Cosine,
            &|_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingService(ref msg) if msg.contains("timeout")));
    }

    struct ShortEmbedder {
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl Embedder for ShortEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceCallError> {
            *self.calls.lock().unwrap() += 1;
            Ok(vec![vec![1.0]])
        }
    }

    #[tokio::test]
    async fn count_mismatch_is_permanent_and_not_retried() {
        let calls = Arc::new(Mutex::new(0));
        let embedder = ShortEmbedder {
            calls: calls.clone(),
        };
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_with_retry(&embedder, &texts, &fast_cfg(2, 1, 3)).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
