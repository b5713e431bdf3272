//! Estado compartido de la aplicación y sesiones de chat.
//!
//! Cada sesión es un objeto explícito con su propio ciclo de vida:
//!
//! ```text
//! Idle ──subida──▶ Processing ──índice listo──▶ Ready ──pregunta──▶ Answering
//!  ▲                    │                         ▲                    │
//!  └──── error ─────────┘                         └──── respuesta ─────┘
//! ```
//!
//! Subir un documento en `Ready`/`Answering` vuelve a `Processing` y descarta
//! el índice y la conversación anteriores. Cada subida incrementa la época de
//! la sesión; los resultados de una época anterior se descartan.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    error::{RagError, RagResult},
    models::{Answer, ConversationTurn, Document},
    rag::{IndexedDocument, RagEngine},
};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub engine: Arc<RagEngine>,
    pub sessions: SessionRegistry,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Processing,
    Ready,
    Answering,
}

#[derive(Debug)]
struct Session {
    id: Uuid,
    state: SessionState,
    epoch: u64,
    document_name: Option<String>,
    document: Option<Arc<IndexedDocument>>,
    turns: Vec<ConversationTurn>,
    progress: f32,
    message: String,
    last_active: Instant,
}

/// Vista serializable del estado de una sesión.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub document_name: Option<String>,
    pub page_count: usize,
    pub chunk_count: usize,
    pub progress: f32, // Valor entre 0.0 y 1.0
    pub message: String,
    pub turns: Vec<ConversationTurn>,
}

/// Lo necesario para responder una pregunta fuera del cerrojo de la sesión.
struct QuestionTicket {
    epoch: u64,
    document: Arc<IndexedDocument>,
    history: Vec<ConversationTurn>,
}

impl Session {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            epoch: 0,
            document_name: None,
            document: None,
            turns: Vec::new(),
            progress: 0.0,
            message: "Sube un documento PDF para empezar.".to_string(),
            last_active: Instant::now(),
        }
    }

    fn begin_processing(&mut self, name: &str) -> RagResult<u64> {
        if self.state == SessionState::Processing {
            return Err(RagError::SessionBusy(
                "ya se está procesando un documento".to_string(),
            ));
        }
        self.epoch += 1;
        self.state = SessionState::Processing;
        self.document_name = Some(name.to_string());
        self.document = None;
        self.turns.clear();
        self.progress = 0.0;
        self.message = format!("Procesando {name}...");
        Ok(self.epoch)
    }

    fn set_progress(&mut self, epoch: u64, progress: f32, message: String) {
        if self.epoch == epoch && self.state == SessionState::Processing {
            self.progress = progress;
            self.message = message;
        }
    }

    /// Devuelve `false` si el resultado pertenece a una época ya superada.
    fn finish_processing(&mut self, epoch: u64, result: &RagResult<Arc<IndexedDocument>>) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.progress = 0.0;
        match result {
            Ok(document) => {
                self.state = SessionState::Ready;
                self.message = format!(
                    "Documento listo: {} páginas, {} chunks.",
                    document.page_count, document.chunk_count
                );
                self.document = Some(document.clone());
            }
            Err(err) => {
                self.state = SessionState::Idle;
                self.document = None;
                self.document_name = None;
                self.message = format!("Error procesando el documento: {err}");
            }
        }
        true
    }

    fn begin_question(&mut self) -> RagResult<QuestionTicket> {
        match self.state {
            SessionState::Idle | SessionState::Processing => Err(RagError::IndexNotReady),
            SessionState::Answering => Err(RagError::SessionBusy(
                "ya hay una pregunta en curso".to_string(),
            )),
            SessionState::Ready => {
                let document = self.document.clone().ok_or(RagError::IndexNotReady)?;
                self.state = SessionState::Answering;
                Ok(QuestionTicket {
                    epoch: self.epoch,
                    document,
                    history: self.turns.clone(),
                })
            }
        }
    }

    /// Pregunta abandonada sin resultado (p.ej. el cliente cerró la conexión).
    fn abandon_question(&mut self, epoch: u64) {
        if self.epoch == epoch && self.state == SessionState::Answering {
            self.state = SessionState::Ready;
        }
    }

    fn finish_question(&mut self, epoch: u64, question: &str, result: RagResult<Answer>) -> RagResult<Answer> {
        if self.epoch != epoch {
            return Err(RagError::SessionBusy(
                "se subió un nuevo documento mientras se respondía; la respuesta se descartó".to_string(),
            ));
        }
        self.state = SessionState::Ready;
        let answer = result?;
        self.turns.push(answer.clone().into_turn(question));
        Ok(answer)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            document_name: self.document_name.clone(),
            page_count: self.document.as_ref().map_or(0, |d| d.page_count),
            chunk_count: self.document.as_ref().map_or(0, |d| d.chunk_count),
            progress: self.progress,
            message: self.message.clone(),
            turns: self.turns.clone(),
        }
    }
}

/// Referencia compartida a una sesión. Solo las transiciones de estado toman
/// el cerrojo; las llamadas a los modelos se hacen sin él.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    inner: Arc<Mutex<Session>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            inner: Arc::new(Mutex::new(Session::new(id))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    fn touch(&self) {
        self.lock().last_active = Instant::now();
    }

    /// Sesión inactiva durante al menos `ttl` y sin trabajo en curso.
    fn is_expired(&self, ttl: Duration) -> bool {
        let session = self.lock();
        matches!(session.state, SessionState::Idle | SessionState::Ready)
            && session.last_active.elapsed() >= ttl
    }

    /// Pasa la sesión a `Processing` y devuelve la época asignada a la subida.
    pub fn start_upload(&self, document_name: &str) -> RagResult<u64> {
        let epoch = self.lock().begin_processing(document_name)?;
        info!(session = %self.id, document = document_name, "Subida de documento iniciada");
        Ok(epoch)
    }

    /// Extrae, trocea e indexa el documento de la época indicada.
    pub async fn run_upload(&self, engine: &RagEngine, epoch: u64, doc: Document) -> RagResult<()> {
        let name = doc.name.clone();
        let on_progress = |done: usize, total: usize| {
            self.lock().set_progress(
                epoch,
                done as f32 / total.max(1) as f32,
                format!("[{done}/{total}] Generando embeddings de {name}..."),
            );
        };

        let result = engine.index_document(doc, &on_progress).await.map(Arc::new);

        let applied = self.lock().finish_processing(epoch, &result);
        if !applied {
            warn!(session = %self.id, document = %name, "Resultado de indexado descartado: documento reemplazado");
        }
        match result {
            Ok(_) => {
                info!(session = %self.id, document = %name, "Documento indexado");
                Ok(())
            }
            Err(err) => {
                error!(session = %self.id, document = %name, operation = "index_document", "Error procesando documento: {err}");
                Err(err)
            }
        }
    }

    /// Subida completa (inicio + procesamiento) en la tarea actual.
    pub async fn upload(&self, engine: &RagEngine, doc: Document) -> RagResult<()> {
        let epoch = self.start_upload(&doc.name)?;
        self.run_upload(engine, epoch, doc).await
    }

    /// Responde una pregunta y la registra en la conversación si tuvo éxito.
    pub async fn ask(&self, engine: &RagEngine, question: &str) -> RagResult<Answer> {
        if question.trim().is_empty() {
            return Err(RagError::EmptyQuestion);
        }
        let ticket = self.lock().begin_question()?;
        let mut pending = PendingQuestion {
            session: self,
            epoch: ticket.epoch,
            armed: true,
        };

        let result = engine
            .answer(&ticket.document.index, &ticket.history, question)
            .await;
        if let Err(err) = &result {
            error!(session = %self.id, operation = "answer", "Error respondiendo pregunta: {err}");
        }

        pending.armed = false;
        self.lock().finish_question(ticket.epoch, question.trim(), result)
    }
}

/// Devuelve la sesión a `Ready` si el futuro de `ask` se descarta antes de
/// registrar el resultado.
struct PendingQuestion<'a> {
    session: &'a SessionHandle,
    epoch: u64,
    armed: bool,
}

impl Drop for PendingQuestion<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(session = %self.session.id, "Pregunta abandonada antes de terminar");
            self.session.lock().abandon_question(self.epoch);
        }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Sesiones activas, aisladas entre sí. Las sesiones sin actividad durante
/// `idle_ttl` se liberan al crear nuevas.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_idle_ttl(Duration::from_secs(60 * 60))
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> SessionHandle {
        self.evict_idle();
        let handle = SessionHandle::new();
        self.lock().insert(handle.id(), handle.clone());
        info!(session = %handle.id(), "Sesión creada");
        handle
    }

    pub fn get(&self, id: &str) -> RagResult<SessionHandle> {
        let uuid = Uuid::parse_str(id).map_err(|_| RagError::SessionNotFound(id.to_string()))?;
        let handle = self
            .lock()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| RagError::SessionNotFound(id.to_string()))?;
        handle.touch();
        Ok(handle)
    }

    /// Elimina la sesión; las tareas en curso que la referencian terminan sin efecto visible.
    pub fn remove(&self, id: &str) -> RagResult<()> {
        let uuid = Uuid::parse_str(id).map_err(|_| RagError::SessionNotFound(id.to_string()))?;
        if self.lock().remove(&uuid).is_none() {
            return Err(RagError::SessionNotFound(id.to_string()));
        }
        info!(session = %uuid, "Sesión eliminada");
        Ok(())
    }

    /// Libera las sesiones inactivas. Devuelve cuántas se eliminaron.
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_expired(self.idle_ttl));
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("{evicted} sesiones inactivas liberadas");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
