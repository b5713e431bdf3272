use std::sync::{Arc, Mutex};

use axum::Router;
use pdf_rag_chat::{
    api,
    app_state::{AppState, SessionRegistry},
    config, logging,
    llm::{Embedder, Generator, LlmManager},
    rag::RagEngine,
};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // 1. Cargar configuración (entorno > .env > secrets.toml)
    let settings = config::resolve_settings(&config::default_providers())?;

    // 2. Inicializar logging
    logging::init(&settings)?;
    info!(
        "Proveedor {} (chat: {}, embeddings: {})",
        settings.llm_provider, settings.llm_chat_model, settings.llm_embedding_model
    );

    // 3. Inicializar gestor de LLMs y motor RAG
    let llm_manager = Arc::new(LlmManager::from_settings(&settings));
    let embedder: Arc<dyn Embedder> = llm_manager.clone();
    let generator: Arc<dyn Generator> = llm_manager;
    let engine = RagEngine::from_settings(&settings, embedder, generator);

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear estado compartido de la aplicación
    let sessions = SessionRegistry::with_idle_ttl(settings.session_idle_ttl);
    let app_state = AppState {
        settings: Arc::new(settings),
        engine: Arc::new(engine),
        sessions,
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 5. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &app_state.settings.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if app_state.settings.open_browser && webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
