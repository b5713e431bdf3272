use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Settings;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Logs a consola y a un fichero diario `rag-chat.<fecha>.log` en `LOG_DIR`,
/// conservando como máximo `LOG_MAX_FILES` ficheros.
pub fn init(settings: &Settings) -> anyhow::Result<()> {
    let log_dir = &settings.log_dir;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("No se pudo crear el directorio de logs {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("rag-chat")
        .filename_suffix("log")
        .max_log_files(settings.log_max_files.max(1))
        .build(log_dir)
        .context("No se pudo crear el fichero de log")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("El subscriber de tracing ya estaba inicializado")?;
    Ok(())
}
