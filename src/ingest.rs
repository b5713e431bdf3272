//! Procesamiento de un PDF subido: extracción de texto por página y troceado en
//! chunks solapados de tamaño fijo listos para generar embeddings.

use std::panic::{self, AssertUnwindSafe};

use tracing::{info, warn};

use crate::{
    config::ChunkingConfig,
    error::{RagError, RagResult},
    models::{Chunk, Document, PageText},
};

const PAGE_SEPARATOR: &str = "\n\n";

/// Resultado del procesamiento de un documento.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub page_count: usize,
    pub chunks: Vec<Chunk>,
}

/// Extrae y trocea el documento. Falla con `NoExtractableText` si no queda
/// ningún chunk, nunca devuelve una lista vacía.
pub fn process_document(doc: &Document, cfg: &ChunkingConfig) -> RagResult<ProcessedDocument> {
    let pages = extract_pages(doc)?;
    let page_count = pages.len();
    let chunks = split_into_chunks(&pages, cfg);

    if chunks.is_empty() {
        warn!("Documento sin texto útil: {}", doc.name);
        return Err(RagError::NoExtractableText {
            document: doc.name.clone(),
        });
    }

    info!(
        "Documento {} procesado: {} páginas, {} chunks",
        doc.name,
        page_count,
        chunks.len()
    );
    Ok(ProcessedDocument { page_count, chunks })
}

/// Igual que [`process_document`] pero en un hilo bloqueante: la extracción
/// de PDFs grandes (200+ páginas) no debe bloquear el runtime.
pub async fn process_document_blocking(
    doc: Document,
    cfg: ChunkingConfig,
) -> RagResult<ProcessedDocument> {
    let name = doc.name.clone();
    tokio::task::spawn_blocking(move || process_document(&doc, &cfg))
        .await
        .map_err(|e| RagError::InvalidDocument {
            document: name,
            reason: format!("la tarea de extracción terminó de forma anómala: {e}"),
        })?
}

/// Extrae el texto de cada página, en orden.
pub fn extract_pages(doc: &Document) -> RagResult<Vec<PageText>> {
    if doc.bytes.is_empty() {
        return Err(RagError::NoExtractableText {
            document: doc.name.clone(),
        });
    }
    if !doc.bytes.starts_with(b"%PDF") {
        return Err(RagError::InvalidDocument {
            document: doc.name.clone(),
            reason: "el contenido no es un PDF".to_string(),
        });
    }

    // pdf-extract puede entrar en pánico con PDFs exóticos.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(&doc.bytes)
    }));

    let pages = match result {
        Ok(Ok(pages)) => pages,
        Ok(Err(e)) => {
            return Err(RagError::InvalidDocument {
                document: doc.name.clone(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(RagError::InvalidDocument {
                document: doc.name.clone(),
                reason: "el extractor de PDF no pudo interpretar el fichero".to_string(),
            })
        }
    };

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText {
            number: i + 1,
            text,
        })
        .collect())
}

/// Trocea el texto de las páginas en ventanas de `chunk_size` caracteres con
/// `chunk_overlap` caracteres compartidos entre chunks consecutivos.
///
/// - Las páginas se normalizan (espacios colapsados) y se concatenan separadas
///   por una línea en blanco.
/// - Si la ventana no llega al final del texto, se recorta hasta el último fin
///   de frase (`.`, `!`, `?` seguido de espacio) de su segunda mitad.
/// - Un fragmento final con menos de `min_chunk_chars` caracteres nuevos se
///   fusiona con el chunk anterior.
/// - La página de un chunk es aquella donde empieza su texto nuevo (no solapado).
pub fn split_into_chunks(pages: &[PageText], cfg: &ChunkingConfig) -> Vec<Chunk> {
    // 1) Concatenar páginas registrando dónde empieza cada una
    let mut chars: Vec<char> = Vec::new();
    let mut page_starts: Vec<(usize, usize)> = Vec::new();
    for page in pages {
        let normalized = page.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            continue;
        }
        if !chars.is_empty() {
            chars.extend(PAGE_SEPARATOR.chars());
        }
        page_starts.push((chars.len(), page.number));
        chars.extend(normalized.chars());
    }
    if chars.is_empty() {
        return Vec::new();
    }

    // 2) Calcular ventanas [start, end)
    let windows = window_bounds(&chars, cfg);

    // 3) Materializar chunks, fusionando fragmentos finales demasiado cortos
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut prev_end = 0;
    for (start, end) in windows {
        let new_from = if chunks.is_empty() { start } else { prev_end };
        let fresh = chars[new_from..end].iter().filter(|c| !c.is_whitespace()).count();

        if let Some(last) = chunks.last_mut() {
            if fresh < cfg.min_chunk_chars {
                last.end_char = end;
                last.text = chars[last.start_char..end].iter().collect();
                prev_end = end;
                continue;
            }
        } else if fresh == 0 {
            continue;
        }

        let first_visible = (new_from..end)
            .find(|&i| !chars[i].is_whitespace())
            .unwrap_or(new_from);
        chunks.push(Chunk {
            index: chunks.len(),
            page: page_at(&page_starts, first_visible),
            text: chars[start..end].iter().collect(),
            start_char: start,
            end_char: end,
        });
        prev_end = end;
    }
    chunks
}

fn window_bounds(chars: &[char], cfg: &ChunkingConfig) -> Vec<(usize, usize)> {
    let total = chars.len();
    let size = cfg.chunk_size.max(1);
    let overlap = cfg.chunk_overlap.min(size - 1);
    let mut windows = Vec::new();
    let mut start = 0;

    while start < total {
        let mut end = (start + size).min(total);
        if end < total {
            // Nunca cortar tan pronto que el siguiente inicio no avance.
            let floor = start + (size / 2).max(overlap + 1);
            let mut i = end - 1;
            while i > floor {
                let next_is_space = chars.get(i + 1).map_or(true, |c| c.is_whitespace());
                if matches!(chars[i], '.' | '!' | '?') && next_is_space {
                    end = i + 1;
                    break;
                }
                i -= 1;
            }
        }
        windows.push((start, end));
        if end >= total {
            break;
        }
        let next = end - overlap;
        start = if next > start { next } else { end };
    }
    windows
}

fn page_at(page_starts: &[(usize, usize)], offset: usize) -> usize {
    page_starts
        .iter()
        .take_while(|(start, _)| *start <= offset)
        .last()
        .map(|(_, number)| *number)
        .unwrap_or(1)
}
