//! Material de credenciales: clave en claro, fichero JSON o documento JSON
//! codificado en Base64 (despliegues en la nube).

use std::{fmt, fs, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::error::{RagError, RagResult};

/// Documento JSON de credenciales tal y como llega desde los secretos.
#[derive(Deserialize)]
struct CredentialDocument {
    api_key: Option<String>,
    project_id: Option<String>,
    client_email: Option<String>,
}

/// Credenciales utilizables por los clientes de modelos.
///
/// `Debug` nunca muestra la clave.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    pub project_id: Option<String>,
    pub client_email: Option<String>,
}

impl Credentials {
    pub fn from_api_key(api_key: &str) -> RagResult<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(RagError::Configuration("API_KEY está vacía".to_string()));
        }
        Ok(Self {
            api_key: api_key.to_string(),
            project_id: None,
            client_email: None,
        })
    }

    /// Decodifica un bloque Base64 que contiene el documento JSON.
    /// Cualquier entrada malformada es un error; nunca se sustituye por valores por defecto.
    pub fn from_base64(encoded: &str) -> RagResult<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD.decode(compact.as_bytes()).map_err(|e| {
            RagError::Configuration(format!("CREDENTIALS_B64 no es Base64 válido: {e}"))
        })?;
        let json = String::from_utf8(bytes).map_err(|_| {
            RagError::Configuration("CREDENTIALS_B64 no decodifica a UTF-8".to_string())
        })?;
        Self::from_json(&json, "CREDENTIALS_B64")
    }

    pub fn from_file(path: &Path) -> RagResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            RagError::Configuration(format!(
                "No se pudo leer CREDENTIALS_FILE {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&json, "CREDENTIALS_FILE")
    }

    fn from_json(json: &str, origin: &str) -> RagResult<Self> {
        let doc: CredentialDocument = serde_json::from_str(json).map_err(|e| {
            RagError::Configuration(format!("{origin} no contiene un documento JSON válido: {e}"))
        })?;
        let api_key = doc
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RagError::Configuration(format!("{origin} no incluye 'api_key'")))?;
        Ok(Self {
            api_key: api_key.trim().to_string(),
            project_id: doc.project_id,
            client_email: doc.client_email,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .finish()
    }
}
