use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::model::EntityKind;

use super::{DocumentStore, StoreError};

/// Startup fixture: documents written before the listener opens.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub clinics: Vec<Value>,
    pub users: Vec<Value>,
    pub patients: Vec<Value>,
}

/// Load a seed file into the store. Every document needs a string `id`.
/// Returns the number of documents written.
pub async fn load_seed(store: &DocumentStore, path: &Path) -> Result<usize, StoreError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::InvalidDocument(format!("{}: {e}", path.display())))?;
    let seed: Seed = serde_json::from_str(&text)
        .map_err(|e| StoreError::InvalidDocument(format!("{}: {e}", path.display())))?;
    let written = apply_seed(store, seed).await?;
    info!("seeded {written} documents from {}", path.display());
    Ok(written)
}

pub async fn apply_seed(store: &DocumentStore, seed: Seed) -> Result<usize, StoreError> {
    let groups = [
        (EntityKind::Clinic, seed.clinics),
        (EntityKind::User, seed.users),
        (EntityKind::Patient, seed.patients),
    ];
    let mut written = 0;
    for (kind, docs) in groups {
        for doc in docs {
            let id = doc
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::InvalidDocument(format!("{kind} document without id")))?;
            store.put_document(kind, &id, doc).await?;
            written += 1;
        }
    }
    Ok(written)
}
