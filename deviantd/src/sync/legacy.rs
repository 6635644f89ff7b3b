use std::{io, path::Path};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::{LegacyImportStats, LegacyMapping, LegacySeen, MetadataStore, StoreError};

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("failed to read legacy state: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reads the flat `{"users": {name: {"seen_ids": [..], "seeded_ids": [..]}}}`
/// state file. `None` when the file is absent or not valid JSON; malformed
/// entries inside a valid file are skipped.
pub fn load_legacy_state(path: &Path) -> Result<Option<LegacyMapping>, LegacyError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(Some(parse_legacy_value(&value))),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "legacy state is not valid JSON; ignoring it");
            Ok(None)
        }
    }
}

pub fn parse_legacy_value(value: &Value) -> LegacyMapping {
    let mut mapping = LegacyMapping::new();
    let Some(users) = value.get("users").and_then(Value::as_object) else {
        return mapping;
    };
    for (username, state) in users {
        if username.trim().is_empty() {
            continue;
        }
        let Some(seen) = state.get("seen_ids").and_then(Value::as_array) else {
            continue;
        };
        let seeded_ids = state
            .get("seeded_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(id_string).collect())
            .unwrap_or_default();
        mapping.insert(
            username.clone(),
            LegacySeen {
                seen_ids: seen.iter().filter_map(id_string).collect(),
                seeded_ids,
            },
        );
    }
    mapping
}

fn id_string(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// One-time import into the store. Later startups see the marker and do
/// nothing, even if the file is still there.
pub async fn migrate_legacy_state(
    store: &MetadataStore,
    path: &Path,
) -> Result<Option<LegacyImportStats>, LegacyError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(None);
    }
    if store.legacy_import_done().await? {
        debug!(path = %path.display(), "legacy state already imported");
        return Ok(None);
    }
    let Some(mapping) = load_legacy_state(path)? else {
        return Ok(None);
    };
    let stats = store
        .import_legacy_seen_once(&mapping, &path.display().to_string())
        .await?;
    if let Some(stats) = &stats {
        info!(
            path = %path.display(),
            artists = stats.artists,
            seen_rows = stats.seen_rows,
            "imported legacy seen state"
        );
    }
    Ok(stats)
}
