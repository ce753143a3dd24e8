//! Secrets remembered between runs.
//!
//! The file is a JSON array of `{ "value", "source", "item_id", "timestamp" }`
//! objects, newest appended last. Timestamps may be RFC 3339 or naive ISO
//! local time (treated as UTC). Entries that do not parse are skipped, so a
//! hand-edited file never blocks a run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use coursegrab::StoredSecret;

#[derive(thiserror::Error, Debug)]
pub enum SecretsFileError {
    #[error("failed to access secrets file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("secrets file {path} is not a JSON array: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretEntry {
    value: String,
    #[serde(default)]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_id: Option<String>,
    timestamp: String,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn read_entries(path: &Path) -> Result<Vec<serde_json::Value>, SecretsFileError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SecretsFileError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|source| SecretsFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load remembered secrets, newest first. A missing file yields none.
pub fn load_stored_secrets(path: &Path) -> Result<Vec<StoredSecret>, SecretsFileError> {
    let mut secrets: Vec<StoredSecret> = read_entries(path)?
        .into_iter()
        .filter_map(|raw| serde_json::from_value::<SecretEntry>(raw).ok())
        .filter(|entry| !entry.value.trim().is_empty())
        .filter_map(|entry| {
            let captured_at = parse_timestamp(&entry.timestamp)?;
            Some(StoredSecret {
                value: entry.value.trim().to_string(),
                item_id: entry.item_id.filter(|id| !id.trim().is_empty()),
                captured_at,
            })
        })
        .collect();
    secrets.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
    Ok(secrets)
}

/// Record a secret seen during this run.
///
/// Unreadable entries already in the file are kept as they are. The same
/// value for the same item is not stored twice.
pub fn append_secret(
    path: &Path,
    value: &str,
    item_id: Option<&str>,
    source: &str,
) -> Result<(), SecretsFileError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    let mut entries = read_entries(path)?;
    let duplicate = entries.iter().any(|raw| {
        serde_json::from_value::<SecretEntry>(raw.clone())
            .is_ok_and(|e| e.value == value && e.item_id.as_deref() == item_id)
    });
    if duplicate {
        return Ok(());
    }

    let entry = SecretEntry {
        value: value.to_string(),
        source: source.to_string(),
        item_id: item_id.map(str::to_string),
        timestamp: Utc::now().to_rfc3339(),
    };
    entries.push(serde_json::to_value(entry).map_err(|source| SecretsFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?);

    let body = serde_json::to_string_pretty(&entries).map_err(|source| SecretsFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, body).map_err(|source| SecretsFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}
