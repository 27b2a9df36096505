//! Persisted validator metadata.
//!
//! Domains, names, and coordinates learned in past refreshes survive a
//! restart through this version-1 JSON file, so a cold start does not
//! regress map coverage.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub(crate) const METADATA_CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct MetadataEntry {
    pub address: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub last_seen_at: i64,
}

impl MetadataEntry {
    pub fn is_mapped(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataCacheFile {
    version: u32,
    entries: HashMap<String, MetadataEntry>,
}

/// Loads persisted metadata; missing files, version mismatches, and parse
/// failures all yield an empty map (the latter with a warning).
pub(crate) fn load_metadata(path: &Path) -> HashMap<String, MetadataEntry> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read validator metadata cache {}: {err}", path.display());
            }
            return HashMap::new();
        }
    };

    let payload: MetadataCacheFile = match serde_json::from_slice(&data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("Failed to parse validator metadata cache {}: {err}", path.display());
            return HashMap::new();
        }
    };
    if payload.version != METADATA_CACHE_VERSION {
        return HashMap::new();
    }

    info!(
        "Loaded validator metadata cache from {} ({} entries)",
        path.display(),
        payload.entries.len()
    );
    payload.entries
}

/// Writes metadata atomically via temp file + rename.
pub(crate) fn persist_metadata(path: &Path, entries: &HashMap<String, MetadataEntry>) -> Result<()> {
    let payload = MetadataCacheFile {
        version: METADATA_CACHE_VERSION,
        entries: entries.clone(),
    };
    let data = serde_json::to_vec_pretty(&payload).context("failed to serialize metadata cache")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &data)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator-metadata-cache.json");

        let mut entries = HashMap::new();
        entries.insert(
            "nHValidator".to_string(),
            MetadataEntry {
                address: "nHValidator".into(),
                domain: "ripple.com".into(),
                name: "Ripple".into(),
                latitude: 37.7749,
                longitude: -122.4194,
                country_code: "US".into(),
                city: "San Francisco".into(),
                last_seen_at: 1_700_000_000,
            },
        );
        persist_metadata(&path, &entries).unwrap();

        let loaded = load_metadata(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["nHValidator"].domain, "ripple.com");
        assert!(loaded["nHValidator"].is_mapped());
    }

    #[test]
    fn version_mismatch_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator-metadata-cache.json");
        std::fs::write(&path, r#"{"version":99,"entries":{}}"#).unwrap();
        assert!(load_metadata(&path).is_empty());
    }

    #[test]
    fn unmapped_entry_reports_unmapped() {
        let entry = MetadataEntry {
            address: "nH".into(),
            ..Default::default()
        };
        assert!(!entry.is_mapped());
    }
}
