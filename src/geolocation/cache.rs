//! Persisted geolocation cache file.
//!
//! A versioned JSON document keyed by `"account:"`, `"domain:"`, or
//! `"ip:"` plus an identifier, written atomically via temp file + rename.
//! A version mismatch on load discards the file silently.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::models::GeoLocation;

pub(crate) const GEO_CACHE_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GeoCacheEntry {
    pub country_code: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: i64,
}

impl GeoCacheEntry {
    pub fn from_location(geo: &GeoLocation) -> Self {
        GeoCacheEntry {
            country_code: geo.country_code.clone(),
            city: geo.city.clone(),
            latitude: geo.latitude,
            longitude: geo.longitude,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_location(&self) -> GeoLocation {
        GeoLocation {
            latitude: self.latitude,
            longitude: self.longitude,
            country_code: self.country_code.clone(),
            city: self.city.clone(),
            validator_address: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeoCacheFile {
    version: u32,
    entries: HashMap<String, GeoCacheEntry>,
}

/// Loads the cache from disk. Missing files and version mismatches yield
/// an empty map; a parse failure is logged and the file ignored.
pub(crate) fn load_cache(path: &Path) -> HashMap<String, GeoCacheEntry> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read geolocation cache {}: {err}", path.display());
            }
            return HashMap::new();
        }
    };

    let payload: GeoCacheFile = match serde_json::from_slice(&data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("Failed to parse geolocation cache {}: {err}", path.display());
            return HashMap::new();
        }
    };
    if payload.version != GEO_CACHE_VERSION {
        return HashMap::new();
    }

    info!(
        "Loaded geolocation cache from {} ({} entries)",
        path.display(),
        payload.entries.len()
    );
    payload.entries
}

/// Writes the cache atomically: serialize, write `<path>.tmp`, rename.
pub(crate) fn persist_cache(path: &Path, entries: &HashMap<String, GeoCacheEntry>) -> Result<()> {
    let payload = GeoCacheFile {
        version: GEO_CACHE_VERSION,
        entries: entries.clone(),
    };
    let data = serde_json::to_vec_pretty(&payload).context("failed to serialize geo cache")?;

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
