//! Upstream source plumbing for the fetcher: per-source caches, cooldown
//! bookkeeping, and rate-limit handling.

use std::collections::HashMap;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::config::{SECONDARY_REGISTRY_CACHE_TTL, VALIDATOR_LIST_CACHE_TTL};

/// One entry of the secondary domain registry.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RegistryEntry {
    #[serde(default)]
    pub master_key: String,
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub domain_legacy: String,
}

impl RegistryEntry {
    /// Preferred domain, falling back to the legacy field.
    pub fn effective_domain(&self) -> &str {
        let domain = self.domain.trim();
        if !domain.is_empty() {
            domain
        } else {
            self.domain_legacy.trim()
        }
    }
}

#[derive(Debug)]
pub(crate) struct ListCacheEntry {
    pub payload: Value,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub(crate) struct RegistryCacheEntry {
    pub entries: Vec<RegistryEntry>,
    pub expires_at: Instant,
}

/// Mutable per-source state; the fetcher guards this with one mutex held
/// only around map reads and writes.
#[derive(Debug, Default)]
pub(crate) struct SourceState {
    pub list_cache: HashMap<String, ListCacheEntry>,
    pub secondary_cache: Option<RegistryCacheEntry>,
    pub cooldown_until: HashMap<String, Instant>,
    pub metadata: HashMap<String, super::metadata::MetadataEntry>,
}

impl SourceState {
    pub fn cooldown(&self, key: &str) -> Option<Instant> {
        self.cooldown_until.get(key).copied()
    }

    pub fn set_cooldown(&mut self, key: &str, until: Instant) {
        self.cooldown_until.insert(key.to_string(), until);
    }

    pub fn list_payload(&self, source: &str, allow_stale: bool) -> Option<Value> {
        let entry = self.list_cache.get(source)?;
        if !allow_stale && Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.payload.clone())
    }

    pub fn store_list_payload(&mut self, source: &str, payload: Value) {
        self.list_cache.insert(
            source.to_string(),
            ListCacheEntry {
                payload,
                expires_at: Instant::now() + VALIDATOR_LIST_CACHE_TTL,
            },
        );
    }

    pub fn registry_entries(&self, allow_stale: bool) -> Option<Vec<RegistryEntry>> {
        let entry = self.secondary_cache.as_ref()?;
        if !allow_stale && Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.entries.clone())
    }

    pub fn store_registry_entries(&mut self, entries: Vec<RegistryEntry>) {
        self.secondary_cache = Some(RegistryCacheEntry {
            entries,
            expires_at: Instant::now() + SECONDARY_REGISTRY_CACHE_TTL,
        });
    }
}

/// Computes the cooldown deadline from a rate-limiting response.
///
/// `Retry-After` may be a second count or an HTTP date; anything else
/// falls back to the supplied duration.
pub(crate) fn cooldown_from_retry_after(
    retry_after: Option<&str>,
    fallback: std::time::Duration,
) -> Instant {
    let now = Instant::now();
    let Some(raw) = retry_after.map(str::trim).filter(|s| !s.is_empty()) else {
        return now + fallback;
    };
    if let Ok(secs) = raw.parse::<u64>() {
        if secs > 0 {
            return now + std::time::Duration::from_secs(secs);
        }
        return now + fallback;
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(delta) = delta.to_std() {
            return now + delta;
        }
    }
    now + fallback
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn registry_entry_prefers_domain_over_legacy() {
        let entry = RegistryEntry {
            master_key: "nH".into(),
            chain: String::new(),
            domain: "new.example".into(),
            domain_legacy: "old.example".into(),
        };
        assert_eq!(entry.effective_domain(), "new.example");

        let legacy_only = RegistryEntry {
            master_key: "nH".into(),
            chain: String::new(),
            domain: "  ".into(),
            domain_legacy: "old.example".into(),
        };
        assert_eq!(legacy_only.effective_domain(), "old.example");
    }

    #[test]
    fn cooldown_parses_seconds() {
        let fallback = Duration::from_secs(600);
        let until = cooldown_from_retry_after(Some("30"), fallback);
        let delta = until - Instant::now();
        assert!(delta > Duration::from_secs(25) && delta <= Duration::from_secs(30));
    }

    #[test]
    fn cooldown_falls_back_on_garbage() {
        let fallback = Duration::from_secs(600);
        let until = cooldown_from_retry_after(Some("soon-ish"), fallback);
        let delta = until - Instant::now();
        assert!(delta > Duration::from_secs(595));
    }

    #[test]
    fn cooldown_parses_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(120);
        let header = future.to_rfc2822();
        let until = cooldown_from_retry_after(Some(&header), Duration::from_secs(600));
        let delta = until - Instant::now();
        assert!(
            delta > Duration::from_secs(100) && delta <= Duration::from_secs(121),
            "unexpected cooldown delta {delta:?}"
        );
    }

    #[test]
    fn cooldown_absent_header_uses_fallback() {
        let until = cooldown_from_retry_after(None, Duration::from_secs(600));
        let delta = until - Instant::now();
        assert!(delta > Duration::from_secs(595));
    }

    #[test]
    fn list_cache_respects_staleness_flag() {
        let mut state = SourceState::default();
        state.list_cache.insert(
            "https://vl.example".to_string(),
            ListCacheEntry {
                payload: serde_json::json!({"validators": []}),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(state.list_payload("https://vl.example", false).is_none());
        assert!(state.list_payload("https://vl.example", true).is_some());
    }
}
