//! Periodic multi-source validator aggregation.
//!
//! A refresh merges three sources in a fixed order: the cryptographically
//! blobbed validator lists, the upstream node's trusted key set, and the
//! secondary domain registry. Persisted metadata fills the gaps, the
//! resolver enriches, and the coverage lock guarantees a mapped validator
//! never regresses to null island.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{
    Config, DEFAULT_SOURCE_COOLDOWN, MAX_VALIDATORS, RATE_LIMIT_COOLDOWN,
    VALIDATOR_LIST_MAX_RETRIES,
};
use crate::error_handling::PipelineStats;
use crate::geolocation::Resolver;
use crate::models::Validator;
use crate::xrpl::NodeClient;

use super::metadata::{load_metadata, persist_metadata, MetadataEntry};
use super::sources::{cooldown_from_retry_after, RegistryEntry, SourceState};

#[derive(Default)]
struct Snapshot {
    validators: HashMap<String, Validator>,
    last_update: Option<DateTime<Utc>>,
}

/// Validator fetcher with periodic background refresh.
pub struct Fetcher {
    client: Arc<dyn NodeClient>,
    resolver: Option<Arc<Resolver>>,
    http: reqwest::Client,
    stats: Arc<PipelineStats>,
    network: String,
    refresh_interval: Duration,
    max_validators: usize,
    validator_list_sites: Vec<String>,
    secondary_registry_url: String,
    metadata_cache_path: PathBuf,
    pub(crate) network_health_urls: Vec<String>,
    pub(crate) network_health_retries: u32,
    snapshot: RwLock<Snapshot>,
    source_state: Mutex<SourceState>,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(
        client: Arc<dyn NodeClient>,
        resolver: Option<Arc<Resolver>>,
        http: reqwest::Client,
        stats: Arc<PipelineStats>,
        config: &Config,
    ) -> Self {
        let metadata_cache_path = PathBuf::from(&config.validator_metadata_cache_path);
        let metadata = load_metadata(&metadata_cache_path);

        Fetcher {
            client,
            resolver,
            http,
            stats,
            network: config.network.to_lowercase(),
            refresh_interval: Duration::from_secs(config.validator_refresh_interval),
            max_validators: MAX_VALIDATORS,
            validator_list_sites: config.validator_list_sites.clone(),
            secondary_registry_url: config.secondary_registry_url.clone(),
            metadata_cache_path,
            network_health_urls: config.network_health_json_rpc_urls.clone(),
            network_health_retries: config.network_health_retries,
            snapshot: RwLock::new(Snapshot::default()),
            source_state: Mutex::new(SourceState {
                metadata,
                ..SourceState::default()
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the background refresh loop: one immediate refresh, then one
    /// per `refresh_interval` until [`Fetcher::stop`].
    pub fn start(self: &Arc<Self>) {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = fetcher.refresh().await {
                fetcher.stats.record_validator_refresh(false);
                error!("Initial validator fetch failed: {err:#}");
            } else {
                fetcher.stats.record_validator_refresh(true);
            }

            let mut ticker = tokio::time::interval(fetcher.refresh_interval);
            ticker.tick().await; // the immediate tick was the refresh above
            loop {
                tokio::select! {
                    _ = fetcher.cancel.cancelled() => {
                        info!("Validator fetcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match fetcher.refresh().await {
                            Ok(()) => fetcher.stats.record_validator_refresh(true),
                            Err(err) => {
                                fetcher.stats.record_validator_refresh(false);
                                error!("Periodic validator fetch failed: {err:#}");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stops the refresh loop; idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs one full refresh cycle and commits a fresh snapshot.
    pub async fn refresh(&self) -> Result<()> {
        debug!("Fetching validators");

        let list_payload = self
            .fetch_validator_list()
            .await
            .context("failed to fetch validator list")?;
        let mut validators = self.parse_validators(&list_payload);

        let trusted_set = match self.fetch_trusted_validators().await {
            Ok((trusted, set)) => {
                validators = merge_validators(validators, trusted);
                Some(set)
            }
            Err(err) => {
                warn!("Failed to fetch trusted validators: {err:#}");
                None
            }
        };

        if let Err(err) = self
            .apply_secondary_registry(&mut validators, trusted_set.as_ref())
            .await
        {
            warn!("Failed to enrich validators from secondary registry: {err:#}");
        }

        // Persisted metadata first, so enrichment only has to cover what
        // past runs never managed to map.
        self.apply_persisted_metadata(&mut validators);

        if validators.len() > self.max_validators {
            warn!(
                "Limiting validators from {} to {}",
                validators.len(),
                self.max_validators
            );
            validators.truncate(self.max_validators);
        }

        if let Some(resolver) = &self.resolver {
            for validator in validators.iter_mut() {
                match resolver.enrich_validator(validator).await {
                    Ok(()) => self.stats.record_geo_enrich(true),
                    Err(err) => {
                        self.stats.record_geo_enrich(false);
                        debug!(
                            "Failed to enrich validator {}: {err:#}",
                            validator.address
                        );
                    }
                }
            }
        }

        self.preserve_mapped_coverage(&mut validators);

        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.validators = validators
                .iter()
                .map(|v| (v.address.clone(), v.clone()))
                .collect();
            snapshot.last_update = Some(Utc::now());
        }

        self.update_persisted_metadata(&validators);

        info!("Validators updated: {}", validators.len());
        Ok(())
    }

    /// Returns the current validator snapshot.
    pub fn get_all(&self) -> Vec<Validator> {
        self.snapshot
            .read()
            .map(|snapshot| snapshot.validators.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns one validator by address.
    pub fn get(&self, address: &str) -> Option<Validator> {
        self.snapshot
            .read()
            .ok()
            .and_then(|snapshot| snapshot.validators.get(address).cloned())
    }

    /// Timestamp of the last committed refresh.
    pub fn get_last_update(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().ok().and_then(|snapshot| snapshot.last_update)
    }

    async fn fetch_validator_list(&self) -> Result<Value> {
        let mut last_err: Option<anyhow::Error> = None;

        for url in &self.validator_list_sites {
            let cooldown_key = format!("validator-list:{url}");
            let in_cooldown = self
                .with_source_state(|state| state.cooldown(&cooldown_key))
                .is_some_and(|until| Instant::now() < until);
            if in_cooldown {
                warn!("Skipping validator list source {url} while in cooldown");
                if let Some(stale) = self.with_source_state(|state| state.list_payload(url, true)) {
                    return Ok(stale);
                }
                continue;
            }
            if let Some(fresh) = self.with_source_state(|state| state.list_payload(url, false)) {
                return Ok(fresh);
            }

            for attempt in 0..VALIDATOR_LIST_MAX_RETRIES {
                if attempt > 0 {
                    let backoff = Duration::from_secs(1u64 << (attempt - 1));
                    debug!("Retrying validator list fetch from {url} in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => bail!("refresh cancelled"),
                    }
                }

                let response = match self
                    .http
                    .get(url)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("Validator list fetch from {url} failed (attempt {}): {err}", attempt + 1);
                        last_err = Some(anyhow!(err).context("failed to fetch validator list"));
                        continue;
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
                    {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let until =
                            cooldown_from_retry_after(retry_after.as_deref(), RATE_LIMIT_COOLDOWN);
                        self.with_source_state(|state| state.set_cooldown(&cooldown_key, until));
                    }
                    warn!("Validator list site {url} returned status {status} (attempt {})", attempt + 1);
                    last_err = Some(anyhow!("validator list site returned status {status}"));
                    continue;
                }

                let body: Value = match response.json().await {
                    Ok(body) => body,
                    Err(err) => {
                        warn!("Validator list parse from {url} failed: {err}");
                        last_err = Some(anyhow!(err).context("failed to parse validator list"));
                        continue;
                    }
                };

                let Some(blob) = body.get("blob").and_then(Value::as_str) else {
                    warn!("No blob field in validator list response from {url}");
                    last_err = Some(anyhow!("no blob field in validator list response"));
                    continue;
                };

                let blob_bytes = match base64::engine::general_purpose::STANDARD.decode(blob) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("Base64 decode of validator list blob from {url} failed: {err}");
                        last_err = Some(anyhow!("failed to decode base64 blob: {err}"));
                        continue;
                    }
                };

                let payload: Value = match serde_json::from_slice(&blob_bytes) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Decoded validator list blob from {url} is not JSON: {err}");
                        last_err = Some(anyhow!("failed to parse decoded blob: {err}"));
                        continue;
                    }
                };

                self.with_source_state(|state| state.store_list_payload(url, payload.clone()));
                return Ok(payload);
            }
        }

        // Every live source is exhausted; any stale cache beats failing.
        for url in &self.validator_list_sites {
            if let Some(stale) = self.with_source_state(|state| state.list_payload(url, true)) {
                warn!("Using stale validator list cache from {url} after source failures");
                return Ok(stale);
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no validator list source available")))
    }

    async fn fetch_trusted_validators(&self) -> Result<(Vec<Validator>, HashSet<String>)> {
        let response = self.client.command("validators", serde_json::json!({})).await?;
        let result = response
            .get("result")
            .ok_or_else(|| anyhow!("validators response missing result"))?;

        let mut keys: Vec<String> = result
            .get("trusted_validator_keys")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // During bootstrap trusted_validator_keys may be empty; publisher
        // list membership still lets us map validator metadata.
        if keys.is_empty() {
            if let Some(lists) = result.get("publisher_lists").and_then(Value::as_array) {
                for list in lists {
                    if let Some(members) = list.get("list").and_then(Value::as_array) {
                        keys.extend(members.iter().filter_map(Value::as_str).map(str::to_string));
                    }
                }
            }
        }

        let now = Utc::now().timestamp();
        let mut key_set = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            if key.is_empty() || !key_set.insert(key.clone()) {
                continue;
            }
            out.push(self.skeletal_validator(key.clone(), key, now));
        }

        if key_set.is_empty() {
            bail!("validators response did not include trusted or publisher list keys");
        }
        Ok((out, key_set))
    }

    fn skeletal_validator(&self, address: String, name: String, now: i64) -> Validator {
        Validator {
            public_key: address.clone(),
            address,
            domain: String::new(),
            name,
            network: self.network.clone(),
            latitude: 0.0,
            longitude: 0.0,
            country_code: "XX".to_string(),
            city: "Unknown".to_string(),
            last_updated: now,
            is_active: true,
        }
    }

    async fn apply_secondary_registry(
        &self,
        validators: &mut Vec<Validator>,
        trusted: Option<&HashSet<String>>,
    ) -> Result<()> {
        let url = self.secondary_registry_url.trim().to_string();
        if url.is_empty() {
            return Ok(());
        }
        reqwest::Url::parse(&url).context("invalid secondary registry URL")?;

        let cooldown_key = format!("registry:{url}");
        let in_cooldown = self
            .with_source_state(|state| state.cooldown(&cooldown_key))
            .is_some_and(|until| Instant::now() < until);
        if in_cooldown {
            if let Some(cached) = self.with_source_state(|state| state.registry_entries(true)) {
                self.merge_secondary_registry(validators, trusted, &cached);
                return Ok(());
            }
            bail!("secondary registry in cooldown");
        }

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                if let Some(cached) = self.with_source_state(|state| state.registry_entries(true)) {
                    warn!("Using stale secondary registry cache after fetch error: {err}");
                    self.merge_secondary_registry(validators, trusted, &cached);
                    return Ok(());
                }
                return Err(err.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let until = if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                cooldown_from_retry_after(retry_after.as_deref(), RATE_LIMIT_COOLDOWN)
            } else {
                Instant::now() + DEFAULT_SOURCE_COOLDOWN
            };
            self.with_source_state(|state| state.set_cooldown(&cooldown_key, until));

            if let Some(cached) = self.with_source_state(|state| state.registry_entries(true)) {
                warn!("Using stale secondary registry cache after status {status}");
                self.merge_secondary_registry(validators, trusted, &cached);
                return Ok(());
            }
            bail!("secondary registry returned status {status}");
        }

        let entries: Vec<RegistryEntry> = match response.json().await {
            Ok(entries) => entries,
            Err(err) => {
                if let Some(cached) = self.with_source_state(|state| state.registry_entries(true)) {
                    warn!("Using stale secondary registry cache after parse error: {err}");
                    self.merge_secondary_registry(validators, trusted, &cached);
                    return Ok(());
                }
                return Err(err.into());
            }
        };

        self.with_source_state(|state| state.store_registry_entries(entries.clone()));
        self.merge_secondary_registry(validators, trusted, &entries);
        Ok(())
    }

    fn merge_secondary_registry(
        &self,
        validators: &mut Vec<Validator>,
        trusted: Option<&HashSet<String>>,
        entries: &[RegistryEntry],
    ) {
        let mut index: HashMap<String, usize> = validators
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.address.is_empty())
            .map(|(i, v)| (v.address.clone(), i))
            .collect();

        let now = Utc::now().timestamp();
        for entry in entries {
            if !entry.chain.is_empty() && entry.chain != "main" {
                continue;
            }
            if let Some(trusted) = trusted {
                if !trusted.contains(&entry.master_key) {
                    continue;
                }
            }
            let domain = entry.effective_domain();
            if domain.is_empty() {
                continue;
            }

            if let Some(&i) = index.get(&entry.master_key) {
                let existing = &mut validators[i];
                if existing.domain.is_empty() {
                    existing.domain = domain.to_string();
                    if existing.name.is_empty() || existing.name == existing.address {
                        existing.name = domain.to_string();
                    }
                }
                continue;
            }

            let mut validator =
                self.skeletal_validator(entry.master_key.clone(), domain.to_string(), now);
            validator.domain = domain.to_string();
            index.insert(validator.address.clone(), validators.len());
            validators.push(validator);
        }
    }

    fn apply_persisted_metadata(&self, validators: &mut [Validator]) {
        self.with_source_state(|state| {
            for validator in validators.iter_mut() {
                if validator.address.is_empty() {
                    continue;
                }
                let Some(entry) = state.metadata.get(&validator.address) else {
                    continue;
                };
                if validator.domain.is_empty() {
                    validator.domain = entry.domain.clone();
                }
                if validator.name.is_empty() || validator.name == validator.address {
                    if !entry.name.is_empty() {
                        validator.name = entry.name.clone();
                    }
                }
                if !validator.is_mapped() && entry.is_mapped() {
                    validator.latitude = entry.latitude;
                    validator.longitude = entry.longitude;
                    validator.country_code = entry.country_code.clone();
                    validator.city = entry.city.clone();
                }
            }
        });
    }

    /// Coverage lock: a validator that was mapped in the previous snapshot
    /// or in persisted metadata never commits at `(0, 0)`.
    fn preserve_mapped_coverage(&self, validators: &mut [Validator]) {
        let previous: HashMap<String, Validator> = self
            .snapshot
            .read()
            .map(|snapshot| snapshot.validators.clone())
            .unwrap_or_default();

        for validator in validators.iter_mut() {
            if validator.address.is_empty() || validator.is_mapped() {
                continue;
            }

            if let Some(prev) = previous.get(&validator.address) {
                if prev.is_mapped() {
                    validator.latitude = prev.latitude;
                    validator.longitude = prev.longitude;
                    if validator.country_code.is_empty() || validator.country_code == "XX" {
                        validator.country_code = prev.country_code.clone();
                    }
                    if validator.city.is_empty() || validator.city == "Unknown" {
                        validator.city = prev.city.clone();
                    }
                    continue;
                }
            }

            self.with_source_state(|state| {
                if let Some(entry) = state.metadata.get(&validator.address) {
                    if entry.is_mapped() {
                        validator.latitude = entry.latitude;
                        validator.longitude = entry.longitude;
                        if validator.country_code.is_empty() || validator.country_code == "XX" {
                            validator.country_code = entry.country_code.clone();
                        }
                        if validator.city.is_empty() || validator.city == "Unknown" {
                            validator.city = entry.city.clone();
                        }
                    }
                }
            });
        }
    }

    fn update_persisted_metadata(&self, validators: &[Validator]) {
        let now = Utc::now().timestamp();
        let changed = self.with_source_state(|state| {
            let mut changed = false;
            for validator in validators {
                if validator.address.is_empty() {
                    continue;
                }
                let entry = state
                    .metadata
                    .entry(validator.address.clone())
                    .or_insert_with(|| {
                        changed = true;
                        MetadataEntry {
                            address: validator.address.clone(),
                            ..MetadataEntry::default()
                        }
                    });

                if !validator.domain.is_empty() && entry.domain != validator.domain {
                    entry.domain = validator.domain.clone();
                    changed = true;
                }
                if !validator.name.is_empty() && entry.name != validator.name {
                    entry.name = validator.name.clone();
                    changed = true;
                }
                if validator.is_mapped()
                    && (entry.latitude != validator.latitude
                        || entry.longitude != validator.longitude
                        || entry.city != validator.city
                        || entry.country_code != validator.country_code)
                {
                    entry.latitude = validator.latitude;
                    entry.longitude = validator.longitude;
                    entry.country_code = validator.country_code.clone();
                    entry.city = validator.city.clone();
                    changed = true;
                }
                if entry.last_seen_at != now {
                    entry.last_seen_at = now;
                    changed = true;
                }
            }
            changed
        });

        if changed {
            let snapshot =
                self.with_source_state(|state| state.metadata.clone());
            if let Err(err) = persist_metadata(&self.metadata_cache_path, &snapshot) {
                warn!("Failed to persist validator metadata cache: {err:#}");
            }
        }
    }

    fn parse_validators(&self, data: &Value) -> Vec<Validator> {
        let Some(map) = data.as_object() else {
            warn!("Unexpected validator list payload shape");
            return Vec::new();
        };
        // Some list sites nest the array under "data" instead.
        let raw = map.get("validators").or_else(|| map.get("data"));
        let Some(array) = raw.and_then(Value::as_array) else {
            warn!("No validators field found in list payload");
            return Vec::new();
        };
        array
            .iter()
            .filter_map(|raw| self.parse_validator(raw))
            .collect()
    }

    fn parse_validator(&self, raw: &Value) -> Option<Validator> {
        let map = raw.as_object()?;
        let public_key = map
            .get("validation_public_key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let domain = map
            .get("domain")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut name = domain.clone();
        if let Some(explicit) = map.get("name").and_then(Value::as_str) {
            name = explicit.to_string();
        }
        let address = map
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| public_key.clone());

        let mut validator =
            self.skeletal_validator(address, name, Utc::now().timestamp());
        validator.public_key = public_key;
        validator.domain = domain;
        Some(validator)
    }

    pub(crate) fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn with_source_state<T>(&self, f: impl FnOnce(&mut SourceState) -> T) -> T {
        let mut guard = self
            .source_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

/// De-duplicates by address, first occurrence winning; entries without an
/// address are dropped.
fn merge_validators(primary: Vec<Validator>, secondary: Vec<Validator>) -> Vec<Validator> {
    let mut seen = HashSet::new();
    primary
        .into_iter()
        .chain(secondary)
        .filter(|v| !v.address.is_empty())
        .filter(|v| seen.insert(v.address.clone()))
        .collect()
}
