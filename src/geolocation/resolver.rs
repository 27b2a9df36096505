//! The geolocation resolver: account → domain → IP → coordinates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use serde_json::{json, Value};

use crate::models::{GeoLocation, Validator};
use crate::xrpl::NodeClient;

use super::cache::{load_cache, persist_cache, GeoCacheEntry};
use super::dns::{pick_ip, HostResolver};
use super::domain::{decode_account_domain, normalize_domain};
use super::CityDatabase;

struct ResolverState {
    cache: HashMap<String, GeoCacheEntry>,
    missing_account_until: HashMap<String, Instant>,
}

/// Resolves domains and accounts to coordinates with three cache levels
/// (`account:`, `domain:`, `ip:`) plus a negative cache for accounts the
/// upstream confirmed missing.
///
/// One mutex guards the in-memory maps and the persistence write; it is
/// never held across DNS or upstream I/O.
pub struct Resolver {
    dns: std::sync::Arc<dyn HostResolver>,
    city_db: std::sync::Arc<dyn CityDatabase>,
    cache_path: PathBuf,
    missing_account_ttl: Duration,
    state: Mutex<ResolverState>,
}

impl Resolver {
    pub fn new(
        dns: std::sync::Arc<dyn HostResolver>,
        city_db: std::sync::Arc<dyn CityDatabase>,
        cache_path: impl Into<PathBuf>,
        missing_account_ttl: Duration,
    ) -> Self {
        let cache_path = cache_path.into();
        let cache = load_cache(&cache_path);
        Resolver {
            dns,
            city_db,
            cache_path,
            missing_account_ttl,
            state: Mutex::new(ResolverState {
                cache,
                missing_account_until: HashMap::new(),
            }),
        }
    }

    /// Resolves a domain via DNS and the city database.
    pub async fn resolve_domain(&self, raw_domain: &str) -> Result<GeoLocation> {
        let domain = normalize_domain(raw_domain);
        if domain.is_empty() {
            bail!("invalid domain");
        }

        let domain_key = format!("domain:{domain}");
        if let Some(geo) = self.cached(&domain_key) {
            return Ok(geo);
        }

        let ips = self
            .dns
            .lookup_ips(&domain)
            .await
            .with_context(|| format!("failed to resolve domain {domain}"))?;
        let ip = pick_ip(&ips).ok_or_else(|| anyhow!("domain {domain} resolved with no IPs"))?;

        let ip_key = format!("ip:{ip}");
        if let Some(geo) = self.cached(&ip_key) {
            self.store(&[&domain_key], &geo);
            return Ok(geo);
        }

        let geo = self
            .city_db
            .lookup_city(ip)?
            .ok_or_else(|| anyhow!("no geolocation found for ip {ip}"))?;

        self.store(&[&ip_key, &domain_key], &geo);
        Ok(geo)
    }

    /// Resolves a transaction account by reading its on-ledger domain and
    /// then resolving that domain. `Ok(None)` means the account has no
    /// usable domain; that outcome is negative-cached.
    pub async fn resolve_account(
        &self,
        client: &dyn NodeClient,
        account: &str,
    ) -> Result<Option<GeoLocation>> {
        let account = account.trim();
        if account.is_empty() {
            return Ok(None);
        }

        let key = format!("account:{account}");
        if let Some(mut geo) = self.cached(&key) {
            geo.validator_address = account.to_string();
            return Ok(Some(geo));
        }
        if self.is_account_missing(account) {
            return Ok(None);
        }

        let domain = match self.fetch_account_domain(client, account).await {
            Ok(domain) => domain,
            Err(err) => {
                if is_missing_account_error(&err) {
                    self.mark_account_missing(account);
                }
                return Err(err);
            }
        };
        if domain.is_empty() {
            self.mark_account_missing(account);
            return Ok(None);
        }

        let mut geo = self.resolve_domain(&domain).await?;
        geo.validator_address = account.to_string();
        self.store(&[&key], &geo);
        self.clear_account_missing(account);
        Ok(Some(geo))
    }

    /// Writes geolocation fields onto a validator from its domain.
    pub async fn enrich_validator(&self, validator: &mut Validator) -> Result<()> {
        if validator.domain.trim().is_empty() {
            bail!("no domain available for geolocation");
        }
        let geo = self.resolve_domain(&validator.domain).await?;
        validator.latitude = geo.latitude;
        validator.longitude = geo.longitude;
        validator.country_code = geo.country_code;
        validator.city = geo.city;
        Ok(())
    }

    async fn fetch_account_domain(&self, client: &dyn NodeClient, account: &str) -> Result<String> {
        let response = client
            .command(
                "account_info",
                json!({
                    "account": account,
                    "ledger_index": "validated",
                    "strict": true,
                }),
            )
            .await?;

        let result = response
            .get("result")
            .ok_or_else(|| anyhow!("account_info missing result"))?;
        if let Some(error) = result.get("error") {
            let message = result
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            bail!("account_info error: {error} {message}");
        }

        let Some(account_data) = result.get("account_data") else {
            return Ok(String::new());
        };
        let domain_hex = account_data
            .get("Domain")
            .and_then(Value::as_str)
            .unwrap_or_default();
        decode_account_domain(domain_hex)
    }

    fn cached(&self, key: &str) -> Option<GeoLocation> {
        let state = self.state.lock().ok()?;
        state.cache.get(key).map(GeoCacheEntry::to_location)
    }

    fn store(&self, keys: &[&str], geo: &GeoLocation) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let entry = GeoCacheEntry::from_location(geo);
        for key in keys {
            state.cache.insert((*key).to_string(), entry.clone());
        }
        // Persist under the same lock so readers of the file never race a
        // concurrent writer; the write itself is temp + rename.
        if let Err(err) = persist_cache(&self.cache_path, &state.cache) {
            warn!("Failed to persist geolocation cache: {err:#}");
        }
    }

    fn is_account_missing(&self, account: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.missing_account_until.get(account) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                state.missing_account_until.remove(account);
                false
            }
            None => false,
        }
    }

    fn mark_account_missing(&self, account: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .missing_account_until
                .insert(account.to_string(), Instant::now() + self.missing_account_ttl);
        }
    }

    fn clear_account_missing(&self, account: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.missing_account_until.remove(account);
        }
    }
}

fn is_missing_account_error(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}").to_lowercase();
    message.contains("actnotfound")
        || message.contains("account not found")
        || message.contains("no account")
        || message.contains("malformedaddress")
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::xrpl::MessageCallback;

    use super::*;

    struct StubDns {
        calls: AtomicUsize,
        ips: Vec<IpAddr>,
        fail: bool,
    }

    impl StubDns {
        fn returning(ip: &str) -> Self {
            StubDns {
                calls: AtomicUsize::new(0),
                ips: vec![ip.parse().unwrap()],
                fail: false,
            }
        }

        fn failing() -> Self {
            StubDns {
                calls: AtomicUsize::new(0),
                ips: Vec::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl HostResolver for StubDns {
        async fn lookup_ips(&self, _host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("stub DNS failure");
            }
            Ok(self.ips.clone())
        }
    }

    struct StubCityDb {
        calls: AtomicUsize,
        location: Option<GeoLocation>,
    }

    impl StubCityDb {
        fn returning(lat: f64, lng: f64, country: &str, city: &str) -> Self {
            StubCityDb {
                calls: AtomicUsize::new(0),
                location: Some(GeoLocation {
                    latitude: lat,
                    longitude: lng,
                    country_code: country.into(),
                    city: city.into(),
                    validator_address: String::new(),
                }),
            }
        }

        fn empty() -> Self {
            StubCityDb {
                calls: AtomicUsize::new(0),
                location: None,
            }
        }
    }

    impl CityDatabase for StubCityDb {
        fn lookup_city(&self, _ip: IpAddr) -> Result<Option<GeoLocation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.location.clone())
        }
    }

    type CommandFn = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

    struct StubNode {
        command_calls: AtomicUsize,
        respond: CommandFn,
    }

    impl StubNode {
        fn new(respond: CommandFn) -> Self {
            StubNode {
                command_calls: AtomicUsize::new(0),
                respond,
            }
        }

        fn with_domain(domain: &str) -> Self {
            let domain_hex = hex::encode(domain);
            Self::new(Box::new(move |method, _params| {
                assert_eq!(method, "account_info");
                Ok(json!({
                    "result": { "account_data": { "Domain": domain_hex } }
                }))
            }))
        }
    }

    #[async_trait]
    impl NodeClient for StubNode {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn command(&self, method: &str, params: Value) -> Result<Value> {
            self.command_calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(method, &params)
        }
        async fn subscribe(
            &self,
            _streams: &[String],
            _callback: Option<MessageCallback>,
        ) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _streams: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn test_resolver(dns: StubDns, db: StubCityDb, path: PathBuf) -> (Resolver, Arc<StubDns>, Arc<StubCityDb>) {
        let dns = Arc::new(dns);
        let db = Arc::new(db);
        let resolver = Resolver::new(
            Arc::clone(&dns) as Arc<dyn HostResolver>,
            Arc::clone(&db) as Arc<dyn CityDatabase>,
            path,
            Duration::from_secs(3600),
        );
        (resolver, dns, db)
    }

    #[tokio::test]
    async fn resolve_domain_caches_by_domain_and_ip() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, dns, db) = test_resolver(
            StubDns::returning("1.2.3.4"),
            StubCityDb::returning(40.7128, -74.006, "US", "New York"),
            dir.path().join("geo-cache.json"),
        );

        let first = resolver.resolve_domain("https://Example.com/").await.unwrap();
        let second = resolver.resolve_domain("example.com").await.unwrap();

        assert_eq!(first.city, "New York");
        assert_eq!(second.city, "New York");
        // Normalization makes both calls the same key: one DNS query, one
        // database lookup.
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_domain_on_same_ip_reuses_ip_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, dns, db) = test_resolver(
            StubDns::returning("9.9.9.9"),
            StubCityDb::returning(48.8566, 2.3522, "FR", "Paris"),
            dir.path().join("geo-cache.json"),
        );

        resolver.resolve_domain("one.example").await.unwrap();
        let second = resolver.resolve_domain("two.example").await.unwrap();

        assert_eq!(second.city, "Paris");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 2, "each domain needs DNS");
        assert_eq!(db.calls.load(Ordering::SeqCst), 1, "IP entry is shared");
    }

    #[tokio::test]
    async fn null_island_is_a_failed_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _dns, _db) = test_resolver(
            StubDns::returning("1.2.3.4"),
            StubCityDb::empty(),
            dir.path().join("geo-cache.json"),
        );
        let err = resolver.resolve_domain("example.com").await.unwrap_err();
        assert!(err.to_string().contains("no geolocation found"));
    }

    #[tokio::test]
    async fn dns_failure_is_not_cached(){
        let dir = tempfile::tempdir().unwrap();
        let (resolver, dns, _db) = test_resolver(
            StubDns::failing(),
            StubCityDb::returning(1.0, 2.0, "US", "X"),
            dir.path().join("geo-cache.json"),
        );
        assert!(resolver.resolve_domain("example.com").await.is_err());
        assert!(resolver.resolve_domain("example.com").await.is_err());
        // No negative caching at the domain level: both calls hit DNS.
        assert_eq!(dns.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_account_caches_account_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, dns, _db) = test_resolver(
            StubDns::returning("8.8.8.8"),
            StubCityDb::returning(37.386, -122.084, "US", "Mountain View"),
            dir.path().join("geo-cache.json"),
        );
        let node = StubNode::with_domain("https://Example.com/");

        let account = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
        let first = resolver.resolve_account(&node, account).await.unwrap().unwrap();
        let second = resolver.resolve_account(&node, account).await.unwrap().unwrap();

        assert_eq!(first.validator_address, account);
        assert_eq!(second.validator_address, account);
        assert_eq!(node.command_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn account_without_domain_is_negative_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, dns, _db) = test_resolver(
            StubDns::returning("8.8.8.8"),
            StubCityDb::returning(1.0, 2.0, "US", "X"),
            dir.path().join("geo-cache.json"),
        );
        let node = StubNode::new(Box::new(|_method, _params| {
            Ok(json!({ "result": { "account_data": {} } }))
        }));

        let account = "rNoDomainAccountXXXXXXXXXXXXXXXXXX";
        for _ in 0..2 {
            let geo = resolver.resolve_account(&node, account).await.unwrap();
            assert!(geo.is_none());
        }
        // The negative cache absorbs the second call entirely.
        assert_eq!(node.command_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_account_error_is_negative_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _dns, _db) = test_resolver(
            StubDns::returning("8.8.8.8"),
            StubCityDb::returning(1.0, 2.0, "US", "X"),
            dir.path().join("geo-cache.json"),
        );
        let node = StubNode::new(Box::new(|_method, _params| {
            Ok(json!({
                "result": { "error": "actNotFound", "error_message": "Account not found." }
            }))
        }));

        let account = "rGoneAccountXXXXXXXXXXXXXXXXXXXXXX";
        assert!(resolver.resolve_account(&node, account).await.is_err());
        // Second call is served from the negative cache.
        let second = resolver.resolve_account(&node, account).await.unwrap();
        assert!(second.is_none());
        assert_eq!(node.command_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_command_error_is_not_negative_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _dns, _db) = test_resolver(
            StubDns::returning("8.8.8.8"),
            StubCityDb::returning(1.0, 2.0, "US", "X"),
            dir.path().join("geo-cache.json"),
        );
        let node = StubNode::new(Box::new(|_method, _params| bail!("connection refused")));

        let account = "rFlakyAccountXXXXXXXXXXXXXXXXXXXXX";
        assert!(resolver.resolve_account(&node, account).await.is_err());
        assert!(resolver.resolve_account(&node, account).await.is_err());
        // Both attempts reached upstream; a dial error never marks the
        // account missing.
        assert_eq!(node.command_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persisted_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("geo-cache.json");

        {
            let (writer, _dns, _db) = test_resolver(
                StubDns::returning("9.9.9.9"),
                StubCityDb::returning(48.8566, 2.3522, "FR", "Paris"),
                cache_path.clone(),
            );
            writer.resolve_domain("example.org").await.unwrap();
        }

        // A fresh resolver with panicking backends must serve the cached
        // entry without touching DNS or the database.
        let (reader, dns, db) = test_resolver(StubDns::failing(), StubCityDb::empty(), cache_path);
        let geo = reader.resolve_domain("example.org").await.unwrap();
        assert_eq!(geo.city, "Paris");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enrich_validator_requires_domain() {
        let dir = tempfile::tempdir().unwrap();
        let (resolver, _dns, _db) = test_resolver(
            StubDns::returning("1.2.3.4"),
            StubCityDb::returning(51.5074, -0.1278, "GB", "London"),
            dir.path().join("geo-cache.json"),
        );

        let mut validator = Validator {
            address: "nHTest".into(),
            public_key: "ED00".into(),
            domain: String::new(),
            name: "nHTest".into(),
            network: "mainnet".into(),
            latitude: 0.0,
            longitude: 0.0,
            country_code: "XX".into(),
            city: "Unknown".into(),
            last_updated: 0,
            is_active: true,
        };
        assert!(resolver.enrich_validator(&mut validator).await.is_err());

        validator.domain = "example.com".into();
        resolver.enrich_validator(&mut validator).await.unwrap();
        assert_eq!(validator.city, "London");
        assert_eq!(validator.country_code, "GB");
        assert!(validator.is_mapped());
    }
}
