//! Geolocation cache persistence across resolver instances.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use xrpl_atlas::geolocation::{CityDatabase, HostResolver, Resolver};
use xrpl_atlas::models::GeoLocation;

struct CountingDns {
    calls: AtomicUsize,
    ip: Option<IpAddr>,
}

#[async_trait]
impl HostResolver for CountingDns {
    async fn lookup_ips(&self, _host: &str) -> Result<Vec<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.ip {
            Some(ip) => Ok(vec![ip]),
            None => bail!("dns lookup must not run"),
        }
    }
}

struct CountingCityDb {
    calls: AtomicUsize,
    location: Option<GeoLocation>,
}

impl CityDatabase for CountingCityDb {
    fn lookup_city(&self, _ip: IpAddr) -> Result<Option<GeoLocation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.location.clone())
    }
}

#[tokio::test]
async fn warm_start_resolves_from_disk_without_backends() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("geolocation-cache.json");

    // First instance resolves example.org to Paris and persists.
    {
        let writer = Resolver::new(
            Arc::new(CountingDns {
                calls: AtomicUsize::new(0),
                ip: Some("9.9.9.9".parse().unwrap()),
            }),
            Arc::new(CountingCityDb {
                calls: AtomicUsize::new(0),
                location: Some(GeoLocation {
                    latitude: 48.8566,
                    longitude: 2.3522,
                    country_code: "FR".into(),
                    city: "Paris".into(),
                    validator_address: String::new(),
                }),
            }),
            cache_path.clone(),
            Duration::from_secs(3600),
        );
        let geo = writer.resolve_domain("example.org").await.unwrap();
        assert_eq!(geo.city, "Paris");
    }

    // A new instance over the same cache path serves the entry without a
    // single DNS or database call.
    let dns = Arc::new(CountingDns {
        calls: AtomicUsize::new(0),
        ip: None,
    });
    let db = Arc::new(CountingCityDb {
        calls: AtomicUsize::new(0),
        location: None,
    });
    let reader = Resolver::new(
        Arc::clone(&dns) as Arc<dyn HostResolver>,
        Arc::clone(&db) as Arc<dyn CityDatabase>,
        cache_path,
        Duration::from_secs(3600),
    );

    let geo = reader.resolve_domain("example.org").await.unwrap();
    assert_eq!(geo.city, "Paris");
    assert_eq!(geo.country_code, "FR");
    assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
    assert_eq!(db.calls.load(Ordering::SeqCst), 0);

    // Normalized variants of the same domain also hit the cache.
    let geo = reader.resolve_domain("https://Example.org/").await.unwrap();
    assert_eq!(geo.city, "Paris");
    assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
}
