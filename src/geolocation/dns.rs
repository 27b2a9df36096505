//! Hostname resolution seam.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

/// Resolves hostnames to IP addresses. The production implementation wraps
/// the system resolver; tests inject stubs.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// [`HostResolver`] backed by hickory's Tokio resolver.
pub struct DnsHostResolver {
    resolver: Arc<TokioAsyncResolver>,
}

impl DnsHostResolver {
    pub fn new(resolver: Arc<TokioAsyncResolver>) -> Self {
        DnsHostResolver { resolver }
    }
}

#[async_trait]
impl HostResolver for DnsHostResolver {
    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self.resolver.lookup_ip(host).await.map_err(Error::new)?;
        Ok(response.iter().collect())
    }
}

/// Picks the first IPv4 address, falling back to the first address of any
/// family. Returns `None` for an empty answer.
pub(crate) fn pick_ip(ips: &[IpAddr]) -> Option<IpAddr> {
    ips.iter().find(|ip| ip.is_ipv4()).or_else(|| ips.first()).copied()
}
