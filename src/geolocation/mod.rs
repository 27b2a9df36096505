//! Account and domain geolocation over a local GeoLite-style database.
//!
//! Resolution runs account → domain → IP → coordinates with a cache level
//! at each step, a negative cache for confirmed-missing accounts, and an
//! atomically persisted cache file shared across restarts.

mod cache;
mod dns;
mod domain;
mod geolite;
mod resolver;

pub use dns::{DnsHostResolver, HostResolver};
pub use domain::normalize_domain;
pub use geolite::{CityDatabase, GeoLiteDb};
pub use resolver::Resolver;
