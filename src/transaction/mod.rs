//! Transaction ingestion: stream parsing, payment filtering, geolocation
//! enrichment, and ordered callback dispatch.

mod candidates;
mod listener;
mod parse;

pub use candidates::gather_geo_candidates;
pub use listener::{AccountResolver, Listener, ListenerOptions, TransactionCallback};
pub use parse::parse_transaction;
