//! Error taxonomy and process-wide pipeline statistics.

mod stats;
mod types;

pub use stats::PipelineStats;
pub use types::{DropReason, InitializationError};
