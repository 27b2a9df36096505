//! Application configuration and constants.
//!
//! Configuration is read from environment variables with defaults, then
//! validated before the service starts; an invalid configuration is a fatal
//! startup error.

mod constants;
mod types;

pub use constants::*;
pub use types::{Config, ConfigError, LogFormat, LogLevel};
