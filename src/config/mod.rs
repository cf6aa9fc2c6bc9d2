//! Configuration loading and management.
//!
//! - [`types`]: config struct definitions and conversion into runtime types
//! - [`validation`]: startup checks that collect every problem at once
//! - [`defaults`]: serde default functions

mod defaults;
mod types;
mod validation;

use std::path::Path;

pub use types::{
    Config, ConfigError, IdentityConfig, MetricsConfig, PoolSection, ServerConfig, TlsConfig,
};
pub use validation::{ValidationError, validate};

use crate::error::{Error, Result};

/// Load `path` and validate it, folding every problem into
/// [`Error::InvalidConfig`].
pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = Config::load(path).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    validate(&config).map_err(|errors| {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Error::InvalidConfig(joined)
    })?;
    Ok(config)
}
