//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.addr must be host:port, got '{0}'")]
    InvalidServerAddr(String),
    #[error("server.dial_timeout_secs must be positive")]
    ZeroDialTimeout,
    #[error("identity.nick is required")]
    MissingNick,
    #[error("identity.nick must not contain whitespace, got '{0}'")]
    InvalidNick(String),
    #[error("pool.max_channels_per_subconn must be at least 1")]
    ZeroChannelCap,
    #[error("pool channel name is empty")]
    EmptyChannel,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let addr = &config.server.addr;
    let valid_addr = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid_addr {
        errors.push(ValidationError::InvalidServerAddr(addr.clone()));
    }
    if config.server.dial_timeout_secs == 0 {
        errors.push(ValidationError::ZeroDialTimeout);
    }

    let nick = &config.identity.nick;
    if nick.is_empty() {
        errors.push(ValidationError::MissingNick);
    } else if nick.chars().any(char::is_whitespace) {
        errors.push(ValidationError::InvalidNick(nick.clone()));
    }

    if config.pool.max_channels_per_subconn == 0 {
        errors.push(ValidationError::ZeroChannelCap);
    }
    let mut names = config
        .pool
        .channels
        .iter()
        .chain(&config.pool.priority_channels);
    if names.any(|c| c.trim().trim_start_matches('#').is_empty()) {
        errors.push(ValidationError::EmptyChannel);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
