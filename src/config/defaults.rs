//! Default value functions for configuration.

pub fn default_dial_timeout_secs() -> u64 {
    30
}

pub fn default_max_channels_per_subconn() -> usize {
    50
}

/// Twitch allows 20 joins per 10 seconds for regular accounts.
pub fn default_join_rate_ms() -> u64 {
    500
}

pub fn default_prune_interval_secs() -> u64 {
    300
}
