//! Tracing setup and standard spans.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .try_init();
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for one connection's run.
    pub fn connection(conn_id: u64, nick: &str, addr: &str) -> Span {
        info_span!("connection", conn_id, nick = %nick, addr = %addr)
    }

    /// Span for a pool's run.
    pub fn pool(nick: &str) -> Span {
        info_span!("pool", nick = %nick)
    }
}
