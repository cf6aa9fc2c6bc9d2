//! Integration test common infrastructure.
//!
//! Provides a scripted chat server, TLS test material and helpers for
//! waiting on async state.

pub mod server;
pub mod tls;

#[allow(unused_imports)]
pub use server::{Event, MockServer};

use std::time::Duration;

/// Poll `cond` every 10ms until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually<F>(within: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
