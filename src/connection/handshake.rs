//! Registration burst sent right after dialing.

use futures_util::SinkExt;
use tokio_util::codec::Framed;
use tracing::debug;

use super::ConnectionConfig;
use crate::channel::normalize_all;
use crate::dial::BoxedStream;
use crate::error::Result;
use crate::proto::{IrcCodec, Message};

/// Send `PASS` (if any), `NICK`, `CAP REQ` (if any) and one combined
/// `JOIN` for the initial channels (if any), then flush.
pub(super) async fn register(
    framed: &mut Framed<BoxedStream, IrcCodec>,
    config: &ConnectionConfig,
) -> Result<()> {
    if let Some(pass) = config.pass.as_deref().filter(|p| !p.is_empty()) {
        framed.feed(Message::pass(pass)).await?;
    }
    framed.feed(Message::nick(&config.nick)).await?;

    if !config.capabilities.is_empty() {
        framed.feed(Message::cap_req(&config.capabilities)).await?;
    }

    let initial = normalize_all(&config.initial_channels);
    if !initial.is_empty() {
        framed.feed(Message::join(&initial)).await?;
    }

    framed.flush().await?;
    debug!(nick = %config.nick, channels = initial.len(), "Registration sent");
    Ok(())
}
