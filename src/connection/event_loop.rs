//! Receive and send loops of a running connection.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Connection, SharedSendQueue};
use crate::call::{Outgoing, PendingCall, SendCall};
use crate::dial::BoxedStream;
use crate::error::{Error, Result};
use crate::proto::{IrcCodec, Message};

type Transport = Framed<BoxedStream, IrcCodec>;

/// Decode until the stream fails or ends.
///
/// Malformed lines are logged and skipped. `PING` is answered from a
/// separate task so a slow writer never stalls reading, and is still
/// forwarded. `RECONNECT` is forwarded, then ends the loop with
/// [`Error::ReconnectRequested`].
pub(super) async fn receive_loop(
    conn: &Connection,
    mut stream: SplitStream<Transport>,
    incoming: mpsc::Sender<Message>,
    token: &CancellationToken,
) -> Result<()> {
    let metrics = &conn.inner.metrics;

    while let Some(item) = stream.next().await {
        let msg = match item {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                warn!(error = %e, "Skipping malformed message");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        metrics.message_received();
        trace!(command = %msg.command, "Received");

        if msg.is("PING") {
            spawn_pong(conn, msg.params.clone(), token.clone());
        }
        let reconnect = msg.is("RECONNECT");

        // A dropped consumer does not end the session.
        if incoming.send(msg).await.is_err() {
            trace!("Incoming consumer gone, message discarded");
        }

        if reconnect {
            metrics.reconnect_requested();
            return Err(Error::ReconnectRequested);
        }
    }

    Err(Error::Eof)
}

fn spawn_pong(conn: &Connection, params: Vec<String>, token: CancellationToken) {
    let tx = conn.inner.submit_tx.clone();
    let closed = conn.inner.closed.clone();
    tokio::spawn(async move {
        let pong = Outgoing(Message::pong(&params));
        if let Err(e) =
            PendingCall::submit(pong, &token, &tx, &closed, Error::ConnectionClosed).await
        {
            debug!(error = %e, "PONG not sent");
        }
    });
}

/// Write calls from the own queue and the shared queue, in arrival order per
/// source. When both have work, `select!` picks a ready branch at random, so
/// neither source can starve the other. The first failed write ends the loop.
pub(super) async fn send_loop(
    conn: &Connection,
    sink: &mut SplitSink<Transport, Message>,
    mut own: mpsc::Receiver<SendCall>,
    shared: Option<SharedSendQueue>,
) -> Result<()> {
    let metrics = &conn.inner.metrics;
    let mut shared_open = shared.is_some();

    loop {
        let call = tokio::select! {
            call = own.recv() => match call {
                Some(call) => call,
                None => return Err(Error::ConnectionClosed),
            },
            call = recv_shared(shared.as_ref()), if shared_open => match call {
                Some(call) => call,
                None => {
                    debug!("Shared send queue closed");
                    shared_open = false;
                    continue;
                }
            },
        };

        let (Outgoing(msg), completer) = call.into_parts();
        trace!(call_id = %completer.id(), command = %msg.command, "Writing");
        match sink.send(msg).await {
            Ok(()) => {
                metrics.message_sent();
                completer.finish(Ok(()));
            }
            Err(e) => {
                let err = Error::from(e);
                completer.finish(Err(err.clone()));
                return Err(err);
            }
        }
    }
}

async fn recv_shared(shared: Option<&SharedSendQueue>) -> Option<SendCall> {
    match shared {
        Some(queue) => queue.lock().await.recv().await,
        None => std::future::pending().await,
    }
}
