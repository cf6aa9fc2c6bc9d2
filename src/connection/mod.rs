//! A single authenticated session with the chat server.
//!
//! A [`Connection`] goes Created -> Dialing -> Ready -> Running -> Closed.
//! [`Connection::run`] dials, registers, then drives two loops until one
//! of them fails or the connection is closed:
//!
//! - the receive loop decodes lines, answers `PING`, and forwards every
//!   message to [`Connection::take_incoming`];
//! - the send loop is the only writer. It drains [`SendCall`]s from the
//!   connection's own queue and, when attached, from a queue shared with
//!   other connections (see [`Connection::with_send_queue`]).
//!
//! Membership (`joined`) is mutated only by [`Connection::join`] and
//! [`Connection::part`], and is updated *before* the wire write is known to
//! have succeeded. The protocol has no synchronous JOIN acknowledgment, so
//! callers key their own bookkeeping off the call result instead.

mod event_loop;
mod handshake;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use crate::call::{Outgoing, PendingCall, SendCall};
use crate::channel::{normalize_all, normalize_channel};
use crate::dial::Dialer;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::proto::{IrcCodec, Message};
use crate::telemetry::spans;

/// Capacity of the connection's own outbound queue.
const SUBMIT_QUEUE_CAPACITY: usize = 64;
/// Received messages buffered before the receive loop applies backpressure.
const INCOMING_CAPACITY: usize = 1024;
/// Upper bound on flushing and closing the writer during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound queue shared by several connections; whichever send loop is
/// free takes the next call.
pub type SharedSendQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<SendCall>>>;

/// Identity and registration settings for one session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub nick: String,
    pub pass: Option<String>,
    /// Refuse `send_message` locally.
    pub read_only: bool,
    /// Requested with a single `CAP REQ` during registration.
    pub capabilities: Vec<String>,
    /// Joined with one combined `JOIN` during registration.
    pub initial_channels: Vec<String>,
}

/// Cheap-to-clone handle to one session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    config: ConnectionConfig,
    dialer: Dialer,
    metrics: Arc<dyn Metrics>,
    joined: RwLock<HashSet<String>>,
    submit_tx: mpsc::Sender<SendCall>,
    submit_rx: Mutex<Option<mpsc::Receiver<SendCall>>>,
    shared_queue: Option<SharedSendQueue>,
    incoming_tx: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
    close_result: OnceLock<Result<()>>,
    ready: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("nick", &self.inner.config.nick)
            .field("joined", &self.num_joined())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, dialer: Dialer, metrics: Arc<dyn Metrics>) -> Self {
        Self::build(config, dialer, metrics, None)
    }

    /// Like [`new`](Self::new), with the send loop also draining `queue`.
    /// No priority is given to either source.
    pub fn with_send_queue(
        config: ConnectionConfig,
        dialer: Dialer,
        metrics: Arc<dyn Metrics>,
        queue: SharedSendQueue,
    ) -> Self {
        Self::build(config, dialer, metrics, Some(queue))
    }

    fn build(
        config: ConnectionConfig,
        dialer: Dialer,
        metrics: Arc<dyn Metrics>,
        shared_queue: Option<SharedSendQueue>,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let joined = normalize_all(&config.initial_channels).into_iter().collect();

        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                config,
                dialer,
                metrics,
                joined: RwLock::new(joined),
                submit_tx,
                submit_rx: Mutex::new(Some(submit_rx)),
                shared_queue,
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                closed: CancellationToken::new(),
                close_result: OnceLock::new(),
                ready: watch::Sender::new(false),
            }),
        }
    }

    /// Process-unique identifier, used in logs and by the pool.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn nick(&self) -> &str {
        &self.inner.config.nick
    }

    /// Dial, register and run the session until it fails, `scope` ends or
    /// [`close`](Self::close) is called. Always closes the transport before
    /// returning, and returns the first error seen.
    ///
    /// A connection runs at most once; later calls return
    /// [`Error::ConnectionClosed`].
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let span = spans::connection(self.inner.id, &self.inner.config.nick, self.inner.dialer.addr());
        self.run_inner(scope).instrument(span).await
    }

    async fn run_inner(&self, scope: &CancellationToken) -> Result<()> {
        let taken = (
            self.inner.submit_rx.lock().take(),
            self.inner.incoming_tx.lock().take(),
        );
        let (Some(submit_rx), Some(incoming_tx)) = taken else {
            return Err(Error::ConnectionClosed);
        };
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let token = scope.child_token();
        let supervisor = tokio::spawn(supervise(self.clone(), token.clone()));

        let result = self.session(scope, &token, submit_rx, incoming_tx).await;

        token.cancel();
        self.close();
        let _ = supervisor.await;

        match &result {
            Err(Error::ReconnectRequested) => info!("Server requested reconnect"),
            Err(e) => info!(error = %e, "Connection ended"),
            Ok(()) => {}
        }
        result
    }

    async fn session(
        &self,
        scope: &CancellationToken,
        token: &CancellationToken,
        submit_rx: mpsc::Receiver<SendCall>,
        incoming_tx: mpsc::Sender<Message>,
    ) -> Result<()> {
        let connect = async {
            let stream = self.inner.dialer.dial().await?;
            let mut framed = Framed::new(stream, IrcCodec::new());
            handshake::register(&mut framed, &self.inner.config).await?;
            Ok::<_, Error>(framed)
        };
        let framed = tokio::select! {
            framed = connect => framed?,
            _ = token.cancelled() => return Err(self.stop_reason(scope)),
        };

        self.inner.metrics.connected();
        self.inner.ready.send_replace(true);
        info!(tls = self.inner.dialer.is_tls(), "Connection ready");

        let (mut sink, stream) = framed.split();
        let result = {
            let recv = event_loop::receive_loop(self, stream, incoming_tx, token);
            let send = event_loop::send_loop(
                self,
                &mut sink,
                submit_rx,
                self.inner.shared_queue.clone(),
            );
            tokio::select! {
                r = recv => r,
                r = send => r,
                _ = token.cancelled() => Err(self.stop_reason(scope)),
            }
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error closing transport"),
            Err(_) => debug!("Timed out closing transport"),
        }
        result
    }

    fn stop_reason(&self, scope: &CancellationToken) -> Error {
        if scope.is_cancelled() {
            Error::Cancelled
        } else {
            Error::ConnectionClosed
        }
    }

    /// Close the connection. Idempotent and thread-safe; every call returns
    /// the result stored by the first.
    pub fn close(&self) -> Result<()> {
        self.inner
            .close_result
            .get_or_init(|| {
                self.inner.closed.cancel();
                if *self.inner.ready.borrow() {
                    self.inner.metrics.disconnected();
                }
                debug!(conn_id = self.inner.id, "Connection closed");
                Ok(())
            })
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until registration has been sent.
    pub async fn wait_until_ready(&self, scope: &CancellationToken) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        tokio::select! {
            r = ready.wait_for(|r| *r) => r.map(|_| ()).map_err(|_| Error::ConnectionClosed),
            _ = scope.cancelled() => Err(Error::Cancelled),
            _ = self.inner.closed.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// The stream of received messages. Closes when the receive loop ends.
    /// Only the first call gets the receiver.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.incoming_rx.lock().take()
    }

    pub async fn send_message(&self, scope: &CancellationToken, target: &str, body: &str) -> Result<()> {
        if self.inner.config.read_only {
            return Err(Error::ReadOnly);
        }
        self.submit(scope, Outgoing::privmsg(target, body)).await
    }

    /// Join every channel not already joined, with one combined `JOIN`.
    pub async fn join<I, S>(&self, scope: &CancellationToken, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added: Vec<String> = {
            let mut joined = self.inner.joined.write();
            normalize_all(channels)
                .into_iter()
                .filter(|ch| joined.insert(ch.clone()))
                .collect()
        };
        if added.is_empty() {
            return Ok(());
        }
        debug!(conn_id = self.inner.id, channels = ?added, "Joining");
        self.submit(scope, Outgoing(Message::join(&added))).await
    }

    /// Part every channel currently joined, with one combined `PART`.
    pub async fn part<I, S>(&self, scope: &CancellationToken, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<String> = {
            let mut joined = self.inner.joined.write();
            normalize_all(channels)
                .into_iter()
                .filter(|ch| joined.remove(ch))
                .collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        debug!(conn_id = self.inner.id, channels = ?removed, "Parting");
        self.submit(scope, Outgoing(Message::part(&removed))).await
    }

    /// Joined channels, sorted.
    pub fn joined(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.joined.read().iter().cloned().collect();
        out.sort();
        out
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.inner.joined.read().contains(&normalize_channel(channel))
    }

    pub fn num_joined(&self) -> usize {
        self.inner.joined.read().len()
    }

    pub async fn ping(&self, scope: &CancellationToken, target: &str) -> Result<()> {
        self.submit(scope, Outgoing(Message::ping(target))).await
    }

    pub async fn quit(&self, scope: &CancellationToken) -> Result<()> {
        self.submit(scope, Outgoing(Message::quit(None))).await
    }

    async fn submit(&self, scope: &CancellationToken, out: Outgoing) -> Result<()> {
        PendingCall::submit(
            out,
            scope,
            &self.inner.submit_tx,
            &self.inner.closed,
            Error::ConnectionClosed,
        )
        .await
    }
}

/// Converge loop failure and external close: whichever comes first, the
/// other follows. Both paths go through the same idempotent close.
async fn supervise(conn: Connection, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {
            let _ = conn.close();
        }
        _ = conn.inner.closed.cancelled() => token.cancel(),
    }
}
