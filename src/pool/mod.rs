//! Many connections presented as one logical session.
//!
//! The pool spreads channel memberships over as many sub-connections as
//! needed, each holding at most `max_channels_per_subconn` channels. Joins
//! are rate limited, channels owned by a sub-connection that dies are
//! migrated to another one, and idle sub-connections are pruned.
//!
//! A single manager loop owns the sub-connection set and the channel
//! ownership map; everything else only reads them under a lock. Callers
//! reach the manager through [`PendingCall`]s and always learn whether
//! their own call succeeded.
//!
//! Outbound chat lines go through one pool-wide queue that every
//! sub-connection's send loop competes to drain, so [`Pool::send_message`]
//! works no matter which sub-connection owns the target. Ordering is FIFO
//! per sub-connection only.

mod manager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info, warn};

use crate::call::{
    JoinPart, JoinPartCall, Outgoing, PendingCall, SendCall, SyncJoined, SyncJoinedCall,
};
use crate::channel::{PriorityRanking, normalize_all, normalize_channel};
use crate::connection::{Connection, ConnectionConfig, SharedSendQueue};
use crate::dial::Dialer;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::proto::Message;
use crate::telemetry::spans;

use manager::Manager;

const CALL_QUEUE_CAPACITY: usize = 64;
const SEND_QUEUE_CAPACITY: usize = 256;
const INCOMING_CAPACITY: usize = 4096;

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Identity shared by every sub-connection. Its `initial_channels` are
    /// ignored; use [`PoolConfig::initial_channels`].
    pub connection: ConnectionConfig,
    pub max_channels_per_subconn: usize,
    /// Minimum delay between joins. Zero disables.
    pub join_rate: Duration,
    /// Period of automatic pruning. Zero disables.
    pub prune_interval: Duration,
    /// Joined ahead of everything but the bot's own channel, in this order.
    pub priority_channels: Vec<String>,
    /// Joined in the background once the pool runs.
    pub initial_channels: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_channels_per_subconn: 50,
            join_rate: Duration::ZERO,
            prune_interval: Duration::ZERO,
            priority_channels: Vec::new(),
            initial_channels: Vec::new(),
        }
    }
}

/// Cheap-to-clone handle to a pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    dialer: Dialer,
    metrics: Arc<dyn Metrics>,
    ranking: PriorityRanking,
    state: RwLock<State>,
    join_part_tx: mpsc::Sender<JoinPartCall>,
    sync_tx: mpsc::Sender<SyncJoinedCall>,
    prune_tx: mpsc::Sender<()>,
    send_tx: mpsc::Sender<SendCall>,
    send_queue: SharedSendQueue,
    queues: Mutex<Option<ManagerQueues>>,
    incoming_tx: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    stop: CancellationToken,
    ready: watch::Sender<bool>,
}

/// Written only by the manager loop.
#[derive(Default)]
struct State {
    conns: HashMap<u64, Connection>,
    /// Channel -> id of the sub-connection serving it.
    owners: HashMap<String, u64>,
}

struct ManagerQueues {
    join_part: mpsc::Receiver<JoinPartCall>,
    sync: mpsc::Receiver<SyncJoinedCall>,
    prune: mpsc::Receiver<()>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("nick", &self.inner.config.connection.nick)
            .field("conns", &self.num_conns())
            .field("joined", &self.num_joined())
            .finish()
    }
}

impl Pool {
    pub fn new(mut config: PoolConfig, dialer: Dialer, metrics: Arc<dyn Metrics>) -> Self {
        config.max_channels_per_subconn = config.max_channels_per_subconn.max(1);
        config.connection.initial_channels.clear();

        let ranking = PriorityRanking::new(&config.connection.nick, &config.priority_channels);
        let (join_part_tx, join_part) = mpsc::channel(CALL_QUEUE_CAPACITY);
        let (sync_tx, sync) = mpsc::channel(CALL_QUEUE_CAPACITY);
        let (prune_tx, prune) = mpsc::channel(1);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                metrics,
                ranking,
                state: RwLock::new(State::default()),
                join_part_tx,
                sync_tx,
                prune_tx,
                send_tx,
                send_queue: Arc::new(tokio::sync::Mutex::new(send_rx)),
                queues: Mutex::new(Some(ManagerQueues {
                    join_part,
                    sync,
                    prune,
                })),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                stop: CancellationToken::new(),
                ready: watch::Sender::new(false),
            }),
        }
    }

    /// Run the manager loop and the initial join until [`stop`](Self::stop)
    /// or `scope` ends. Always returns an error: [`Error::PoolStopped`] or
    /// [`Error::Cancelled`]. On return every sub-connection has ended and the
    /// incoming stream is closed. A pool runs at most once.
    pub async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let span = spans::pool(&self.inner.config.connection.nick);
        self.run_inner(scope).instrument(span).await
    }

    async fn run_inner(&self, scope: &CancellationToken) -> Result<()> {
        let queues = self.inner.queues.lock().take();
        let incoming_tx = self.inner.incoming_tx.lock().take();
        let (Some(queues), Some(incoming_tx)) = (queues, incoming_tx) else {
            return Err(Error::PoolStopped);
        };

        let scope = scope.child_token();
        let tracker = TaskTracker::new();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let manager = Manager::new(self.clone(), scope.clone(), tracker.clone(), incoming_tx, exit_tx);

        let initial = self.inner.config.initial_channels.clone();
        if !initial.is_empty() {
            let pool = self.clone();
            let scope = scope.clone();
            tracker.spawn(async move {
                if let Err(e) = pool.wait_until_ready(&scope).await {
                    warn!(error = %e, "Pool never became ready for initial join");
                    return;
                }
                match pool.join(&scope, &initial).await {
                    Ok(()) => info!(channels = initial.len(), "Initial channels joined"),
                    Err(e) => warn!(error = %e, "Initial channel join failed"),
                }
            });
        }

        // Stop fires before the manager future is dropped, so callers still
        // waiting on it see `PoolStopped` rather than a dropped call.
        let result = tokio::select! {
            _ = manager.run(queues, exit_rx) => Err(Error::PoolStopped),
            _ = self.inner.stop.cancelled() => Err(Error::PoolStopped),
            _ = async {
                scope.cancelled().await;
                self.inner.stop.cancel();
            } => Err(Error::Cancelled),
        };

        self.inner.stop.cancel();
        self.inner.ready.send_replace(false);
        scope.cancel();
        drop(manager);
        tracker.close();
        tracker.wait().await;

        {
            let mut state = self.inner.state.write();
            for conn in state.conns.values() {
                let _ = conn.close();
            }
            state.conns.clear();
            state.owners.clear();
        }
        self.inner.metrics.set_subconns(0);
        info!("Pool stopped");
        result
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Wait until the manager loop accepts work.
    pub async fn wait_until_ready(&self, scope: &CancellationToken) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        tokio::select! {
            r = ready.wait_for(|r| *r) => r.map(|_| ()).map_err(|_| Error::PoolStopped),
            _ = scope.cancelled() => Err(Error::Cancelled),
            _ = self.inner.stop.cancelled() => Err(Error::PoolStopped),
        }
    }

    /// Join channels one at a time in priority order. Stops at the first
    /// failure; channels before it stay joined.
    pub async fn join<I, S>(&self, scope: &CancellationToken, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for channel in self.sorted(channels) {
            self.join_part(scope, JoinPart::join(&channel)).await?;
        }
        Ok(())
    }

    /// Part channels one at a time in priority order. Stops at the first failure.
    pub async fn part<I, S>(&self, scope: &CancellationToken, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for channel in self.sorted(channels) {
            self.join_part(scope, JoinPart::part(&channel)).await?;
        }
        Ok(())
    }

    /// Make the joined set equal `channels`: part the unwanted ones first,
    /// then join the missing ones. Aborts on the first failing step.
    pub async fn sync_joined<I, S>(&self, scope: &CancellationToken, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        PendingCall::submit(
            SyncJoined::new(channels),
            scope,
            &self.inner.sync_tx,
            &self.inner.stop,
            Error::PoolStopped,
        )
        .await
    }

    /// Queue a `PRIVMSG` on whichever sub-connection is free first.
    pub async fn send_message(&self, scope: &CancellationToken, target: &str, body: &str) -> Result<()> {
        if self.inner.config.connection.read_only {
            return Err(Error::ReadOnly);
        }
        PendingCall::submit(
            Outgoing::privmsg(target, body),
            scope,
            &self.inner.send_tx,
            &self.inner.stop,
            Error::PoolStopped,
        )
        .await
    }

    /// Ask the manager to prune idle sub-connections now. Dropped if a
    /// request is already pending.
    pub fn prune(&self) {
        let _ = self.inner.prune_tx.try_send(());
    }

    /// Joined channels across all sub-connections, sorted.
    pub fn joined(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.state.read().owners.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.inner
            .state
            .read()
            .owners
            .contains_key(&normalize_channel(channel))
    }

    pub fn num_joined(&self) -> usize {
        self.inner.state.read().owners.len()
    }

    /// Live sub-connections.
    pub fn num_conns(&self) -> usize {
        self.inner.state.read().conns.len()
    }

    /// Messages received by every sub-connection. Only the first call gets
    /// the receiver; it closes when [`run`](Self::run) returns.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.incoming_rx.lock().take()
    }

    fn sorted<I, S>(&self, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut channels = normalize_all(channels);
        self.inner.ranking.sort(&mut channels);
        channels
    }

    async fn join_part(&self, scope: &CancellationToken, payload: JoinPart) -> Result<()> {
        PendingCall::submit(
            payload,
            scope,
            &self.inner.join_part_tx,
            &self.inner.stop,
            Error::PoolStopped,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn pool(config: PoolConfig) -> Pool {
        Pool::new(config, Dialer::new("127.0.0.1:1"), Arc::new(NoopMetrics))
    }

    #[test]
    fn test_sorted_uses_priority() {
        let p = pool(PoolConfig {
            connection: ConnectionConfig {
                nick: "Bot".into(),
                ..Default::default()
            },
            priority_channels: vec!["vip".into()],
            ..Default::default()
        });
        assert_eq!(
            p.sorted(["#zzz", "#aaa", "VIP", "#bot", "#aaa"]),
            vec!["#bot", "#vip", "#aaa", "#zzz"]
        );
    }

    #[tokio::test]
    async fn test_calls_after_stop() {
        let p = pool(PoolConfig::default());
        p.stop();
        p.stop();
        let scope = CancellationToken::new();
        assert!(matches!(p.join(&scope, ["#a"]).await, Err(Error::PoolStopped)));
        assert!(matches!(
            p.sync_joined(&scope, ["#a"]).await,
            Err(Error::PoolStopped)
        ));
        assert!(matches!(
            p.wait_until_ready(&scope).await,
            Err(Error::PoolStopped)
        ));
        assert!(matches!(p.run(&scope).await, Err(Error::PoolStopped)));
        assert!(matches!(p.run(&scope).await, Err(Error::PoolStopped)));
    }

    #[tokio::test]
    async fn test_read_only_send() {
        let p = pool(PoolConfig {
            connection: ConnectionConfig {
                nick: "justinfan1".into(),
                read_only: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let scope = CancellationToken::new();
        assert!(matches!(
            p.send_message(&scope, "#a", "hi").await,
            Err(Error::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_scope_ends_run_and_closes_incoming() {
        let p = pool(PoolConfig::default());
        let mut incoming = p.take_incoming().unwrap();
        let scope = CancellationToken::new();
        let handle = tokio::spawn({
            let p = p.clone();
            let scope = scope.clone();
            async move { p.run(&scope).await }
        });

        p.wait_until_ready(&scope).await.unwrap();
        scope.cancel();
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
        assert!(incoming.recv().await.is_none());
        assert_eq!(p.num_conns(), 0);
    }

    #[test]
    fn test_empty_pool_prune_does_not_block() {
        let p = pool(PoolConfig::default());
        p.prune();
        p.prune();
        p.prune();
    }
}
