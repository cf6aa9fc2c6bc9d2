//! The pool's single writer: placement, parting, sync, pruning and
//! recovery from dead sub-connections.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ManagerQueues, Pool};
use crate::call::{JoinPart, JoinPartCall, SyncJoined, SyncJoinedCall};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::proto::Message;

pub(super) struct Manager {
    pool: Pool,
    /// Pool-lifetime scope. Sub-connections run under children of it.
    scope: CancellationToken,
    tracker: TaskTracker,
    incoming_tx: mpsc::Sender<Message>,
    exit_tx: mpsc::UnboundedSender<u64>,
}

impl Manager {
    pub(super) fn new(
        pool: Pool,
        scope: CancellationToken,
        tracker: TaskTracker,
        incoming_tx: mpsc::Sender<Message>,
        exit_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            pool,
            scope,
            tracker,
            incoming_tx,
            exit_tx,
        }
    }

    pub(super) async fn run(&self, mut queues: ManagerQueues, mut exits: mpsc::UnboundedReceiver<u64>) {
        self.spawn_conn();
        self.pool.inner.ready.send_replace(true);
        info!("Pool manager ready");

        let mut prune_timer = prune_timer(self.pool.inner.config.prune_interval);

        loop {
            tokio::select! {
                Some(call) = queues.join_part.recv() => self.handle_join_part(call).await,
                Some(call) = queues.sync.recv() => self.handle_sync(call).await,
                Some(id) = exits.recv() => self.handle_exit(id),
                Some(()) = queues.prune.recv() => self.prune(),
                _ = tick(&mut prune_timer) => self.prune(),
                else => break,
            }
        }
    }

    async fn handle_join_part(&self, call: JoinPartCall) {
        let (JoinPart { channel, join }, completer) = call.into_parts();
        let result = if channel.is_empty() {
            Ok(())
        } else if join {
            self.place(&channel).await
        } else {
            self.remove(&channel).await
        };
        if let Err(e) = &result {
            warn!(channel = %channel, join, error = %e, "Channel change failed");
        }
        completer.finish(result);
    }

    async fn handle_sync(&self, call: SyncJoinedCall) {
        let (SyncJoined { channels }, completer) = call.into_parts();

        let (mut to_part, mut to_join) = {
            let state = self.pool.inner.state.read();
            let wanted: HashSet<&String> = channels.iter().collect();
            let to_part: Vec<String> = state
                .owners
                .keys()
                .filter(|ch| !wanted.contains(ch))
                .cloned()
                .collect();
            let to_join: Vec<String> = channels
                .iter()
                .filter(|ch| !state.owners.contains_key(*ch))
                .cloned()
                .collect();
            (to_part, to_join)
        };
        to_part.sort();
        self.pool.inner.ranking.sort(&mut to_join);
        debug!(part = to_part.len(), join = to_join.len(), "Syncing joined channels");

        let result = async {
            for channel in &to_part {
                self.remove(channel).await?;
            }
            for channel in &to_join {
                self.place(channel).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = &result {
            warn!(error = %e, "Channel sync aborted");
        }
        completer.finish(result);
    }

    /// Join `channel` on a sub-connection with room for it, spawning one if
    /// none has. Ownership is recorded only after the join succeeds.
    async fn place(&self, channel: &str) -> Result<()> {
        if self.pool.inner.state.read().owners.contains_key(channel) {
            return Ok(());
        }

        let conn = match self.find_free() {
            Some(conn) => conn,
            None => self.spawn_conn(),
        };
        conn.wait_until_ready(&self.scope).await?;
        conn.join(&self.scope, [channel]).await?;

        self.pool
            .inner
            .state
            .write()
            .owners
            .insert(channel.to_owned(), conn.id());
        info!(channel, conn_id = conn.id(), "Joined channel");

        self.throttle().await;
        Ok(())
    }

    async fn remove(&self, channel: &str) -> Result<()> {
        let owner = {
            let mut state = self.pool.inner.state.write();
            let Some(id) = state.owners.get(channel).copied() else {
                return Ok(());
            };
            match state.conns.get(&id) {
                Some(conn) => conn.clone(),
                None => {
                    state.owners.remove(channel);
                    return Ok(());
                }
            }
        };

        owner.part(&self.scope, [channel]).await?;
        self.pool.inner.state.write().owners.remove(channel);
        info!(channel, conn_id = owner.id(), "Parted channel");
        Ok(())
    }

    fn find_free(&self) -> Option<Connection> {
        let cap = self.pool.inner.config.max_channels_per_subconn;
        self.pool
            .inner
            .state
            .read()
            .conns
            .values()
            .find(|conn| !conn.is_closed() && conn.num_joined() < cap)
            .cloned()
    }

    async fn throttle(&self) {
        let rate = self.pool.inner.config.join_rate;
        if rate.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(rate) => {}
            _ = self.scope.cancelled() => {}
        }
    }

    /// Start a sub-connection with its run task and incoming forwarder.
    fn spawn_conn(&self) -> Connection {
        let inner = &self.pool.inner;
        let config = ConnectionConfig {
            initial_channels: Vec::new(),
            ..inner.config.connection.clone()
        };
        let conn = Connection::with_send_queue(
            config,
            inner.dialer.clone(),
            inner.metrics.clone(),
            inner.send_queue.clone(),
        );
        let conn_scope = self.scope.child_token();

        {
            let mut state = inner.state.write();
            state.conns.insert(conn.id(), conn.clone());
            inner.metrics.set_subconns(state.conns.len());
        }

        if let Some(rx) = conn.take_incoming() {
            self.tracker
                .spawn(forward(rx, self.incoming_tx.clone(), conn_scope.clone()));
        }

        let exit_tx = self.exit_tx.clone();
        let pool_scope = self.scope.clone();
        let task_conn = conn.clone();
        self.tracker.spawn(async move {
            let result = task_conn.run(&conn_scope).await;
            if pool_scope.is_cancelled() {
                return;
            }
            if let Err(e) = result {
                debug!(conn_id = task_conn.id(), error = %e, "Sub-connection exited");
            }
            let _ = exit_tx.send(task_conn.id());
        });

        info!(conn_id = conn.id(), "Spawned sub-connection");
        conn
    }

    /// Forget a sub-connection that ended on its own and move its channels
    /// elsewhere.
    fn handle_exit(&self, id: u64) {
        let orphans: Vec<String> = {
            let mut state = self.pool.inner.state.write();
            if state.conns.remove(&id).is_none() {
                return;
            }
            self.pool.inner.metrics.set_subconns(state.conns.len());
            let orphans: Vec<String> = state
                .owners
                .iter()
                .filter(|(_, owner)| **owner == id)
                .map(|(channel, _)| channel.clone())
                .collect();
            for channel in &orphans {
                state.owners.remove(channel);
            }
            orphans
        };

        if orphans.is_empty() {
            info!(conn_id = id, "Idle sub-connection lost");
            return;
        }
        warn!(
            conn_id = id,
            channels = orphans.len(),
            "Sub-connection lost, migrating its channels"
        );

        let pool = self.pool.clone();
        let scope = self.scope.clone();
        self.tracker.spawn(async move {
            if let Err(e) = pool.join(&scope, &orphans).await {
                warn!(error = %e, "Failed to rejoin migrated channels");
            }
        });
    }

    /// Close sub-connections with no channels, keeping one if all are idle.
    fn prune(&self) {
        let victims: Vec<Connection> = {
            let mut state = self.pool.inner.state.write();
            let mut idle: Vec<u64> = state
                .conns
                .iter()
                .filter(|(_, conn)| conn.num_joined() == 0)
                .map(|(id, _)| *id)
                .collect();
            if idle.len() == state.conns.len() {
                idle.pop();
            }
            let victims = idle
                .iter()
                .filter_map(|id| state.conns.remove(id))
                .collect();
            self.pool.inner.metrics.set_subconns(state.conns.len());
            victims
        };

        for conn in victims {
            info!(conn_id = conn.id(), "Pruning idle sub-connection");
            let _ = conn.close();
        }
    }
}

/// Relay one sub-connection's messages into the pool stream until either
/// side closes or the scope ends.
async fn forward(
    mut rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Message>,
    scope: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            _ = scope.cancelled() => None,
        };
        let Some(msg) = msg else { break };
        tokio::select! {
            sent = tx.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = scope.cancelled() => break,
        }
    }
}

fn prune_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
