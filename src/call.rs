//! Request/response hand-off into single-owner loops.
//!
//! A caller wraps a payload in a [`PendingCall`], pushes it onto the owning
//! loop's queue and waits for exactly one completion. Both the hand-off and
//! the wait race the caller's cancellation scope and the owner's stop
//! token, so no caller can block forever.
//!
//! The completion slot is a capacity-one queue, which makes
//! [`Completer::finish`] non-blocking even when the caller has already
//! given up. Slots are recycled through a small process-wide free list once
//! their single value has been received; a slot whose waiter walked away is
//! simply dropped, so a late completion can never leak into another call.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::channel::{normalize_all, normalize_channel};
use crate::error::{Error, Result};
use crate::proto::Message;

/// Upper bound on recycled slots kept around.
const MAX_POOLED_SLOTS: usize = 1024;

static FREE_SLOTS: Mutex<Vec<Slot>> = parking_lot::const_mutex(Vec::new());
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation identifier carried through a call for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

struct Slot {
    tx: mpsc::Sender<Result<()>>,
    rx: mpsc::Receiver<Result<()>>,
}

impl Slot {
    fn acquire() -> Self {
        FREE_SLOTS.lock().pop().unwrap_or_else(|| {
            let (tx, rx) = mpsc::channel(1);
            Self { tx, rx }
        })
    }

    /// Return a drained slot to the free list.
    fn release(self) {
        let mut free = FREE_SLOTS.lock();
        if free.len() < MAX_POOLED_SLOTS {
            free.push(self);
        }
    }
}

/// The owning loop's handle for completing a call.
///
/// Delivers exactly one value: either the one passed to [`finish`](Self::finish),
/// or [`Error::CallDropped`] if the completer is dropped unfinished.
#[derive(Debug)]
pub struct Completer {
    id: CallId,
    tx: Option<mpsc::Sender<Result<()>>>,
}

impl Completer {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Deliver the outcome. Never blocks, and succeeds even if the waiter is gone.
    pub fn finish(mut self, result: Result<()>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: Result<()>) {
        if let Some(tx) = self.tx.take() {
            // Slot capacity is one and this is its only send.
            if tx.try_send(result).is_err() {
                trace!(call_id = %self.id, "completion discarded, waiter gone");
            }
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.deliver(Err(Error::CallDropped));
    }
}

/// A payload travelling to a single-owner loop, plus its completion handle.
#[derive(Debug)]
pub struct PendingCall<T> {
    pub payload: T,
    completer: Completer,
}

impl<T> PendingCall<T> {
    pub fn id(&self) -> CallId {
        self.completer.id
    }

    /// Split into payload and completer so the owner can move the payload out.
    pub fn into_parts(self) -> (T, Completer) {
        (self.payload, self.completer)
    }

    pub fn finish(self, result: Result<()>) {
        self.completer.finish(result);
    }

    /// Hand `payload` to `queue` and wait for its completion.
    ///
    /// Returns [`Error::Cancelled`] if `scope` ends first and `stop_err` if
    /// `stop` fires first or the queue is gone, both while submitting and
    /// while waiting. An already-ended scope wins over a ready queue.
    pub async fn submit(
        payload: T,
        scope: &CancellationToken,
        queue: &mpsc::Sender<PendingCall<T>>,
        stop: &CancellationToken,
        stop_err: Error,
    ) -> Result<()> {
        let mut slot = Slot::acquire();
        let id = CallId::next();
        let call = PendingCall {
            payload,
            completer: Completer {
                id,
                tx: Some(slot.tx.clone()),
            },
        };

        tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(Error::Cancelled),
            _ = stop.cancelled() => return Err(stop_err),
            sent = queue.send(call) => {
                if sent.is_err() {
                    return Err(stop_err);
                }
            }
        }
        trace!(call_id = %id, "call accepted");

        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(Error::Cancelled),
            _ = stop.cancelled() => return Err(stop_err),
            done = slot.rx.recv() => done,
        };

        match result {
            Some(result) => {
                slot.release();
                result
            }
            // `slot.tx` keeps the channel open.
            None => Err(stop_err),
        }
    }
}

/// One outbound line for a send loop.
#[derive(Debug, Clone)]
pub struct Outgoing(pub Message);

impl Outgoing {
    /// `PRIVMSG` with a normalized channel target.
    pub fn privmsg(target: &str, body: &str) -> Self {
        Self(Message::privmsg(&normalize_channel(target), body))
    }
}

/// Join or part a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPart {
    pub channel: String,
    pub join: bool,
}

impl JoinPart {
    pub fn join(channel: &str) -> Self {
        Self {
            channel: normalize_channel(channel),
            join: true,
        }
    }

    pub fn part(channel: &str) -> Self {
        Self {
            channel: normalize_channel(channel),
            join: false,
        }
    }
}

/// The full set of channels the caller wants joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJoined {
    pub channels: Vec<String>,
}

impl SyncJoined {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            channels: normalize_all(channels),
        }
    }
}

pub type SendCall = PendingCall<Outgoing>;
pub type JoinPartCall = PendingCall<JoinPart>;
pub type SyncJoinedCall = PendingCall<SyncJoined>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_and_finish() {
        let (tx, mut rx) = mpsc::channel::<PendingCall<u32>>(1);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();

        let owner = tokio::spawn(async move {
            let call = rx.recv().await.unwrap();
            assert_eq!(call.payload, 7);
            call.finish(Ok(()));
        });

        PendingCall::submit(7, &scope, &tx, &stop, Error::PoolStopped)
            .await
            .unwrap();
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_is_delivered() {
        let (tx, mut rx) = mpsc::channel::<PendingCall<()>>(1);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();

        tokio::spawn(async move {
            let call = rx.recv().await.unwrap();
            call.finish(Err(Error::ReadOnly));
        });

        let err = PendingCall::submit((), &scope, &tx, &stop, Error::PoolStopped)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[tokio::test]
    async fn test_stop_while_submitting() {
        // Nobody reads, and the queue is full.
        let (tx, _rx) = mpsc::channel::<PendingCall<()>>(1);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();
        let filler = tokio::spawn({
            let (tx, scope, stop) = (tx.clone(), scope.clone(), stop.clone());
            async move { PendingCall::submit((), &scope, &tx, &stop, Error::PoolStopped).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.cancel();
        let err = PendingCall::submit((), &scope, &tx, &stop, Error::PoolStopped)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolStopped));
        assert!(matches!(filler.await.unwrap(), Err(Error::PoolStopped)));
    }

    #[tokio::test]
    async fn test_closed_queue_returns_stop_err() {
        let (tx, rx) = mpsc::channel::<PendingCall<()>>(1);
        drop(rx);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();
        let err = PendingCall::submit((), &scope, &tx, &stop, Error::ConnectionClosed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_abandoned_call_finishes_harmlessly() {
        let (tx, mut rx) = mpsc::channel::<PendingCall<&'static str>>(4);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();

        let waiter = tokio::spawn({
            let (tx, scope, stop) = (tx.clone(), scope.clone(), stop.clone());
            async move { PendingCall::submit("hello", &scope, &tx, &stop, Error::PoolStopped).await }
        });

        // Accepted by the owner, then the caller gives up.
        let call = rx.recv().await.unwrap();
        scope.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));

        // The owner completes later; this must neither block nor panic.
        tokio::time::timeout(Duration::from_secs(1), async move { call.finish(Ok(())) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_call_reports_call_dropped() {
        let (tx, mut rx) = mpsc::channel::<PendingCall<()>>(1);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();

        tokio::spawn(async move {
            let call = rx.recv().await.unwrap();
            drop(call);
        });

        let err = PendingCall::submit((), &scope, &tx, &stop, Error::PoolStopped)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallDropped));
    }

    #[tokio::test]
    async fn test_slots_are_reused_cleanly() {
        let (tx, mut rx) = mpsc::channel::<PendingCall<usize>>(8);
        let scope = CancellationToken::new();
        let stop = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let result = if call.payload % 2 == 0 {
                    Ok(())
                } else {
                    Err(Error::ReadOnly)
                };
                call.finish(result);
            }
        });

        for i in 0..100usize {
            let result = PendingCall::submit(i, &scope, &tx, &stop, Error::PoolStopped).await;
            assert_eq!(result.is_ok(), i % 2 == 0, "call {i}");
        }
    }

    #[test]
    fn test_payloads_normalize() {
        assert_eq!(JoinPart::join("FooBar").channel, "#foobar");
        assert!(!JoinPart::part("#X").join);
        assert_eq!(SyncJoined::new(["B", "#a", "b"]).channels, vec!["#b", "#a"]);
        assert_eq!(
            Outgoing::privmsg("Chan", "hi").0.to_string(),
            "PRIVMSG #chan hi"
        );
    }
}
