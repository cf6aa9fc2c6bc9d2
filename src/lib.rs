//! chanpool - pooled chat-server connectivity for bots.
//!
//! A [`Connection`] is one authenticated session: it dials, registers,
//! answers keepalives and serializes every write through a single send
//! loop. A [`Pool`] presents many connections as one session, spreading
//! channels over them with a per-connection cap.
//!
//! Every operation takes a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! scope; ending the scope fails the operation with [`Error::Cancelled`]
//! without affecting the connection.

pub mod call;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dial;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod proto;
pub mod telemetry;

pub use channel::{PriorityRanking, normalize_channel};
pub use connection::{Connection, ConnectionConfig, SharedSendQueue};
pub use dial::{BoxedStream, DialFn, Dialer, TlsOptions};
pub use error::{Error, Result};
pub use metrics::{Metrics, NoopMetrics, PrometheusMetrics};
pub use pool::{Pool, PoolConfig};
pub use proto::Message;
