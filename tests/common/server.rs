//! In-process chat server for integration testing.
//!
//! Accepts any number of clients on an ephemeral port, records every line
//! they send tagged with the client's accept index, and lets tests push
//! lines to or drop a given client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chanpool::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{Instant, timeout};

/// Something a client did.
#[derive(Debug, Clone)]
pub enum Event {
    /// `at` is when the server read the line.
    Line { conn: usize, msg: Message, at: Instant },
    Closed { conn: usize },
}

#[derive(Default)]
struct Clients {
    writers: HashMap<usize, OwnedWriteHalf>,
    readers: HashMap<usize, AbortHandle>,
    accepted: usize,
}

/// A scripted test server.
pub struct MockServer {
    addr: String,
    clients: Arc<Mutex<Clients>>,
    events: mpsc::UnboundedReceiver<Event>,
    accept: AbortHandle,
}

impl MockServer {
    /// Bind to an ephemeral local port and start accepting.
    pub async fn spawn() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let clients = Arc::new(Mutex::new(Clients::default()));
        let (tx, events) = mpsc::unbounded_channel();

        let accept = tokio::spawn({
            let clients = clients.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (read, write) = stream.into_split();
                    let mut guard = clients.lock().await;
                    let conn = guard.accepted;
                    guard.accepted += 1;

                    guard.writers.insert(conn, write);

                    let tx = tx.clone();
                    let reader = tokio::spawn(async move {
                        let mut lines = BufReader::new(read).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            match line.parse::<Message>() {
                                Ok(msg) => {
                                    let at = Instant::now();
                                    let _ = tx.send(Event::Line { conn, msg, at });
                                }
                                Err(e) => eprintln!("client sent unparsable line {line:?}: {e}"),
                            }
                        }
                        let _ = tx.send(Event::Closed { conn });
                    });

                    guard.readers.insert(conn, reader.abort_handle());
                }
            }
        })
        .abort_handle();

        Ok(Self {
            addr,
            clients,
            events,
            accept,
        })
    }

    pub fn address(&self) -> String {
        self.addr.clone()
    }

    /// Number of clients accepted so far.
    #[allow(dead_code)]
    pub async fn accepted(&self) -> usize {
        self.clients.lock().await.accepted
    }

    /// Write one line to client `conn`.
    pub async fn send_to(&self, conn: usize, line: &str) -> anyhow::Result<()> {
        self.send_raw(conn, format!("{line}\r\n").as_bytes()).await
    }

    /// Write `bytes` to client `conn` as-is, without a line ending.
    pub async fn send_raw(&self, conn: usize, bytes: &[u8]) -> anyhow::Result<()> {
        let mut clients = self.clients.lock().await;
        let writer = clients
            .writers
            .get_mut(&conn)
            .ok_or_else(|| anyhow::anyhow!("no client {conn}"))?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Drop client `conn`'s socket.
    pub async fn kill(&self, conn: usize) {
        let mut clients = self.clients.lock().await;
        if let Some(mut writer) = clients.writers.remove(&conn) {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = clients.readers.remove(&conn) {
            reader.abort();
        }
    }

    /// Next event, within 5 seconds.
    pub async fn next_event(&mut self) -> anyhow::Result<Event> {
        timeout(Duration::from_secs(5), self.events.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("server event stream closed"))
    }

    /// Skip events until a line matches `pred`; returns the client index and message.
    pub async fn expect_line<F>(&mut self, pred: F) -> anyhow::Result<(usize, Message)>
    where
        F: FnMut(usize, &Message) -> bool,
    {
        let (conn, msg, _) = self.expect_line_at(pred).await?;
        Ok((conn, msg))
    }

    /// Like [`expect_line`](Self::expect_line), also returning when the line arrived.
    pub async fn expect_line_at<F>(
        &mut self,
        mut pred: F,
    ) -> anyhow::Result<(usize, Message, Instant)>
    where
        F: FnMut(usize, &Message) -> bool,
    {
        loop {
            if let Event::Line { conn, msg, at } = self.next_event().await?
                && pred(conn, &msg)
            {
                return Ok((conn, msg, at));
            }
        }
    }

    /// Arrival times of the next `count` lines with `command`.
    #[allow(dead_code)]
    pub async fn command_times(
        &mut self,
        command: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Instant>> {
        let mut times = Vec::with_capacity(count);
        while times.len() < count {
            let (_, _, at) = self.expect_line_at(|_, msg| msg.is(command)).await?;
            times.push(at);
        }
        Ok(times)
    }

    /// Skip events until a line with `command` whose first parameter is `param`.
    pub async fn expect_command(&mut self, command: &str, param: &str) -> anyhow::Result<usize> {
        let (conn, _) = self
            .expect_line(|_, msg| msg.is(command) && msg.param(0) == Some(param))
            .await?;
        Ok(conn)
    }

    /// Next line from any client, skipping close events.
    pub async fn next_line(&mut self) -> anyhow::Result<(usize, Message)> {
        self.expect_line(|_, _| true).await
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        if let Ok(clients) = self.clients.try_lock() {
            for reader in clients.readers.values() {
                reader.abort();
            }
        }
    }
}
