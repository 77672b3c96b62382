// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rendezvous matcher: pairs waiting pushes with agent call-backs.
//!
//! A push registers a waiter under an opaque token before the worker
//! ever learns that token; when the agent dials `/conn/{token}`, the
//! upgraded connection arrives here as an inbound event. One task owns
//! the token map and serializes all registrations, cancellations and
//! arrivals, so each inbound connection is delivered to at most one
//! waiter and each waiter sees at most one connection. No mutex, no
//! shared map.
//!
//! Waiter lifecycle:
//!
//! ```text
//! NEW → REGISTERED --inbound--> DELIVERED (terminal)
//!                  --cancel---> CANCELLED (terminal)
//!                  --timeout--> CANCELLED (via drop guard)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Byte stream to a build agent, as delivered by the transport layer.
pub type AgentStream = Box<dyn AgentIo>;

/// Object-safe bound for agent connections.
pub trait AgentIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentIo for T {}

enum Event {
    Register {
        id: String,
        delivery: oneshot::Sender<AgentStream>,
    },
    Cancel {
        id: String,
    },
    Inbound {
        id: String,
        conn: AgentStream,
    },
    Pending {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle for posting events to the matcher task.
#[derive(Clone)]
pub struct MatcherHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MatcherHandle {
    /// Register a waiter under `id`. The returned guard cancels the
    /// registration when dropped.
    pub fn register(&self, id: String) -> Waiter {
        let (delivery_tx, delivery_rx) = oneshot::channel();
        let _ = self.tx.send(Event::Register {
            id: id.clone(),
            delivery: delivery_tx,
        });
        Waiter {
            id,
            delivery: Some(delivery_rx),
            handle: self.clone(),
        }
    }

    /// Hand an inbound agent connection to the matcher. Connections
    /// with no registered waiter are closed.
    pub fn inbound(&self, id: String, conn: AgentStream) {
        let _ = self.tx.send(Event::Inbound { id, conn });
    }

    fn cancel(&self, id: String) {
        let _ = self.tx.send(Event::Cancel { id });
    }

    /// Number of currently registered waiters.
    pub async fn pending(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Event::Pending { reply: reply_tx }).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

/// A registered waiter. Dropping it cancels the registration; the
/// cancel is idempotent, so dropping after delivery is harmless.
pub struct Waiter {
    id: String,
    delivery: Option<oneshot::Receiver<AgentStream>>,
    handle: MatcherHandle,
}

/// Why a waiter did not receive a connection.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// No agent called back within the allotted time.
    #[error("timed out waiting for agent")]
    Timeout,

    /// The matcher task is gone (controller shutting down).
    #[error("matcher unavailable")]
    Closed,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the agent connection.
    ///
    /// The drop guard fires afterwards either way; cancelling an
    /// already-delivered id is a no-op in the matcher.
    pub async fn wait(mut self, timeout: Duration) -> Result<AgentStream, WaitError> {
        let Some(delivery) = self.delivery.take() else {
            return Err(WaitError::Closed);
        };
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.handle.cancel(self.id.clone());
    }
}

/// Spawn the matcher task and return a handle to it.
pub fn spawn() -> MatcherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx));
    MatcherHandle { tx }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut waiting: HashMap<String, oneshot::Sender<AgentStream>> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            Event::Register { id, delivery } => {
                debug!(id = %id, "waiter registered");
                if let Some(evicted) = waiting.insert(id.clone(), delivery) {
                    // Ids carry 160 bits of entropy; a collision means
                    // something upstream is broken.
                    warn!(id = %id, "waiter id collision, evicting previous waiter");
                    drop(evicted);
                }
            }
            Event::Cancel { id } => {
                if waiting.remove(&id).is_some() {
                    debug!(id = %id, "waiter cancelled");
                }
            }
            Event::Inbound { id, conn } => match waiting.remove(&id) {
                Some(delivery) => {
                    info!(id = %id, "agent connection delivered");
                    if delivery.send(conn).is_err() {
                        // Waiter gave up between removal and delivery;
                        // the connection drops closed here.
                        debug!(id = %id, "waiter gone, closing connection");
                    }
                }
                None => {
                    warn!(id = %id, "inbound connection with no waiter, closing");
                    drop(conn);
                }
            },
            Event::Pending { reply } => {
                let _ = reply.send(waiting.len());
            }
        }
    }
}

/// Generate a fresh waiter token: 160 bits of entropy, hex-encoded.
pub fn waiter_token() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn stream() -> AgentStream {
        let (a, _b) = duplex(64);
        Box::new(a)
    }

    #[tokio::test]
    async fn token_shape() {
        let token = waiter_token();
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, waiter_token());
    }

    #[tokio::test]
    async fn inbound_delivers_to_waiter() {
        let matcher = spawn();
        let waiter = matcher.register("abc".to_string());
        matcher.inbound("abc".to_string(), stream());

        let conn = waiter.wait(Duration::from_secs(1)).await;
        assert!(conn.is_ok());
        assert_eq!(matcher.pending().await, 0);
    }

    #[tokio::test]
    async fn orphan_inbound_is_closed() {
        let matcher = spawn();
        let (a, mut b) = duplex(64);
        matcher.inbound("nobody".to_string(), Box::new(a));

        // The matcher drops the connection; the peer sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn timeout_cancels_registration() {
        let matcher = spawn();
        let waiter = matcher.register("late".to_string());

        let result = waiter.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(WaitError::Timeout)));

        // The drop guard has cancelled the registration; a late
        // inbound for the same id is now an orphan.
        tokio::task::yield_now().await;
        assert_eq!(matcher.pending().await, 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let matcher = spawn();
        let waiter = matcher.register("x".to_string());
        matcher.cancel("x".to_string());
        matcher.cancel("x".to_string());
        drop(waiter);
        assert_eq!(matcher.pending().await, 0);
    }

    #[tokio::test]
    async fn collision_evicts_previous_waiter() {
        let matcher = spawn();
        let first = matcher.register("dup".to_string());
        let second = matcher.register("dup".to_string());
        matcher.inbound("dup".to_string(), stream());

        // The first waiter was abandoned; the second gets the
        // connection.
        assert!(matches!(
            first.wait(Duration::from_millis(50)).await,
            Err(WaitError::Closed)
        ));
        assert!(second.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn register_precedes_inbound_ordering() {
        // Events are processed in posting order: a register posted
        // before an inbound for the same id always wins.
        let matcher = spawn();
        for i in 0..100 {
            let id = format!("id-{i}");
            let waiter = matcher.register(id.clone());
            matcher.inbound(id, stream());
            assert!(waiter.wait(Duration::from_secs(1)).await.is_ok());
        }
        assert_eq!(matcher.pending().await, 0);
    }
}
