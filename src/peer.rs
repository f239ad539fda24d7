//! Per-peer transport adapter.
//!
//! A [`PeerState`] is the node-side handle for one authenticated remote peer:
//! a bounded outbound queue with back-pressure, an inbound queue drained by
//! the node's dispatch loop, and a liveness flag. The transport holds the
//! other ends of both queues ([`PeerTransport`]); tests hold the same ends,
//! so mocks and production peers are indistinguishable to the engine.

use std::fmt::{self, Display};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::wire::Message;

/// Identifier of a remote peer, assigned by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// A peer we load from and push updates to.
    Server,
    /// A peer that loads from us.
    Client,
    /// A storage daemon reached over the peer protocol.
    Storage,
}

/// Error returned when a push raced with peer closure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer {0} is closed")]
pub struct PeerClosed(pub PeerId);

/// The transport-side ends of a peer's queues.
#[derive(Debug)]
pub struct PeerTransport {
    /// Messages the local node sends to the remote peer.
    pub outgoing: mpsc::Receiver<Message>,
    /// Inject messages arriving from the remote peer.
    pub incoming: mpsc::Sender<Message>,
}

/// Node-side state for one connected peer.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    priority: u32,
    outgoing: mpsc::Sender<Message>,
    incoming: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
}

impl PeerState {
    /// Create a peer with default priority.
    ///
    /// `queue_capacity` bounds both queues; pushers await drain beyond it.
    pub fn new(
        id: impl Into<PeerId>,
        role: PeerRole,
        queue_capacity: usize,
    ) -> (Arc<Self>, PeerTransport) {
        Self::with_priority(id, role, queue_capacity, 0)
    }

    /// Create a peer with an explicit priority. Higher-priority peers are
    /// solicited first when loading.
    pub fn with_priority(
        id: impl Into<PeerId>,
        role: PeerRole,
        queue_capacity: usize,
        priority: u32,
    ) -> (Arc<Self>, PeerTransport) {
        let (out_tx, out_rx) = mpsc::channel(queue_capacity);
        let (in_tx, in_rx) = mpsc::channel(queue_capacity);
        let state = Arc::new(PeerState {
            id: id.into(),
            role,
            priority,
            outgoing: out_tx,
            incoming: Mutex::new(Some(in_rx)),
            closed: CancellationToken::new(),
        });
        let transport = PeerTransport {
            outgoing: out_rx,
            incoming: in_tx,
        };
        (state, transport)
    }

    /// The peer's identifier.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The peer's role.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// The peer's load priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether the peer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Take the inbound queue. Consumed once, by the node's dispatch loop.
    pub(crate) fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.incoming.lock().take()
    }

    /// Enqueue a message for the remote peer.
    ///
    /// Applies back-pressure: beyond the queue capacity this awaits drain.
    /// Returns once the message is handed to the transport. On an already
    /// closed peer the message is dropped silently; a pusher still awaiting
    /// drain when the peer closes gets [`PeerClosed`].
    pub async fn push_outgoing(&self, msg: Message) -> Result<(), PeerClosed> {
        if self.is_closed() {
            trace!(peer = %self.id, "dropping message for closed peer");
            return Ok(());
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(PeerClosed(self.id.clone())),
            res = self.outgoing.send(msg) => res.map_err(|_| {
                // the transport dropped its end; from here on the peer is gone
                self.close();
                PeerClosed(self.id.clone())
            }),
        }
    }

    /// Mark the peer closed. Idempotent; fails any awaiting pushers.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(peer = %self.id, "peer closed");
            self.closed.cancel();
        }
    }
}
