//! Sync protocol messages.
//!
//! Four actions drive convergence: `load` (a request carrying the sender's
//! known state), `known` (an unsolicited advertisement of the same shape),
//! `content` (header and/or transaction deltas), and `done` (the sender has
//! nothing more for the co-value right now). Messages are plain serde values;
//! framing and codec choice belong to the transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::covalue::{CoValueHeader, CoValueId, SessionId, Transaction};
use crate::known::KnownState;

/// A batch of transactions extending one session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDelta {
    /// Number of transactions the receiver is assumed to already hold; the
    /// batch starts at this index.
    pub after: u64,
    /// The transactions, in index order.
    pub txs: Vec<Transaction>,
}

/// Content of a [`Message::Content`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    /// The co-value the content belongs to.
    pub id: CoValueId,
    /// The header, included when the receiver is not known to hold it.
    pub header: Option<CoValueHeader>,
    /// New transactions per session.
    pub new: BTreeMap<SessionId, SessionDelta>,
}

/// One sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request content for a co-value, declaring what the sender already has.
    Load(KnownState),
    /// Advertise the sender's known state without requesting anything.
    Known(KnownState),
    /// Deliver a header and/or transaction deltas.
    Content(ContentMessage),
    /// The sender has nothing further for this co-value at this time.
    Done(CoValueId),
}

impl Message {
    /// The co-value this message is about.
    pub fn id(&self) -> &CoValueId {
        match self {
            Message::Load(known) | Message::Known(known) => &known.id,
            Message::Content(content) => &content.id,
            Message::Done(id) => id,
        }
    }
}
