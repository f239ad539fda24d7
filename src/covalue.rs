//! Core data model: co-value identity, headers, sessions, transactions.
//!
//! A co-value is identified by the BLAKE3 hash of the canonical encoding of
//! its [`CoValueHeader`]. Two peers independently creating the same header
//! produce the same [`CoValueId`]; the optional `uniqueness` nonce perturbs
//! the id when duplicates are wanted.

use std::fmt::{self, Debug, Display};

use bytes::Bytes;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::crypto::{AgentId, Hash};

/// Canonical byte encoding used for content addressing.
pub(crate) fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // postcard encoding of the fixed types in this module cannot fail
    postcard::to_stdvec(value).expect("value serializes")
}

/// Content-derived identifier of a co-value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoValueId(Hash);

impl CoValueId {
    /// The underlying header digest.
    pub fn as_hash(&self) -> &Hash {
        &self.0
    }

    /// Shortened form for logging.
    pub fn fmt_short(&self) -> String {
        format!("co{}", self.0.fmt_short())
    }
}

impl From<Hash> for CoValueId {
    fn from(value: Hash) -> Self {
        Self(value)
    }
}

impl Display for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co{}", self.0)
    }
}

impl Debug for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoValueId({})", self.fmt_short())
    }
}

/// The closed set of co-value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum CoValueKind {
    CoMap,
    CoList,
    CoStream,
    Binary,
    Group,
    Account,
}

/// Write-authority policy embedded in a co-value header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Ruleset {
    /// Every agent may write. Used for values whose integrity comes from
    /// elsewhere (e.g. content-addressed binaries).
    UnsafeAllowAll,
    /// Writes are governed by the membership of another co-value.
    OwnedByGroup {
        /// The governing group co-value.
        group: CoValueId,
    },
    /// The co-value is itself a group and governs its own membership.
    Group,
}

/// Immutable descriptor a co-value's id is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoValueHeader {
    /// Shape of the co-value.
    pub kind: CoValueKind,
    /// Write-authority policy.
    pub ruleset: Ruleset,
    /// Opaque application metadata.
    pub meta: Option<Bytes>,
    /// Optional nonce; distinct nonces give otherwise identical headers
    /// distinct ids.
    pub uniqueness: Option<[u8; 16]>,
}

impl CoValueHeader {
    /// Compute the content-derived id of this header.
    pub fn id(&self) -> CoValueId {
        CoValueId(Hash::new(canonical_bytes(self)))
    }
}

/// One writer's contribution stream to one co-value.
///
/// An agent may open any number of sessions, distinguished by the counter.
/// Within a session, transactions are strictly ordered and gap-free.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
    agent: AgentId,
    counter: u32,
}

impl SessionId {
    /// Create a session id for the given agent.
    pub fn new(agent: AgentId, counter: u32) -> Self {
        Self { agent, counter }
    }

    /// The agent whose key signs this session's transactions.
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// The per-agent session counter.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Shortened form for logging.
    pub fn fmt_short(&self) -> String {
        format!("{}_{}", self.agent.fmt_short(), self.counter)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.agent, self.counter)
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.fmt_short())
    }
}

/// One entry in a session log.
///
/// `prev` links the transaction to the session's hash chain: the chain head
/// after this transaction is `blake3(prev || payload)`, and `signature` signs
/// that new head under the session's agent key. The index of a transaction is
/// its position in the log; it never travels separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Chain head before this transaction.
    pub prev: Hash,
    /// Opaque payload; interpretation belongs to the ruleset layer.
    pub payload: Bytes,
    /// Agent signature over the chain head after this transaction.
    pub signature: Signature,
}
