//! Verified co-value content.
//!
//! A [`VerifiedState`] holds everything this node has accepted for one
//! co-value: the header and, per session, a contiguous prefix of the session's
//! transaction log with the hash chain and signatures already checked. What is
//! in here is trusted; everything arriving from a peer goes through
//! [`VerifiedState::try_add_transactions`] first.

use std::collections::BTreeMap;

use bytes::Bytes;
use ed25519_dalek::Signature;
use serde::Serialize;

use crate::covalue::{canonical_bytes, CoValueHeader, CoValueId, SessionId, Transaction};
use crate::crypto::{AgentSecret, Hash};
use crate::known::KnownState;
use crate::wire::SessionDelta;

/// Why a batch of transactions was rejected.
///
/// Rejection is atomic: the session log is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The batch starts past the end of the log.
    #[error("batch starts at {got} but the session log ends at {expected}")]
    Gap {
        /// Current length of the session log.
        expected: u64,
        /// Index the batch claimed to start at.
        got: u64,
    },
    /// The batch starts before the end of the log.
    #[error("batch starts at {got} but the session log already has {expected}")]
    Overlap {
        /// Current length of the session log.
        expected: u64,
        /// Index the batch claimed to start at.
        got: u64,
    },
    /// A transaction's chain link does not match the session's chain head.
    #[error("transaction does not link to the session chain head")]
    BadHashChain,
    /// A transaction's signature does not verify under the session's agent.
    #[error("transaction signature does not verify")]
    BadSignature,
}

/// A verified, contiguous prefix of one session's transaction log.
#[derive(Debug, Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    head: Hash,
    last_signature: Option<Signature>,
}

impl SessionLog {
    fn new(head: Hash) -> Self {
        Self {
            transactions: Vec::new(),
            head,
            last_signature: None,
        }
    }

    /// The verified transactions, in index order starting at 0.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Number of verified transactions.
    pub fn len(&self) -> u64 {
        self.transactions.len() as u64
    }

    /// True when the session holds no transactions yet.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Current hash chain head.
    pub fn head(&self) -> &Hash {
        &self.head
    }

    /// Signature over the current chain head, if any transaction exists.
    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }
}

/// The chain head of a session before its first transaction.
fn genesis_head(id: &CoValueId, session: &SessionId) -> Hash {
    #[derive(Serialize)]
    struct Genesis<'a> {
        id: &'a CoValueId,
        session: &'a SessionId,
    }
    Hash::new(canonical_bytes(&Genesis { id, session }))
}

/// The chain head after appending `payload` on top of `prev`.
fn chain_next(prev: &Hash, payload: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev.as_bytes());
    hasher.update(payload);
    Hash::from(hasher.finalize())
}

/// Authoritative, cryptographically validated content of one co-value.
#[derive(Debug, Clone)]
pub struct VerifiedState {
    id: CoValueId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
}

impl VerifiedState {
    /// Construct an empty state bound to a header.
    ///
    /// The id is derived from the header here; it cannot diverge from the
    /// content.
    pub fn from_header(header: CoValueHeader) -> Self {
        let id = header.id();
        Self {
            id,
            header,
            sessions: BTreeMap::new(),
        }
    }

    /// The content-derived id.
    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    /// The header this state is bound to.
    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    /// The verified log of one session, if present.
    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    /// Iterate over all sessions with verified content.
    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    /// Number of verified transactions in one session.
    pub fn session_len(&self, session: &SessionId) -> u64 {
        self.sessions.get(session).map(|log| log.len()).unwrap_or(0)
    }

    /// Summarize this state for delta negotiation.
    pub fn known_state(&self) -> KnownState {
        let mut known = KnownState::new(self.id);
        known.header = true;
        for (session, log) in &self.sessions {
            known.insert(*session, log.len());
        }
        known
    }

    /// Append a batch of transactions to a session log.
    ///
    /// The batch is accepted only if it starts exactly at the current end of
    /// the log, every transaction links to the running chain head, and (when
    /// `verify_signatures` is set) every signature verifies under the
    /// session's agent key. On any error nothing is appended.
    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        starting_at: u64,
        txs: &[Transaction],
        verify_signatures: bool,
    ) -> Result<(), TransactionError> {
        let (mut head, current_len) = match self.sessions.get(session) {
            Some(log) => (log.head, log.len()),
            None => (genesis_head(&self.id, session), 0),
        };
        if starting_at > current_len {
            return Err(TransactionError::Gap {
                expected: current_len,
                got: starting_at,
            });
        }
        if starting_at < current_len {
            return Err(TransactionError::Overlap {
                expected: current_len,
                got: starting_at,
            });
        }

        // verify the whole batch against a staging head before touching the log
        let mut last_signature = None;
        for tx in txs {
            if tx.prev != head {
                return Err(TransactionError::BadHashChain);
            }
            let next = chain_next(&head, &tx.payload);
            if verify_signatures {
                session
                    .agent()
                    .verify(next.as_bytes(), &tx.signature)
                    .map_err(|_| TransactionError::BadSignature)?;
            }
            head = next;
            last_signature = Some(tx.signature);
        }

        let log = self
            .sessions
            .entry(*session)
            .or_insert_with(|| SessionLog::new(genesis_head(&self.id, session)));
        log.transactions.extend_from_slice(txs);
        log.head = head;
        if last_signature.is_some() {
            log.last_signature = last_signature;
        }
        Ok(())
    }

    /// Author the next transaction of a local session.
    ///
    /// Builds the chain link and signature for the given payload and appends
    /// it; the result is verified by construction. The secret must belong to
    /// the session's agent.
    pub fn append_local(
        &mut self,
        session: &SessionId,
        secret: &AgentSecret,
        payload: Bytes,
    ) -> Transaction {
        debug_assert_eq!(&secret.id(), session.agent());
        let log = self
            .sessions
            .entry(*session)
            .or_insert_with(|| SessionLog::new(genesis_head(&self.id, session)));
        let prev = log.head;
        let next = chain_next(&prev, &payload);
        let signature = secret.sign(next.as_bytes());
        let tx = Transaction {
            prev,
            payload,
            signature,
        };
        log.transactions.push(tx.clone());
        log.head = next;
        log.last_signature = Some(signature);
        tx
    }

    /// Extract the transactions a peer with known state `since` is missing.
    pub fn sessions_after(&self, since: &KnownState) -> BTreeMap<SessionId, SessionDelta> {
        let mut new = BTreeMap::new();
        for (session, log) in &self.sessions {
            let have = since.session_count(session);
            if log.len() > have {
                new.insert(
                    *session,
                    SessionDelta {
                        after: have,
                        txs: log.transactions[have as usize..].to_vec(),
                    },
                );
            }
        }
        new
    }
}
