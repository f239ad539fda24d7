//! Persistence seam.
//!
//! The engine hands verified content to a [`Storage`] implementation as it is
//! accepted; durable backends live in the embedder. Persistence failures are
//! logged and never affect sync state. [`MemoryStorage`] is the in-process
//! implementation used in tests and ephemeral nodes.

use std::collections::BTreeMap;

use anyhow::Result;
use parking_lot::Mutex;

use crate::covalue::{CoValueHeader, CoValueId, SessionId, Transaction};

/// Sink for verified co-value content.
pub trait Storage: Send + Sync + 'static {
    /// Persist a header the node has accepted.
    fn store_header(&self, id: &CoValueId, header: &CoValueHeader) -> Result<()>;

    /// Persist verified transactions appended to a session log at `after`.
    fn store_transactions(
        &self,
        id: &CoValueId,
        session: &SessionId,
        after: u64,
        txs: &[Transaction],
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    headers: BTreeMap<CoValueId, CoValueHeader>,
    transactions: BTreeMap<(CoValueId, SessionId), Vec<Transaction>>,
}

/// In-memory [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored header for a co-value, if any.
    pub fn header(&self, id: &CoValueId) -> Option<CoValueHeader> {
        self.inner.lock().headers.get(id).cloned()
    }

    /// Number of stored transactions for one session of a co-value.
    pub fn transaction_count(&self, id: &CoValueId, session: &SessionId) -> u64 {
        self.inner
            .lock()
            .transactions
            .get(&(*id, *session))
            .map(|txs| txs.len() as u64)
            .unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn store_header(&self, id: &CoValueId, header: &CoValueHeader) -> Result<()> {
        self.inner.lock().headers.insert(*id, header.clone());
        Ok(())
    }

    fn store_transactions(
        &self,
        id: &CoValueId,
        session: &SessionId,
        after: u64,
        txs: &[Transaction],
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let log = inner.transactions.entry((*id, *session)).or_default();
        anyhow::ensure!(
            log.len() as u64 == after,
            "transaction batch does not extend the stored log"
        );
        log.extend_from_slice(txs);
        Ok(())
    }
}
