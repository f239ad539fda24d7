//! The per-co-value load/sync state machine.
//!
//! A [`CoValueCore`] owns everything the node knows about one co-value: its
//! loading state, the verified content once present, the set of peers
//! solicited for it, and the observers waiting for an outcome. State
//! transitions are serialized behind an internal lock that is never held
//! across await points; cross-core coordination happens only through peer
//! queues.
//!
//! A load attempt fans out to a set of peers and settles in exactly one
//! outcome. Any peer supplying a valid header settles it `available`; the
//! attempt settles without content once every solicited peer has answered
//! not-found, errored, closed, or run past its deadline. Races between those
//! events and later attempts are resolved by an attempt counter: outcomes
//! recorded against a superseded attempt are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::covalue::{CoValueHeader, CoValueId, SessionId, Transaction};
use crate::known::KnownState;
use crate::node::NodeInner;
use crate::peer::{PeerId, PeerState};
use crate::verified::{TransactionError, VerifiedState};
use crate::wire::{ContentMessage, Message, SessionDelta};

/// Externally observable loading state of a co-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    /// Known by id only; no load attempted yet.
    Unknown,
    /// A load attempt is in flight.
    Loading,
    /// Verified content is present.
    Available,
    /// The last load attempt drained without content. Retryable.
    Unavailable,
    /// Every peer of the last load attempt errored. Retryable.
    Errored,
}

impl Display for LoadingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadingState::Unknown => "unknown",
            LoadingState::Loading => "loading",
            LoadingState::Available => "available",
            LoadingState::Unavailable => "unavailable",
            LoadingState::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// Why a header was not installed.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// The header does not hash to the co-value's id.
    #[error("header hashes to {actual}, expected {expected}")]
    Mismatch {
        /// The core's id.
        expected: CoValueId,
        /// What the provided header hashes to.
        actual: CoValueId,
    },
    /// A different header is already installed under the same id. Two headers
    /// hashing to one id is a programmer error; the operation is aborted.
    #[error("conflicting headers both hash to {id}")]
    Collision {
        /// The contested id.
        id: CoValueId,
    },
}

/// Why a content operation on a core failed.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The co-value has no verified content to operate on.
    #[error("co-value is not available")]
    NotAvailable,
    /// The owning node has shut down.
    #[error("node has shut down")]
    Shutdown,
    /// Transaction verification failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// How one peer's part of a load attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerLoadOutcome {
    NotFound,
    Errored,
    TimedOut,
    Closed,
}

/// Why a peer is excluded from outbound broadcasts for this co-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    Errored,
    NotFound,
}

/// Book-keeping for one in-flight load attempt.
#[derive(Debug)]
struct LoadTracker {
    attempt: u64,
    pending: BTreeSet<PeerId>,
    outcomes: BTreeMap<PeerId, PeerLoadOutcome>,
    /// Stops the per-peer deadline watchers once the attempt settles.
    cancel: CancellationToken,
}

#[derive(Debug)]
enum CoreState {
    Unknown,
    Loading(LoadTracker),
    Available(Box<VerifiedState>),
    Unavailable,
    Errored,
}

impl CoreState {
    fn label(&self) -> LoadingState {
        match self {
            CoreState::Unknown => LoadingState::Unknown,
            CoreState::Loading(_) => LoadingState::Loading,
            CoreState::Available(_) => LoadingState::Available,
            CoreState::Unavailable => LoadingState::Unavailable,
            CoreState::Errored => LoadingState::Errored,
        }
    }
}

/// State machine owning the load lifecycle and observers of one co-value.
///
/// Obtained through [`LocalNode::get_or_create`](crate::node::LocalNode::get_or_create),
/// which guarantees one core per id for the node's lifetime. References
/// between co-values go through the registry by id, never through direct
/// ownership.
#[derive(Debug)]
pub struct CoValueCore {
    id: CoValueId,
    node: Weak<NodeInner>,
    state: Mutex<CoreState>,
    /// Monotonic load attempt counter; guards against stale watcher events.
    attempts: AtomicU64,
    /// Peers a load for this co-value was ever sent to.
    solicited: Mutex<BTreeSet<PeerId>>,
    /// Peers excluded from broadcasts for this co-value.
    skip: Mutex<BTreeMap<PeerId, SkipReason>>,
    /// Observers waiting for the next settled outcome, in registration order.
    waiters: Mutex<Vec<oneshot::Sender<Option<VerifiedState>>>>,
}

impl CoValueCore {
    pub(crate) fn new(id: CoValueId, node: Weak<NodeInner>) -> Arc<Self> {
        let core = Arc::new(CoValueCore {
            id,
            node,
            state: Mutex::new(CoreState::Unknown),
            attempts: AtomicU64::new(0),
            solicited: Mutex::new(BTreeSet::new()),
            skip: Mutex::new(BTreeMap::new()),
            waiters: Mutex::new(Vec::new()),
        });
        if let Some(node) = core.node.upgrade() {
            node.metrics.state_gauge(LoadingState::Unknown).inc();
        }
        core
    }

    /// The co-value's id.
    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    /// The current loading state.
    pub fn loading_state(&self) -> LoadingState {
        self.state.lock().label()
    }

    /// Snapshot of the verified content, when available.
    pub fn verified(&self) -> Option<VerifiedState> {
        match &*self.state.lock() {
            CoreState::Available(verified) => Some((**verified).clone()),
            _ => None,
        }
    }

    /// What this node holds for the co-value, for delta negotiation.
    pub fn known_state(&self) -> KnownState {
        match &*self.state.lock() {
            CoreState::Available(verified) => verified.known_state(),
            _ => KnownState::new(self.id),
        }
    }

    /// Install a header, settling the co-value `available`.
    ///
    /// The header must hash to this core's id. Valid from every state;
    /// on an `available` core a duplicate of the installed header is a no-op
    /// and a conflicting one is rejected without a transition. Settling an
    /// in-flight load this way broadcasts our known state to the other
    /// solicited peers so they may push deltas.
    pub async fn provide_header(&self, header: CoValueHeader) -> Result<(), HeaderError> {
        self.provide_header_from(header, None).await
    }

    pub(crate) async fn provide_header_from(
        &self,
        header: CoValueHeader,
        from: Option<&PeerId>,
    ) -> Result<(), HeaderError> {
        let actual = header.id();
        if actual != self.id {
            return Err(HeaderError::Mismatch {
                expected: self.id,
                actual,
            });
        }
        let verified = {
            let mut state = self.state.lock();
            if let CoreState::Available(current) = &*state {
                if current.header() == &header {
                    trace!(id = %self.id.fmt_short(), "duplicate header ignored");
                    return Ok(());
                }
                return Err(HeaderError::Collision { id: self.id });
            }
            let was = state.label();
            if let CoreState::Loading(tracker) = &*state {
                tracker.cancel.cancel();
            }
            let verified = VerifiedState::from_header(header);
            *state = CoreState::Available(Box::new(verified.clone()));
            self.record_transition(was, LoadingState::Available);
            if was == LoadingState::Loading {
                if let Some(node) = self.node.upgrade() {
                    node.metrics.loads_available.inc();
                }
            }
            verified
        };
        debug!(id = %self.id.fmt_short(), "available");
        if let Some(peer) = from {
            self.skip.lock().remove(peer);
        }
        self.resolve_waiters(Some(&verified));
        if let Some(node) = self.node.upgrade() {
            if let Err(err) = node.storage.store_header(&self.id, verified.header()) {
                warn!(id = %self.id.fmt_short(), ?err, "failed to persist header");
            }
        }
        self.announce_to_solicited(verified.known_state(), from)
            .await;
        Ok(())
    }

    /// Record that a peer answered not-found for this co-value.
    ///
    /// While a load is in flight this removes the peer from the pending set
    /// and may settle the attempt.
    pub fn mark_not_found_in_peer(&self, peer: &PeerId) {
        self.skip.lock().insert(peer.clone(), SkipReason::NotFound);
        if let Some(attempt) = self.current_attempt() {
            self.record_peer_outcome(attempt, peer.clone(), PeerLoadOutcome::NotFound);
        }
    }

    /// Record that a peer produced invalid data for this co-value.
    ///
    /// The peer is excluded from further broadcasts for this co-value; an
    /// in-flight load treats it like not-found for the termination rule.
    pub fn mark_errored(&self, peer: &PeerId, err: anyhow::Error) {
        warn!(id = %self.id.fmt_short(), peer = %peer, err = %err, "peer errored for this co-value");
        self.skip.lock().insert(peer.clone(), SkipReason::Errored);
        if let Some(attempt) = self.current_attempt() {
            self.record_peer_outcome(attempt, peer.clone(), PeerLoadOutcome::Errored);
        }
    }

    /// Feed peer closure into an in-flight load attempt.
    pub(crate) fn mark_peer_closed(&self, peer: &PeerId) {
        if let Some(attempt) = self.current_attempt() {
            self.record_peer_outcome(attempt, peer.clone(), PeerLoadOutcome::Closed);
        }
    }

    /// Forget a not-found exclusion once the peer engages with the co-value
    /// again. Errored exclusions stay.
    pub(crate) fn clear_not_found(&self, peer: &PeerId) {
        let mut skip = self.skip.lock();
        if skip.get(peer) == Some(&SkipReason::NotFound) {
            skip.remove(peer);
        }
    }

    /// Request the co-value from a set of peers and await the outcome.
    ///
    /// Closed peers are never contacted. Transitions to `loading`, sends one
    /// load message per usable peer and arms its deadline; returns once the
    /// state leaves `loading`. With no usable peers the attempt settles
    /// `unavailable` immediately. Called while a load is already in flight,
    /// this joins the existing attempt; on an `available` core it returns
    /// right away.
    pub async fn load_from_peers(self: &Arc<Self>, peers: Vec<Arc<PeerState>>) {
        let mut seen = BTreeSet::new();
        let usable: Vec<Arc<PeerState>> = peers
            .into_iter()
            .filter(|peer| !peer.is_closed())
            .filter(|peer| seen.insert(peer.id().clone()))
            .collect();

        enum Plan {
            Join,
            Settled,
            Start(u64, CancellationToken),
        }

        let plan = {
            let mut state = self.state.lock();
            match &*state {
                CoreState::Available(_) => return,
                CoreState::Loading(_) => Plan::Join,
                CoreState::Unknown | CoreState::Unavailable | CoreState::Errored => {
                    let was = state.label();
                    if let Some(node) = self.node.upgrade() {
                        node.metrics.loads_started.inc();
                    }
                    if usable.is_empty() {
                        *state = CoreState::Unavailable;
                        self.record_transition(was, LoadingState::Unavailable);
                        if let Some(node) = self.node.upgrade() {
                            node.metrics.loads_unavailable.inc();
                        }
                        Plan::Settled
                    } else {
                        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        let cancel = CancellationToken::new();
                        *state = CoreState::Loading(LoadTracker {
                            attempt,
                            pending: usable.iter().map(|peer| peer.id().clone()).collect(),
                            outcomes: BTreeMap::new(),
                            cancel: cancel.clone(),
                        });
                        self.record_transition(was, LoadingState::Loading);
                        Plan::Start(attempt, cancel)
                    }
                }
            }
        };

        match plan {
            Plan::Join => {}
            Plan::Settled => {
                debug!(id = %self.id.fmt_short(), "no usable peers, settling unavailable");
                self.resolve_waiters(None);
                return;
            }
            Plan::Start(attempt, cancel) => {
                let known = self.known_state();
                for peer in usable {
                    self.solicit(attempt, &cancel, peer, known.clone()).await;
                }
            }
        }

        self.wait_for_outcome().await;
    }

    /// Await the settled outcome of this co-value.
    ///
    /// Resolves with the verified content once `available`, or with `None`
    /// once a load attempt settles without content. All observers registered
    /// before the outcome see the same outcome; observers registered after it
    /// resolve immediately.
    pub async fn wait_for_outcome(&self) -> Option<VerifiedState> {
        let rx = {
            let state = self.state.lock();
            match &*state {
                CoreState::Available(verified) => return Some((**verified).clone()),
                CoreState::Unavailable | CoreState::Errored => return None,
                CoreState::Unknown | CoreState::Loading(_) => {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.lock().push(tx);
                    rx
                }
            }
        };
        rx.await.unwrap_or(None)
    }

    /// Append a verified batch from a peer to the content.
    ///
    /// Fails with [`CoreError::NotAvailable`] before a header is installed.
    /// Verification failures leave the content untouched.
    pub fn try_add_transactions(
        &self,
        session: &SessionId,
        starting_at: u64,
        txs: &[Transaction],
    ) -> Result<(), CoreError> {
        let node = self.node.upgrade().ok_or(CoreError::Shutdown)?;
        {
            let mut state = self.state.lock();
            let CoreState::Available(verified) = &mut *state else {
                return Err(CoreError::NotAvailable);
            };
            verified.try_add_transactions(
                session,
                starting_at,
                txs,
                node.config.verify_signatures,
            )?;
        }
        trace!(
            id = %self.id.fmt_short(),
            session = %session.fmt_short(),
            count = txs.len(),
            "transactions added"
        );
        node.metrics.transactions_added.inc_by(txs.len() as u64);
        if let Err(err) = node.storage.store_transactions(&self.id, session, starting_at, txs) {
            warn!(id = %self.id.fmt_short(), ?err, "failed to persist transactions");
        }
        Ok(())
    }

    /// Author a transaction in the node's own session and push it to peers.
    ///
    /// Peers that answered not-found or errored for this co-value are
    /// skipped.
    pub async fn make_transaction(&self, payload: Bytes) -> Result<Transaction, CoreError> {
        let node = self.node.upgrade().ok_or(CoreError::Shutdown)?;
        let session = node.session;
        let (tx, after) = {
            let mut state = self.state.lock();
            let CoreState::Available(verified) = &mut *state else {
                return Err(CoreError::NotAvailable);
            };
            let after = verified.session_len(&session);
            let tx = verified.append_local(&session, &node.agent, payload);
            (tx, after)
        };
        node.metrics.transactions_added.inc();
        if let Err(err) =
            node.storage
                .store_transactions(&self.id, &session, after, std::slice::from_ref(&tx))
        {
            warn!(id = %self.id.fmt_short(), ?err, "failed to persist transactions");
        }

        let msg = Message::Content(ContentMessage {
            id: self.id,
            header: None,
            new: BTreeMap::from([(
                session,
                SessionDelta {
                    after,
                    txs: vec![tx.clone()],
                },
            )]),
        });
        for peer in node.peers() {
            if peer.is_closed() || self.skip.lock().contains_key(peer.id()) {
                continue;
            }
            if peer.push_outgoing(msg.clone()).await.is_ok() {
                node.metrics.messages_sent.inc();
            }
        }
        Ok(tx)
    }

    /// Send one load message and arm the deadline watcher for one peer.
    async fn solicit(
        self: &Arc<Self>,
        attempt: u64,
        cancel: &CancellationToken,
        peer: Arc<PeerState>,
        known: KnownState,
    ) {
        self.solicited.lock().insert(peer.id().clone());
        debug!(id = %self.id.fmt_short(), peer = %peer.id(), "requesting load");
        if peer.push_outgoing(Message::Load(known)).await.is_err() {
            self.record_peer_outcome(attempt, peer.id().clone(), PeerLoadOutcome::Closed);
            return;
        }
        let Some(node) = self.node.upgrade() else {
            return;
        };
        node.metrics.messages_sent.inc();
        let deadline = node.config.load_deadline;
        let core = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = peer.closed_token().cancelled() => {
                    core.record_peer_outcome(attempt, peer.id().clone(), PeerLoadOutcome::Closed);
                }
                _ = tokio::time::sleep(deadline) => {
                    trace!(id = %core.id.fmt_short(), peer = %peer.id(), "load deadline elapsed");
                    core.record_peer_outcome(attempt, peer.id().clone(), PeerLoadOutcome::TimedOut);
                }
            }
        });
    }

    /// Remove a peer from the pending set of the given attempt; settle the
    /// attempt when the set drains.
    fn record_peer_outcome(&self, attempt: u64, peer: PeerId, outcome: PeerLoadOutcome) {
        let settled = {
            let mut state = self.state.lock();
            let CoreState::Loading(tracker) = &mut *state else {
                return;
            };
            if tracker.attempt != attempt || !tracker.pending.remove(&peer) {
                return;
            }
            trace!(id = %self.id.fmt_short(), peer = %peer, ?outcome, "peer load outcome");
            if let Some(node) = self.node.upgrade() {
                match outcome {
                    PeerLoadOutcome::NotFound => node.metrics.peer_load_not_found.inc(),
                    PeerLoadOutcome::Errored => node.metrics.peer_load_errored.inc(),
                    PeerLoadOutcome::TimedOut => node.metrics.peer_load_timeout.inc(),
                    PeerLoadOutcome::Closed => node.metrics.peer_load_closed.inc(),
                };
            }
            tracker.outcomes.insert(peer, outcome);
            if tracker.pending.is_empty() {
                tracker.cancel.cancel();
                let all_errored = tracker
                    .outcomes
                    .values()
                    .all(|outcome| *outcome == PeerLoadOutcome::Errored);
                let to = if all_errored {
                    LoadingState::Errored
                } else {
                    LoadingState::Unavailable
                };
                *state = if all_errored {
                    CoreState::Errored
                } else {
                    CoreState::Unavailable
                };
                self.record_transition(LoadingState::Loading, to);
                if let Some(node) = self.node.upgrade() {
                    node.metrics.loads_unavailable.inc();
                }
                debug!(id = %self.id.fmt_short(), state = %to, "load settled without content");
                true
            } else {
                false
            }
        };
        if settled {
            self.resolve_waiters(None);
        }
    }

    /// Tell the solicited peers that did not supply the content that we have
    /// it now, so they may push deltas. Errored and closed peers are
    /// excluded; not-found peers are told.
    async fn announce_to_solicited(&self, known: KnownState, exclude: Option<&PeerId>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let targets: Vec<PeerId> = {
            let solicited = self.solicited.lock();
            let skip = self.skip.lock();
            solicited
                .iter()
                .filter(|peer| Some(*peer) != exclude)
                .filter(|peer| skip.get(*peer) != Some(&SkipReason::Errored))
                .cloned()
                .collect()
        };
        for peer_id in targets {
            let Some(peer) = node.peer(&peer_id) else {
                continue;
            };
            if peer.is_closed() {
                continue;
            }
            trace!(id = %self.id.fmt_short(), peer = %peer_id, "announcing known state");
            if peer.push_outgoing(Message::Load(known.clone())).await.is_ok() {
                node.metrics.messages_sent.inc();
            }
        }
    }

    fn current_attempt(&self) -> Option<u64> {
        match &*self.state.lock() {
            CoreState::Loading(tracker) => Some(tracker.attempt),
            _ => None,
        }
    }

    fn resolve_waiters(&self, outcome: Option<&VerifiedState>) {
        let waiters: Vec<_> = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.send(outcome.cloned()).ok();
        }
    }

    fn record_transition(&self, from: LoadingState, to: LoadingState) {
        trace!(id = %self.id.fmt_short(), %from, %to, "state transition");
        if let Some(node) = self.node.upgrade() {
            node.metrics.state_gauge(from).dec();
            node.metrics.state_gauge(to).inc();
        }
    }
}
