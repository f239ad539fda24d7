//! Process-wide coordinator.
//!
//! A [`LocalNode`] owns the signing identity, the configuration, the metrics
//! group, the peers map, and the co-value registry. The registry is the only
//! shared mutable structure; it guarantees exactly one [`CoValueCore`] per id
//! for the node's lifetime, and all cross-co-value references go through it
//! by id.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::core::{CoValueCore, HeaderError};
use crate::covalue::{CoValueHeader, CoValueId, SessionId};
use crate::crypto::{AgentId, AgentSecret};
use crate::metrics::Metrics;
use crate::peer::{PeerId, PeerRole, PeerState, PeerTransport};
use crate::storage::{MemoryStorage, Storage};
use crate::sync::SyncManager;
use crate::verified::VerifiedState;

pub(crate) struct NodeInner {
    pub(crate) agent: AgentSecret,
    pub(crate) session: SessionId,
    pub(crate) config: SyncConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) peers: RwLock<BTreeMap<PeerId, Arc<PeerState>>>,
    pub(crate) registry: Mutex<HashMap<CoValueId, Arc<CoValueCore>>>,
    pub(crate) load_permits: Semaphore,
    pub(crate) shutdown: CancellationToken,
}

impl NodeInner {
    pub(crate) fn get_or_create(self: &Arc<Self>, id: CoValueId) -> Arc<CoValueCore> {
        self.registry
            .lock()
            .entry(id)
            .or_insert_with(|| CoValueCore::new(id, Arc::downgrade(self)))
            .clone()
    }

    pub(crate) fn peer(&self, id: &PeerId) -> Option<Arc<PeerState>> {
        self.peers.read().get(id).cloned()
    }

    pub(crate) fn peers(&self) -> Vec<Arc<PeerState>> {
        self.peers.read().values().cloned().collect()
    }

    /// Detach a peer and feed its closure into every core, where it counts
    /// as not-found for in-flight loads.
    pub(crate) fn on_peer_closed(&self, id: &PeerId) {
        if let Some(peer) = self.peers.write().remove(id) {
            peer.close();
            debug!(peer = %id, "peer detached");
        }
        let cores: Vec<_> = self.registry.lock().values().cloned().collect();
        for core in cores {
            core.mark_peer_closed(id);
        }
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("agent", &self.inner.agent.id())
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl LocalNode {
    /// Create a node with in-memory storage.
    ///
    /// `session_counter` distinguishes this run's session from earlier
    /// sessions of the same agent; reusing a counter across runs would fork
    /// the session's hash chain.
    pub fn new(agent: AgentSecret, session_counter: u32, config: SyncConfig) -> Self {
        Self::with_storage(agent, session_counter, config, Arc::new(MemoryStorage::new()))
    }

    /// Create a node with the given storage backend.
    pub fn with_storage(
        agent: AgentSecret,
        session_counter: u32,
        config: SyncConfig,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let session = SessionId::new(agent.id(), session_counter);
        let max_in_flight_loads = config.max_in_flight_loads;
        let inner = Arc::new(NodeInner {
            agent,
            session,
            config,
            metrics: Arc::new(Metrics::default()),
            storage,
            peers: RwLock::new(BTreeMap::new()),
            registry: Mutex::new(HashMap::new()),
            load_permits: Semaphore::new(max_in_flight_loads),
            shutdown: CancellationToken::new(),
        });
        LocalNode { inner }
    }

    /// The node's public identity.
    pub fn agent_id(&self) -> AgentId {
        self.inner.agent.id()
    }

    /// The session this node authors transactions in.
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    /// The node's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The node's metrics group.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// The inbound message router for this node.
    pub fn sync_manager(&self) -> SyncManager {
        SyncManager::new(self.inner.clone())
    }

    /// The core for an id, created in `unknown` if absent. Atomic: concurrent
    /// calls for one id observe the same core.
    pub fn get_or_create(&self, id: CoValueId) -> Arc<CoValueCore> {
        self.inner.get_or_create(id)
    }

    /// The core for an id, if one exists.
    pub fn get(&self, id: &CoValueId) -> Option<Arc<CoValueCore>> {
        self.inner.registry.lock().get(id).cloned()
    }

    /// Create a co-value locally. The core is `available` immediately.
    pub async fn create_covalue(
        &self,
        header: CoValueHeader,
    ) -> Result<Arc<CoValueCore>, HeaderError> {
        let core = self.get_or_create(header.id());
        core.provide_header(header).await?;
        Ok(core)
    }

    /// Load a co-value from the node's server and storage peers.
    ///
    /// Resolves with the verified content, or `None` when every peer came up
    /// empty. Subject to the node's in-flight load limit.
    pub async fn load_covalue(&self, id: CoValueId) -> Option<VerifiedState> {
        let _permit = self
            .inner
            .load_permits
            .acquire()
            .await
            .expect("semaphore is never closed");
        let core = self.get_or_create(id);
        let mut peers: Vec<_> = self
            .inner
            .peers()
            .into_iter()
            .filter(|peer| matches!(peer.role(), PeerRole::Server | PeerRole::Storage))
            .collect();
        peers.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id().cmp(b.id()))
        });
        core.load_from_peers(peers).await;
        core.verified()
    }

    /// Create a peer with the node's configured queue bounds and attach it.
    ///
    /// Returns the peer and the transport-side channel ends.
    pub fn connect_peer(
        &self,
        id: impl Into<PeerId>,
        role: PeerRole,
    ) -> (Arc<PeerState>, PeerTransport) {
        let (peer, transport) =
            PeerState::new(id, role, self.inner.config.outbound_queue_high_water);
        self.attach_peer(peer.clone());
        (peer, transport)
    }

    /// Attach a connected peer and start dispatching its inbound messages.
    pub fn attach_peer(&self, peer: Arc<PeerState>) {
        let Some(mut incoming) = peer.take_incoming() else {
            warn!(peer = %peer.id(), "peer already attached");
            return;
        };
        self.inner
            .peers
            .write()
            .insert(peer.id().clone(), peer.clone());
        debug!(peer = %peer.id(), role = ?peer.role(), "peer attached");

        let inner = self.inner.clone();
        let manager = SyncManager::new(inner.clone());
        let span = error_span!("peer", peer = %peer.id());
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = peer.closed_token().cancelled() => break,
                        msg = incoming.recv() => match msg {
                            Some(msg) => manager.handle_message(peer.id(), msg).await,
                            None => break,
                        }
                    }
                }
                inner.on_peer_closed(peer.id());
            }
            .instrument(span),
        );
    }

    /// All currently attached peers.
    pub fn peers(&self) -> Vec<Arc<PeerState>> {
        self.inner.peers()
    }

    /// Close one peer. Its in-flight loads count it as not-found.
    pub fn close_peer(&self, id: &PeerId) {
        if let Some(peer) = self.inner.peer(id) {
            peer.close();
        }
    }

    /// Shut the node down: close every peer and stop the dispatch loops.
    pub fn shutdown(&self) {
        debug!("shutting down");
        self.inner.shutdown.cancel();
        for peer in self.inner.peers() {
            peer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::core::LoadingState;
    use crate::covalue::{CoValueKind, Ruleset};
    use crate::peer::PeerTransport;

    fn test_node() -> LocalNode {
        let mut rng = rand::thread_rng();
        LocalNode::new(AgentSecret::new(&mut rng), 0, SyncConfig::default())
    }

    fn test_header() -> CoValueHeader {
        CoValueHeader {
            kind: CoValueKind::CoMap,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: None,
        }
    }

    fn server_peer(node: &LocalNode, id: &str) -> (Arc<PeerState>, PeerTransport) {
        node.connect_peer(id, PeerRole::Server)
    }

    #[tokio::test]
    async fn registry_is_one_core_per_id() {
        let node = test_node();
        let id = test_header().id();
        let a = node.get_or_create(id);
        let b = node.get_or_create(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.loading_state(), LoadingState::Unknown);
        assert!(node.get(&id).is_some());

        let mut other = test_header();
        other.uniqueness = Some([1; 16]);
        let c = node.get_or_create(other.id());
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn create_covalue_is_available_immediately() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        let storage = Arc::new(MemoryStorage::new());
        let node = LocalNode::with_storage(
            AgentSecret::new(&mut rng),
            1,
            SyncConfig::default(),
            storage.clone(),
        );

        let header = test_header();
        let core = node.create_covalue(header.clone()).await?;
        assert_eq!(core.loading_state(), LoadingState::Available);
        assert_eq!(storage.header(core.id()), Some(header));

        core.make_transaction(Bytes::from_static(b"first")).await?;
        assert_eq!(storage.transaction_count(core.id(), &node.session_id()), 1);
        Ok(())
    }

    #[tokio::test]
    async fn load_without_peers_settles_unavailable() {
        let node = test_node();
        let id = test_header().id();
        assert!(node.load_covalue(id).await.is_none());
        assert_eq!(
            node.get(&id).unwrap().loading_state(),
            LoadingState::Unavailable
        );
    }

    #[tokio::test]
    async fn closing_a_peer_resolves_its_loads() {
        let node = test_node();
        let (_peer, _transport) = server_peer(&node, "p1");
        let id = test_header().id();

        let load = tokio::spawn({
            let node = node.clone();
            async move { node.load_covalue(id).await }
        });
        // let the load message go out before closing
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(node.get(&id).unwrap().loading_state(), LoadingState::Loading);

        node.close_peer(&"p1".into());
        assert!(load.await.unwrap().is_none());
        assert_eq!(
            node.get(&id).unwrap().loading_state(),
            LoadingState::Unavailable
        );
        // the dispatch loop notices the closure and detaches the peer
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn load_joins_an_attempt_in_flight() {
        let node = test_node();
        let (_peer, _transport) = server_peer(&node, "p1");
        let id = test_header().id();
        let core = node.get_or_create(id);

        let first = tokio::spawn({
            let node = node.clone();
            async move { node.load_covalue(id).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let node = node.clone();
            async move { node.load_covalue(id).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(node.metrics().loads_started.get(), 1);

        core.mark_not_found_in_peer(&"p1".into());
        assert!(first.await.unwrap().is_none());
        assert!(second.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_flight_loads_are_limited() {
        let mut rng = rand::thread_rng();
        let config = SyncConfig {
            max_in_flight_loads: 1,
            ..SyncConfig::default()
        };
        let node = LocalNode::new(AgentSecret::new(&mut rng), 0, config);
        let (_peer, _transport) = server_peer(&node, "p1");

        let id_a = test_header().id();
        let mut other = test_header();
        other.uniqueness = Some([7; 16]);
        let id_b = other.id();

        let first = tokio::spawn({
            let node = node.clone();
            async move { node.load_covalue(id_a).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let node = node.clone();
            async move { node.load_covalue(id_b).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // the second load is parked on the permit; it has not even
        // registered its core yet
        assert!(node.get(&id_b).is_none());

        node.get(&id_a)
            .unwrap()
            .mark_not_found_in_peer(&"p1".into());
        assert!(first.await.unwrap().is_none());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let core_b = node.get(&id_b).expect("permit freed, second load runs");
        core_b.mark_not_found_in_peer(&"p1".into());
        assert!(second.await.unwrap().is_none());
    }
}
