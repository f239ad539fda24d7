//! Inbound message dispatch and delta negotiation.
//!
//! One [`SyncManager`] serves a whole node. Every inbound message is routed
//! to the core for its id (created in `unknown` if absent); replies and
//! broadcasts go back out through the per-peer queues. Verification failures
//! are local: they mark the offending peer errored for the one co-value and
//! touch nothing else.

use std::fmt;
use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::core::{CoreError, HeaderError, LoadingState};
use crate::covalue::CoValueId;
use crate::known::KnownState;
use crate::node::NodeInner;
use crate::peer::PeerId;
use crate::wire::{ContentMessage, Message};

/// Routes inbound sync messages for one node.
#[derive(Clone)]
pub struct SyncManager {
    node: Arc<NodeInner>,
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager").finish_non_exhaustive()
    }
}

impl SyncManager {
    pub(crate) fn new(node: Arc<NodeInner>) -> Self {
        Self { node }
    }

    /// Handle one message arriving from a peer.
    pub async fn handle_message(&self, from: &PeerId, msg: Message) {
        self.node.metrics.messages_received.inc();
        trace!(peer = %from, id = %msg.id().fmt_short(), "inbound message");
        match msg {
            Message::Load(known) => self.handle_load(from, known).await,
            Message::Known(known) => self.handle_known(from, known).await,
            Message::Content(content) => self.handle_content(from, content).await,
            Message::Done(id) => self.handle_done(from, id),
        }
    }

    /// A peer requests content, telling us what it already has.
    ///
    /// If we have the co-value, reply with the delta (header included when
    /// the peer lacks it), or `done` when the peer is already caught up. If
    /// we do not, reply with our own (empty) known state.
    async fn handle_load(&self, from: &PeerId, known: KnownState) {
        let core = self.node.get_or_create(known.id);
        // a peer asking for content is interested again, whatever it answered
        // to our own load earlier
        core.clear_not_found(from);
        let reply = match core.verified() {
            Some(verified) => {
                let new = verified.sessions_after(&known);
                if !known.header || !new.is_empty() {
                    Message::Content(ContentMessage {
                        id: known.id,
                        header: (!known.header).then(|| verified.header().clone()),
                        new,
                    })
                } else {
                    Message::Done(known.id)
                }
            }
            None => Message::Known(core.known_state()),
        };
        self.send(from, reply).await;
    }

    /// A peer advertises its known state without requesting anything.
    async fn handle_known(&self, from: &PeerId, known: KnownState) {
        let core = self.node.get_or_create(known.id);
        match core.verified() {
            Some(verified) => {
                let ours = verified.known_state();
                let diff = ours.diff(&known);
                let new = verified.sessions_after(&known);
                if !known.header || !new.is_empty() {
                    self.send(
                        from,
                        Message::Content(ContentMessage {
                            id: known.id,
                            header: (!known.header).then(|| verified.header().clone()),
                            new,
                        }),
                    )
                    .await;
                }
                if !diff.missing.is_empty() {
                    // the peer is ahead of us somewhere; ask for the rest
                    self.send(from, Message::Load(ours)).await;
                }
            }
            None => {
                if known.header {
                    // the peer has content we lack; solicit it
                    self.send(from, Message::Load(core.known_state())).await;
                } else if core.loading_state() == LoadingState::Loading {
                    core.mark_not_found_in_peer(from);
                }
            }
        }
    }

    /// A peer delivers a header and/or transaction batches.
    async fn handle_content(&self, from: &PeerId, content: ContentMessage) {
        let core = self.node.get_or_create(content.id);
        if let Some(header) = content.header {
            match core.provide_header_from(header, Some(from)).await {
                Ok(()) => {}
                Err(err @ HeaderError::Mismatch { .. }) => {
                    // surfaced and dropped; no verdict on the peer, no
                    // transition on the core
                    warn!(
                        peer = %from,
                        id = %content.id.fmt_short(),
                        %err,
                        "dropping content with mismatched header"
                    );
                    return;
                }
                Err(err @ HeaderError::Collision { .. }) => {
                    // programmer error, not peer misbehavior: abort handling
                    error!(
                        peer = %from,
                        id = %content.id.fmt_short(),
                        %err,
                        "conflicting header for one id, aborting content handling"
                    );
                    return;
                }
            }
        }
        if content.new.is_empty() {
            return;
        }
        if core.loading_state() != LoadingState::Available {
            warn!(
                peer = %from,
                id = %content.id.fmt_short(),
                "dropping content for a co-value we hold no header for"
            );
            return;
        }
        for (session, delta) in content.new {
            if let Err(err) = core.try_add_transactions(&session, delta.after, &delta.txs) {
                match err {
                    CoreError::Transaction(err) => {
                        self.node
                            .metrics
                            .transactions_rejected
                            .inc_by(delta.txs.len() as u64);
                        // scoped to this peer and this co-value; other
                        // sessions in the message are still applied
                        core.mark_errored(from, err.into());
                    }
                    err => {
                        warn!(peer = %from, id = %content.id.fmt_short(), %err, "dropping content");
                        return;
                    }
                }
            }
        }
    }

    /// A peer has nothing (more) for this co-value at this time.
    fn handle_done(&self, from: &PeerId, id: CoValueId) {
        let core = self.node.get_or_create(id);
        if core.loading_state() == LoadingState::Loading {
            core.mark_not_found_in_peer(from);
        }
    }

    async fn send(&self, to: &PeerId, msg: Message) {
        let Some(peer) = self.node.peer(to) else {
            trace!(peer = %to, "dropping reply to detached peer");
            return;
        };
        if peer.push_outgoing(msg).await.is_ok() {
            self.node.metrics.messages_sent.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::config::SyncConfig;
    use crate::covalue::{CoValueHeader, CoValueKind, Ruleset, SessionId};
    use crate::crypto::AgentSecret;
    use crate::node::LocalNode;
    use crate::peer::{PeerRole, PeerState, PeerTransport};
    use crate::verified::VerifiedState;

    fn test_node() -> LocalNode {
        let mut rng = rand::thread_rng();
        LocalNode::new(AgentSecret::new(&mut rng), 0, SyncConfig::default())
    }

    fn test_header() -> CoValueHeader {
        CoValueHeader {
            kind: CoValueKind::CoStream,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: None,
        }
    }

    fn attach(node: &LocalNode, id: &str) -> (Arc<PeerState>, PeerTransport) {
        node.connect_peer(id, PeerRole::Server)
    }

    fn drain(transport: &mut PeerTransport) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Ok(msg) = transport.outgoing.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Author a few transactions under a foreign agent, as a remote peer
    /// would.
    fn remote_content(header: &CoValueHeader, count: usize) -> (SessionId, VerifiedState) {
        let mut rng = rand::thread_rng();
        let secret = AgentSecret::new(&mut rng);
        let session = SessionId::new(secret.id(), 0);
        let mut state = VerifiedState::from_header(header.clone());
        for i in 0..count {
            state.append_local(&session, &secret, Bytes::from(format!("entry-{i}")));
        }
        (session, state)
    }

    #[tokio::test]
    async fn load_request_gets_content_reply() -> anyhow::Result<()> {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, mut transport) = attach(&node, "p1");

        let header = test_header();
        let core = node.create_covalue(header.clone()).await?;
        core.make_transaction(Bytes::from_static(b"hello")).await?;
        drain(&mut transport);

        manager
            .handle_message(&"p1".into(), Message::Load(KnownState::new(header.id())))
            .await;

        let msgs = drain(&mut transport);
        assert_eq!(msgs.len(), 1);
        let Message::Content(content) = &msgs[0] else {
            panic!("expected content, got {msgs:?}");
        };
        assert_eq!(content.header.as_ref(), Some(&header));
        let delta = content.new.get(&node.session_id()).unwrap();
        assert_eq!(delta.after, 0);
        assert_eq!(delta.txs.len(), 1);

        // a caught-up peer gets done
        manager
            .handle_message(&"p1".into(), Message::Load(core.known_state()))
            .await;
        assert_eq!(drain(&mut transport), vec![Message::Done(header.id())]);
        Ok(())
    }

    #[tokio::test]
    async fn load_request_for_unknown_covalue_gets_known_reply() {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, mut transport) = attach(&node, "p1");

        let id = test_header().id();
        manager
            .handle_message(&"p1".into(), Message::Load(KnownState::new(id)))
            .await;

        let msgs = drain(&mut transport);
        assert_eq!(msgs, vec![Message::Known(KnownState::new(id))]);
    }

    #[tokio::test]
    async fn content_installs_header_and_transactions() -> anyhow::Result<()> {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, _transport) = attach(&node, "p1");

        let header = test_header();
        let (session, remote) = remote_content(&header, 3);
        manager
            .handle_message(
                &"p1".into(),
                Message::Content(ContentMessage {
                    id: header.id(),
                    header: Some(header.clone()),
                    new: remote.sessions_after(&KnownState::new(header.id())),
                }),
            )
            .await;

        let core = node.get(&header.id()).unwrap();
        assert_eq!(core.loading_state(), LoadingState::Available);
        let verified = core.verified().unwrap();
        assert_eq!(verified.session_len(&session), 3);
        assert_eq!(node.metrics().transactions_added.get(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn forged_content_marks_only_that_peer() -> anyhow::Result<()> {
        let node = test_node();
        let manager = node.sync_manager();
        let (p1, _t1) = attach(&node, "p1");
        let (p2, _t2) = attach(&node, "p2");

        let header = test_header();
        let core = node.get_or_create(header.id());
        let load = tokio::spawn({
            let core = core.clone();
            async move { core.load_from_peers(vec![p1, p2]).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // p1 sends a header plus a transaction whose signature is garbage
        let (session, remote) = remote_content(&header, 1);
        let mut new = remote.sessions_after(&KnownState::new(header.id()));
        new.get_mut(&session).unwrap().txs[0].payload = Bytes::from_static(b"forged");
        manager
            .handle_message(
                &"p1".into(),
                Message::Content(ContentMessage {
                    id: header.id(),
                    header: Some(header.clone()),
                    new,
                }),
            )
            .await;
        load.await?;

        // the header was fine, so the co-value is available; the forged
        // transaction was rejected and p1 marked errored
        assert_eq!(core.loading_state(), LoadingState::Available);
        assert_eq!(core.verified().unwrap().session_len(&session), 0);
        assert_eq!(node.metrics().transactions_rejected.get(), 1);
        assert_eq!(node.metrics().peer_load_errored.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_header_is_dropped_without_a_peer_verdict() {
        let node = test_node();
        let manager = node.sync_manager();
        let (p1, _t1) = attach(&node, "p1");

        let id = test_header().id();
        let core = node.get_or_create(id);
        let load = tokio::spawn({
            let core = core.clone();
            async move { core.load_from_peers(vec![p1]).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let mut wrong = test_header();
        wrong.uniqueness = Some([9; 16]);
        manager
            .handle_message(
                &"p1".into(),
                Message::Content(ContentMessage {
                    id,
                    header: Some(wrong),
                    new: BTreeMap::new(),
                }),
            )
            .await;

        // the message is dropped; the core keeps waiting and the peer is
        // not marked errored
        assert_eq!(core.loading_state(), LoadingState::Loading);
        assert_eq!(node.metrics().peer_load_errored.get(), 0);

        core.mark_not_found_in_peer(&"p1".into());
        load.await.unwrap();
        assert_eq!(core.loading_state(), LoadingState::Unavailable);
    }

    #[tokio::test]
    async fn done_and_empty_known_count_as_not_found() {
        let node = test_node();
        let manager = node.sync_manager();
        let (p1, _t1) = attach(&node, "p1");
        let (p2, _t2) = attach(&node, "p2");

        let id = test_header().id();
        let core = node.get_or_create(id);
        let load = tokio::spawn({
            let core = core.clone();
            async move { core.load_from_peers(vec![p1, p2]).await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        manager
            .handle_message(&"p1".into(), Message::Known(KnownState::new(id)))
            .await;
        manager.handle_message(&"p2".into(), Message::Done(id)).await;
        load.await.unwrap();

        assert_eq!(core.loading_state(), LoadingState::Unavailable);
        assert_eq!(node.metrics().peer_load_not_found.get(), 2);
    }

    #[tokio::test]
    async fn advertisement_from_a_trailing_peer_gets_the_delta() -> anyhow::Result<()> {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, mut transport) = attach(&node, "p1");

        let header = test_header();
        let core = node.create_covalue(header.clone()).await?;
        core.make_transaction(Bytes::from_static(b"one")).await?;
        core.make_transaction(Bytes::from_static(b"two")).await?;
        drain(&mut transport);

        // the peer has the header and one of our two transactions
        let mut theirs = KnownState::new(header.id());
        theirs.header = true;
        theirs.insert(node.session_id(), 1);
        manager
            .handle_message(&"p1".into(), Message::Known(theirs))
            .await;

        let msgs = drain(&mut transport);
        assert_eq!(msgs.len(), 1);
        let Message::Content(content) = &msgs[0] else {
            panic!("expected content, got {msgs:?}");
        };
        assert!(content.header.is_none());
        let delta = content.new.get(&node.session_id()).unwrap();
        assert_eq!(delta.after, 1);
        assert_eq!(delta.txs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn advertisement_from_a_leading_peer_solicits_it() -> anyhow::Result<()> {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, mut transport) = attach(&node, "p1");

        let header = test_header();
        let core = node.create_covalue(header.clone()).await?;

        // the peer claims a session we know nothing about
        let (session, _remote) = remote_content(&header, 2);
        let mut theirs = KnownState::new(header.id());
        theirs.header = true;
        theirs.insert(session, 2);
        manager
            .handle_message(&"p1".into(), Message::Known(theirs))
            .await;

        let msgs = drain(&mut transport);
        assert_eq!(msgs, vec![Message::Load(core.known_state())]);
        Ok(())
    }

    #[tokio::test]
    async fn advertisement_for_an_untracked_covalue_solicits_the_peer() {
        let node = test_node();
        let manager = node.sync_manager();
        let (_peer, mut transport) = attach(&node, "p1");

        let id = test_header().id();
        let mut theirs = KnownState::new(id);
        theirs.header = true;
        manager
            .handle_message(&"p1".into(), Message::Known(theirs))
            .await;

        // no load was in flight, but the peer has content we lack
        assert_eq!(drain(&mut transport), vec![Message::Load(KnownState::new(id))]);
    }
}
