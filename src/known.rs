//! Known-state vector.
//!
//! A [`KnownState`] summarizes which transactions a peer holds for one
//! co-value: whether it has the header, and how many transactions it has per
//! session. Peers exchange these vectors to negotiate deltas instead of
//! shipping full logs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::covalue::{CoValueId, SessionId};

/// Per-session transaction counts one peer holds for one co-value.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct KnownState {
    /// The co-value this summary is about.
    pub id: CoValueId,
    /// Whether the peer holds the header.
    pub header: bool,
    /// Number of transactions held per session.
    pub sessions: BTreeMap<SessionId, u64>,
}

impl KnownState {
    /// An empty summary: no header, no sessions.
    pub fn new(id: CoValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Record that we hold `count` transactions for a session.
    ///
    /// Counts only ever grow: inserting a smaller count is a no-op.
    pub fn insert(&mut self, session: SessionId, count: u64) {
        self.sessions
            .entry(session)
            .and_modify(|c| *c = (*c).max(count))
            .or_insert(count);
    }

    /// The number of transactions known for a session.
    pub fn session_count(&self, session: &SessionId) -> u64 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Combine another summary for the same co-value into this one.
    ///
    /// Per-session counts take the maximum, headers combine with OR.
    /// Commutative, associative and idempotent.
    pub fn combine(&mut self, other: &Self) {
        debug_assert_eq!(self.id, other.id);
        self.header |= other.header;
        for (session, count) in &other.sessions {
            self.insert(*session, *count);
        }
    }

    /// Can this state offer transactions that `other` lacks?
    pub fn has_news_for(&self, other: &Self) -> bool {
        if self.header && !other.header {
            return true;
        }
        self.sessions
            .iter()
            .any(|(s, count)| *count > other.session_count(s))
    }

    /// Split the sessions where `remote` is ahead of us from the sessions
    /// where we are ahead of `remote`.
    pub fn diff(&self, remote: &Self) -> KnownStateDiff {
        let mut diff = KnownStateDiff::default();
        for (session, theirs) in &remote.sessions {
            if *theirs > self.session_count(session) {
                diff.missing.insert(*session, *theirs);
            }
        }
        for (session, ours) in &self.sessions {
            let theirs = remote.session_count(session);
            if *ours > theirs {
                diff.newer.insert(*session, theirs);
            }
        }
        diff
    }
}

/// Outcome of comparing a local [`KnownState`] against a remote one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownStateDiff {
    /// Sessions where the remote holds more than us, mapped to the remote
    /// count.
    pub missing: BTreeMap<SessionId, u64>,
    /// Sessions where we hold more than the remote, mapped to the remote
    /// count (the index our delta to them starts after).
    pub newer: BTreeMap<SessionId, u64>,
}

impl KnownStateDiff {
    /// True when neither side is ahead.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.newer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covalue::{CoValueHeader, CoValueKind, Ruleset};
    use crate::crypto::AgentSecret;

    fn test_id() -> CoValueId {
        CoValueHeader {
            kind: CoValueKind::CoMap,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: None,
        }
        .id()
    }

    fn sessions(n: usize) -> Vec<SessionId> {
        let mut rng = rand::thread_rng();
        let agent = AgentSecret::new(&mut rng).id();
        (0..n as u32).map(|i| SessionId::new(agent, i)).collect()
    }

    fn known(id: CoValueId, header: bool, entries: &[(SessionId, u64)]) -> KnownState {
        let mut k = KnownState::new(id);
        k.header = header;
        for (s, c) in entries {
            k.insert(*s, *c);
        }
        k
    }

    #[test]
    fn combine_takes_max_and_ors_header() {
        let id = test_id();
        let s = sessions(2);
        let mut a = known(id, false, &[(s[0], 3), (s[1], 1)]);
        let b = known(id, true, &[(s[0], 2), (s[1], 5)]);
        a.combine(&b);
        assert!(a.header);
        assert_eq!(a.session_count(&s[0]), 3);
        assert_eq!(a.session_count(&s[1]), 5);
    }

    #[test]
    fn combine_is_commutative_associative_idempotent() {
        let id = test_id();
        let s = sessions(3);
        let a = known(id, false, &[(s[0], 3), (s[1], 1)]);
        let b = known(id, true, &[(s[1], 4), (s[2], 2)]);
        let c = known(id, false, &[(s[0], 1), (s[2], 9)]);

        // commutative
        let mut ab = a.clone();
        ab.combine(&b);
        let mut ba = b.clone();
        ba.combine(&a);
        assert_eq!(ab, ba);

        // associative
        let mut ab_c = ab.clone();
        ab_c.combine(&c);
        let mut bc = b.clone();
        bc.combine(&c);
        let mut a_bc = a.clone();
        a_bc.combine(&bc);
        assert_eq!(ab_c, a_bc);

        // idempotent
        let mut aa = a.clone();
        aa.combine(&a);
        assert_eq!(aa, a);
    }

    #[test]
    fn diff_splits_missing_and_newer() {
        let id = test_id();
        let s = sessions(3);
        let local = known(id, true, &[(s[0], 3), (s[1], 1)]);
        let remote = known(id, true, &[(s[0], 5), (s[1], 1), (s[2], 2)]);

        let diff = local.diff(&remote);
        assert_eq!(diff.missing.get(&s[0]), Some(&5));
        assert_eq!(diff.missing.get(&s[2]), Some(&2));
        assert_eq!(diff.missing.len(), 2);
        assert!(diff.newer.is_empty());

        let diff = remote.diff(&local);
        assert_eq!(diff.newer.get(&s[0]), Some(&3));
        assert_eq!(diff.newer.get(&s[2]), Some(&0));
        assert_eq!(diff.newer.len(), 2);
        assert!(diff.missing.is_empty());

        assert!(local.diff(&local).is_empty());
    }

    #[test]
    fn has_news_for_considers_header_and_counts() {
        let id = test_id();
        let s = sessions(1);
        let empty = KnownState::new(id);
        let with_header = known(id, true, &[]);
        let with_txs = known(id, true, &[(s[0], 2)]);

        assert!(with_header.has_news_for(&empty));
        assert!(!empty.has_news_for(&with_header));
        assert!(with_txs.has_news_for(&with_header));
        assert!(!with_txs.has_news_for(&with_txs));
    }
}
