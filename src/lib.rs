//! Local-first collaborative data engine.
//!
//! The crate operates on co-values: replicated, verifiable objects with a
//! content-addressed [`CoValueId`] and an append-only per-session transaction
//! log. Every writer contributes through its own [session](SessionId); within a
//! session, transactions form a gap-free hash chain signed by the session's
//! agent key. Peers negotiate deltas by exchanging [`KnownState`] vectors (a
//! per-session transaction-count summary) and converge without any peer being
//! authoritative.
//!
//! A process participates through a [`LocalNode`], which owns the registry of
//! [`CoValueCore`] state machines, the set of connected [peers](PeerState), and
//! the node's signing identity. Loading a co-value fans out to all useful peers
//! and settles in exactly one outcome per attempt: `available` once any peer
//! supplies a valid header, or `unavailable` once every peer has answered
//! not-found, errored, closed, or run past its deadline. Loads are retryable;
//! `unavailable` is a verdict on one attempt, not on the co-value.
//!
//! The crate stops at channel boundaries: wire transports, durable storage and
//! higher-level schemas are the embedder's concern. See [`wire`] for the
//! message set and [`storage`] for the persistence seam.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod core;
pub mod covalue;
pub mod crypto;
pub mod known;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod storage;
pub mod sync;
pub mod verified;
pub mod wire;

pub use self::config::SyncConfig;
pub use self::core::{CoValueCore, CoreError, HeaderError, LoadingState};
pub use self::covalue::{CoValueHeader, CoValueId, CoValueKind, Ruleset, SessionId, Transaction};
pub use self::crypto::{AgentId, AgentSecret, Hash};
pub use self::known::KnownState;
pub use self::node::LocalNode;
pub use self::peer::{PeerId, PeerRole, PeerState};
pub use self::verified::{TransactionError, VerifiedState};
