//! Metrics for the sync engine.

use iroh_metrics::{Counter, Gauge, MetricsGroup};

use crate::core::LoadingState;

/// Enum of metrics for the module
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "cosync")]
pub struct Metrics {
    /// Number of co-values currently in the unknown state
    pub covalues_unknown: Gauge,
    /// Number of co-values currently loading
    pub covalues_loading: Gauge,
    /// Number of co-values currently available
    pub covalues_available: Gauge,
    /// Number of co-values currently unavailable
    pub covalues_unavailable: Gauge,
    /// Number of co-values currently errored
    pub covalues_errored: Gauge,

    /// Number of load attempts started
    pub loads_started: Counter,
    /// Number of load attempts that settled available
    pub loads_available: Counter,
    /// Number of load attempts that settled without content
    pub loads_unavailable: Counter,

    /// Per-peer load results that came back not-found
    pub peer_load_not_found: Counter,
    /// Per-peer load results that errored
    pub peer_load_errored: Counter,
    /// Per-peer load attempts that ran past the deadline
    pub peer_load_timeout: Counter,
    /// Per-peer load attempts cut short by peer closure
    pub peer_load_closed: Counter,

    /// Number of verified transactions appended
    pub transactions_added: Counter,
    /// Number of transactions rejected during verification
    pub transactions_rejected: Counter,

    /// Number of sync messages handed to peer queues
    pub messages_sent: Counter,
    /// Number of sync messages received from peers
    pub messages_received: Counter,
}

impl Metrics {
    /// The population gauge for one loading state.
    pub fn state_gauge(&self, state: LoadingState) -> &Gauge {
        match state {
            LoadingState::Unknown => &self.covalues_unknown,
            LoadingState::Loading => &self.covalues_loading,
            LoadingState::Available => &self.covalues_available,
            LoadingState::Unavailable => &self.covalues_unavailable,
            LoadingState::Errored => &self.covalues_errored,
        }
    }

    /// Sum of the population gauges; equals the number of live co-value
    /// cores.
    pub fn covalues_total(&self) -> i64 {
        self.covalues_unknown.get()
            + self.covalues_loading.get()
            + self.covalues_available.get()
            + self.covalues_unavailable.get()
            + self.covalues_errored.get()
    }
}
