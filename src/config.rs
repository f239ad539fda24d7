//! Engine configuration.

use std::time::Duration;

/// Tunables for loading and syncing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait for a peer to answer a load before treating it as
    /// not-found.
    pub load_deadline: Duration,
    /// Outbound queue capacity per peer; pushers await drain beyond this.
    pub outbound_queue_high_water: usize,
    /// Maximum number of load attempts in flight across the node.
    pub max_in_flight_loads: usize,
    /// Verify transaction signatures on ingest. Disable only in tests that
    /// construct unsigned fixtures; hash chain and contiguity checks always
    /// run.
    pub verify_signatures: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            load_deadline: Duration::from_secs(30),
            outbound_queue_high_water: 1024,
            max_in_flight_loads: 100,
            verify_signatures: true,
        }
    }
}
