// Node configuration
//
// Immutable for the lifetime of a node. Deserializable so scenario files can
// override single fields and fall back to the defaults for the rest.

use crate::ps_interface::{SimTime, MS_PER_SECOND};

/// Configuration shared by a node and its strategies
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Maximum number of connected + connecting peers (default: 30)
    pub max_connections: usize,

    /// Largest chunk payload accepted for forwarding and storage (default: 64 KiB)
    pub max_chunk_size: usize,

    /// Base time a pending query waits for data (default: 5 min)
    pub query_timeout_ms: SimTime,

    /// Maximum number of peers sent in one announcement (default: 50)
    pub max_announced_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_connections: 30,
            max_chunk_size: 64 * 1024,
            query_timeout_ms: 5 * 60 * MS_PER_SECOND,
            max_announced_peers: 50,
        }
    }
}
