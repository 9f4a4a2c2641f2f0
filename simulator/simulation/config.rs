// Simulation Configuration

use ps_rust::ps_config::NodeConfig;
use ps_rust::ps_interface::{SimTime, MS_PER_DAY, MS_PER_SECOND};
use ps_rust::ps_network::NetworkProperties;

const MS_PER_MINUTE: SimTime = 60 * MS_PER_SECOND;
const MS_PER_HOUR: SimTime = 60 * MS_PER_MINUTE;

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration for a content-distribution simulation
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of users, each owning one node (default: 50)
    pub num_users: usize,

    /// Simulated time to run (default: 1 day)
    pub duration_ms: SimTime,

    /// Seed of all random variables (default: 12345)
    pub seed: u64,

    /// Configuration of every user node
    pub node: NodeConfig,

    /// Connection budget of the seed node every user knows (default: 1000)
    pub seed_node_max_connections: usize,

    /// Latency and bandwidth between any two peers
    pub network: NetworkProperties,

    /// Chunk storage per node in bytes (default: 64 MiB)
    pub storage_capacity: usize,

    /// User behaviour
    pub users: UserBehaviour,

    /// Interval of progress log lines (default: 1 hour)
    pub progress_interval_ms: SimTime,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_users: 50,
            duration_ms: MS_PER_DAY,
            seed: 12345,
            node: NodeConfig::default(),
            seed_node_max_connections: 1000,
            network: NetworkProperties::default(),
            storage_capacity: 64 * 1024 * 1024,
            users: UserBehaviour::default(),
            progress_interval_ms: MS_PER_HOUR,
        }
    }
}

// ============================================================================
// User Behaviour
// ============================================================================

/// Normal distribution parameters
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct NormalSpec {
    pub mean: f64,
    pub std_dev: f64,
}

impl NormalSpec {
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }

    fn duration(mean: SimTime, std_dev: SimTime) -> Self {
        Self::new(mean as f64, std_dev as f64)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct UserBehaviour {
    /// Offline time before going online, ms (default: 8h ± 2h)
    pub startup_ms: NormalSpec,

    /// Time spent online, ms (default: 2h ± 2h)
    pub online_ms: NormalSpec,

    /// Pause between two uploads, ms (default: 15m ± 30m)
    pub upload_delay_ms: NormalSpec,

    /// Payload size of uploaded chunks in bytes (default: 32000 ± 32000)
    pub data_size: NormalSpec,

    /// Fraction of all users interested in a new upload (default: 0.3 ± 0.1)
    pub attraction_ratio: NormalSpec,

    /// Pause between two queries, ms (default: 5m ± 10m)
    pub query_pause_ms: NormalSpec,

    /// A query without answer after this time counts as failed (default: 5m)
    pub query_waiting_timeout_ms: SimTime,
}

impl Default for UserBehaviour {
    fn default() -> Self {
        Self {
            startup_ms: NormalSpec::duration(8 * MS_PER_HOUR, 2 * MS_PER_HOUR),
            online_ms: NormalSpec::duration(2 * MS_PER_HOUR, 2 * MS_PER_HOUR),
            upload_delay_ms: NormalSpec::duration(15 * MS_PER_MINUTE, 30 * MS_PER_MINUTE),
            data_size: NormalSpec::new(32000.0, 32000.0),
            attraction_ratio: NormalSpec::new(0.3, 0.1),
            query_pause_ms: NormalSpec::duration(5 * MS_PER_MINUTE, 10 * MS_PER_MINUTE),
            query_waiting_timeout_ms: 5 * MS_PER_MINUTE,
        }
    }
}
