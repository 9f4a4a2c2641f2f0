// Content Distribution Simulator Statistics

use std::rc::Rc;

use ps_rust::ps_interface::SimTime;

use super::user::{SimulationMeasures, User};

// ============================================================================
// Simulation Result
// ============================================================================

/// Complete simulation result
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Configuration summary
    pub config_summary: String,

    /// Random seed used
    pub seed_used: u64,

    /// Simulated time at the end of the run (ms)
    pub end_time: SimTime,

    /// Users at the end of the simulation
    pub final_state: NetworkSnapshot,

    /// Snapshots taken at every progress interval
    pub history: Vec<NetworkSnapshot>,

    pub uploads: usize,

    pub queries: QueryStats,
}

// ============================================================================
// Network Snapshot
// ============================================================================

/// State of all users at one point in simulated time
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub time: SimTime,
    pub users: usize,
    pub online_users: usize,

    /// Connections of online users
    pub min_connected_peers: usize,
    pub max_connected_peers: usize,
    pub avg_connected_peers: f64,

    /// Queries waiting in the nodes of all users
    pub pending_queries: usize,
}

impl NetworkSnapshot {
    pub fn capture(time: SimTime, users: &[Rc<User>]) -> Self {
        let online: Vec<usize> = users
            .iter()
            .filter(|user| user.is_online())
            .map(|user| user.node().connected_peers().len())
            .collect();

        let avg_connected_peers = if online.is_empty() {
            0.0
        } else {
            online.iter().sum::<usize>() as f64 / online.len() as f64
        };

        Self {
            time,
            users: users.len(),
            online_users: online.len(),
            min_connected_peers: online.iter().copied().min().unwrap_or(0),
            max_connected_peers: online.iter().copied().max().unwrap_or(0),
            avg_connected_peers,
            pending_queries: users.iter().map(|user| user.node().pending_query_count()).sum(),
        }
    }
}

// ============================================================================
// Query Statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct QueryStats {
    pub issued: usize,
    pub answered: usize,
    pub timed_out: usize,

    /// Answered share of all finished queries, NaN if none finished
    pub success_rate: f64,

    /// Time to the first answer (ms)
    pub avg_duration_ms: f64,
    pub duration_std_dev_ms: f64,
}

impl QueryStats {
    pub fn from_measures(measures: &SimulationMeasures) -> Self {
        let answered = measures.query_duration.count();
        let finished = measures.query_success.count();

        Self {
            issued: measures.queries,
            answered,
            timed_out: finished - answered,
            success_rate: measures.query_success.mean(),
            avg_duration_ms: measures.query_duration.mean(),
            duration_std_dev_ms: measures.query_duration.std_dev(),
        }
    }

    /// Queries neither answered nor timed out yet
    pub fn open(&self) -> usize {
        self.issued.saturating_sub(self.answered + self.timed_out)
    }
}

impl SimulationResult {
    /// Print summary to stdout
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    CONTENT DISTRIBUTION SIMULATION RESULTS             ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration: {}", self.config_summary);
        println!("Seed: {}", self.seed_used);
        println!("Simulated Time: {:.2} h", self.end_time as f64 / 3_600_000.0);
        println!();

        let state = &self.final_state;
        println!("═══ Final State ═══");
        println!("  Users: {} total, {} online", state.users, state.online_users);
        println!(
            "  Connected Peers: min={}, max={}, avg={:.1}",
            state.min_connected_peers, state.max_connected_peers, state.avg_connected_peers
        );
        println!("  Pending Node Queries: {}", state.pending_queries);
        println!();

        let queries = &self.queries;
        println!("═══ Content ═══");
        println!("  Uploads: {}", self.uploads);
        println!("  Queries Issued: {}", queries.issued);
        println!("  Answered: {}", queries.answered);
        println!("  Timed Out: {}", queries.timed_out);
        println!("  Still Open: {}", queries.open());
        if !queries.success_rate.is_nan() {
            println!("  Success Rate: {:.1}%", queries.success_rate * 100.0);
        }
        if queries.answered > 0 {
            println!(
                "  Answer Time: avg={:.0} ms, std_dev={:.0} ms",
                queries.avg_duration_ms, queries.duration_std_dev_ms
            );
        }
        println!();

        if !self.history.is_empty() {
            println!("═══ Online Users Over Time ═══");
            for snapshot in &self.history {
                println!(
                    "  {:>8.2} h: {:>5} online, avg {:.1} connections",
                    snapshot.time as f64 / 3_600_000.0,
                    snapshot.online_users,
                    snapshot.avg_connected_peers
                );
            }
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_stats_without_queries() {
        let stats = QueryStats::from_measures(&SimulationMeasures::default());

        assert_eq!(stats.issued, 0);
        assert_eq!(stats.open(), 0);
        assert!(stats.success_rate.is_nan());
        assert!(stats.avg_duration_ms.is_nan());
    }

    #[test]
    fn test_query_stats_counts_outcomes() {
        let mut measures = SimulationMeasures {
            queries: 5,
            ..SimulationMeasures::default()
        };
        for duration in [100.0, 300.0] {
            measures.query_duration.add_sample(duration);
            measures.query_success.add_sample(1.0);
        }
        measures.query_success.add_sample(0.0);
        measures.query_success.add_sample(0.0);

        let stats = QueryStats::from_measures(&measures);

        assert_eq!(stats.answered, 2);
        assert_eq!(stats.timed_out, 2);
        assert_eq!(stats.open(), 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.avg_duration_ms, 200.0);
    }

    #[test]
    fn test_snapshot_of_no_users() {
        let snapshot = NetworkSnapshot::capture(10, &[]);

        assert_eq!(snapshot.online_users, 0);
        assert_eq!(snapshot.min_connected_peers, 0);
        assert_eq!(snapshot.avg_connected_peers, 0.0);
    }
}
