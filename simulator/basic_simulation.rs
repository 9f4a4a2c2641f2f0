//! Basic content distribution simulation
//!
//! Run with: cargo run --example basic_simulation

use std::error::Error;

use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

mod simulation;
use simulation::{Environment, NormalSpec, SimulationConfig};

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .with_module_level("ps_rust", LevelFilter::Warn)
        .init()?;

    info!("Setting up simulation...");

    let mut config = SimulationConfig {
        num_users: 100,
        duration_ms: 24 * 3_600_000,
        seed: 42,
        ..SimulationConfig::default()
    };
    config.node.max_connections = 20;
    config.users.online_ms = NormalSpec::new(4.0 * 3_600_000.0, 2.0 * 3_600_000.0);

    let env = Environment::new(config)?;

    info!("Starting simulation...");
    let result = env.run();

    info!("Simulation complete!");
    info!(
        "Peers: max: {} min: {} avg: {:.1}",
        result.final_state.max_connected_peers,
        result.final_state.min_connected_peers,
        result.final_state.avg_connected_peers
    );
    if result.queries.answered > 0 {
        info!(
            "Queries: {} issued, {:.1}% answered in {:.0} ms on average",
            result.queries.issued,
            result.queries.success_rate * 100.0,
            result.queries.avg_duration_ms
        );
    } else {
        info!("Queries: {} issued, NONE answered", result.queries.issued);
    }

    result.print_summary();
    Ok(())
}
