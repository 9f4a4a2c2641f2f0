// Scenario Runner - Load and execute scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/small_swarm.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/small_swarm.yaml --seed 4711

mod simulation;

use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use simple_logger::SimpleLogger;

use simulation::{Environment, SimulationConfig};

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Everything not given keeps its default
    #[serde(default)]
    config: SimulationConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/small_swarm.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/small_swarm.yaml --seed 4711", args[0]);
        std::process::exit(1);
    }

    if let Err(e) = SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .with_module_level("ps_rust", LevelFilter::Warn)
        .init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed = if args.len() >= 4 && args[2] == "--seed" {
        match parse_seed(&args[3]) {
            Some(seed) => Some(seed),
            None => {
                eprintln!("Invalid seed: {}", args[3]);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let scenarios = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        find_scenarios(path)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", path.display());
        std::process::exit(1);
    }

    if scenarios.len() > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
        println!("╚════════════════════════════════════════════════════════╝\n");
        println!("Found {} scenario(s) to run\n", scenarios.len());
    }

    let mut failed = 0;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        if scenarios.len() > 1 {
            println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        }
        if let Err(e) = run_scenario_file(scenario_path, seed) {
            eprintln!("Scenario {} failed: {}", scenario_path.display(), e);
            failed += 1;
        }
    }

    if scenarios.len() > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  All scenarios complete!                               ║");
        println!("╚════════════════════════════════════════════════════════╝\n");
    }

    if failed > 0 {
        std::process::exit(1);
    }
}

fn find_scenarios(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| matches!(path.extension().and_then(|s| s.to_str()), Some("yaml" | "yml")))
            .collect(),
        Err(_) => Vec::new(),
    };
    scenarios.sort();
    scenarios
}

fn load_scenario(path: &Path) -> Result<ScenarioFile, Box<dyn Error>> {
    let yaml_content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&yaml_content)?)
}

fn run_scenario_file(path: &Path, seed: Option<u64>) -> Result<(), Box<dyn Error>> {
    println!("Loading scenario from: {}", path.display());
    let scenario = load_scenario(path)?;

    // Print scenario header
    let name = scenario
        .meta
        .name
        .clone()
        .or_else(|| path.file_stem().and_then(|s| s.to_str()).map(String::from))
        .unwrap_or_else(|| "Scenario".to_string());
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    if let Some(seed) = seed {
        config.seed = seed;
    }

    println!("Configuration:");
    println!("  Users: {}", config.num_users);
    println!("  Duration: {:.2} h", config.duration_ms as f64 / 3_600_000.0);
    println!("  Max Connections: {} (seed node: {})", config.node.max_connections, config.seed_node_max_connections);
    println!("  Network: {} ms latency, {} B/s", config.network.latency_ms, config.network.bandwidth);
    println!("  Storage: {} KiB per node", config.storage_capacity / 1024);
    println!("  Seed: {}", config.seed);
    println!("\nStarting simulation...\n");

    let env = Environment::new(config)?;
    let result = env.run();

    result.print_summary();

    println!("\n✓ Scenario complete!\n");
    Ok(())
}

/// Decimal or 0x-prefixed hex
fn parse_seed(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
