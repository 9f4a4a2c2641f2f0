// Content Distribution Simulator Module

pub mod activity;
pub mod config;
pub mod environment;
pub mod measure;
pub mod stats;
pub mod user;

// Re-export commonly used types
pub use config::{
    NormalSpec,
    SimulationConfig,
    UserBehaviour,
};

pub use stats::{
    SimulationResult,
    NetworkSnapshot,
    QueryStats,
};

pub use environment::{Environment, SetupError};
