//! # ps_rust - Peer Space Content Distribution
//!
//! Nodes of a peer-to-peer network that store, forward, and look up
//! immutable chunks of data. Every chunk has a key; nodes keep and forward
//! chunks whose key is close to their own id, and route queries toward the
//! peers closest to the requested key.
//!
//! ## Core Components
//!
//! - **Node**: connection handling, data forwarding, and query routing
//! - **Strategies**: pluggable policies for connections, data, queries, and peer announcements
//! - **PeerDistanceRelated**: hash-based distance between peers and keys, storage priorities
//! - **MemChunkStorage / MemStateStorage**: in-memory storage with priority-based eviction
//! - **EventScheduler / Network**: discrete-event time and a latency/bandwidth network model
//!
//! ## Usage
//!
//! All peers run on one thread and call each other through `Rc<dyn Connector>`.
//! Wrap peers with `Network::wrap` to deliver those calls as scheduled events:
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use rand::{rngs::StdRng, SeedableRng};
//! use ps_rust::ps_config::NodeConfig;
//! use ps_rust::ps_distance::PeerDistanceRelated;
//! use ps_rust::ps_interface::Clock;
//! use ps_rust::ps_memory_backend::{MemChunkStorage, MemStateStorage};
//! use ps_rust::ps_scheduler::EventScheduler;
//! use ps_rust::ps_strategy::*;
//! use ps_rust::NodeBuilder;
//!
//! let scheduler = Rc::new(EventScheduler::new());
//! let clock: Rc<dyn Clock> = scheduler.clone();
//! let config = NodeConfig::default();
//! let distance = Rc::new(PeerDistanceRelated::new(1, clock.clone()));
//!
//! let node = NodeBuilder::new(1)
//!     .clock(clock.clone())
//!     .data_storage(Rc::new(RefCell::new(MemChunkStorage::new(1 << 20, distance.clone(), clock))))
//!     .state_storage(Rc::new(RefCell::new(MemStateStorage::new())))
//!     .connection_strategy(Box::new(MaxConnectionsStrategy::from_config(&config, StdRng::seed_from_u64(1))))
//!     .data_strategy(Box::new(ClosenessDataStrategy::from_config(1, &config, distance.clone())))
//!     .query_strategy(Box::new(ClosenessQueryStrategy::from_config(1, &config, distance)))
//!     .announcement_strategy(Box::new(RandomAnnouncementStrategy::from_config(&config, StdRng::seed_from_u64(2))))
//!     .config(config)
//!     .build()
//!     .unwrap();
//!
//! node.startup();
//! scheduler.run();
//! ```
//!
//! ## Simulation
//!
//! The `simulator/` directory holds a user-behaviour simulation on top of
//! these components, driven by YAML scenarios (`scenario_runner`).

// Protocol
pub mod ps_interface;
pub mod ps_config;
pub mod ps_distance;
pub mod ps_strategy;
pub mod ps_node;

// Storage backends
pub mod ps_memory_backend;

// Simulation support
pub mod ps_scheduler;
pub mod ps_network;
pub mod ps_randvar;

// Re-export commonly used types
pub use ps_config::NodeConfig;
pub use ps_interface::{
    Chunk, Clock, Connector, ConnectorRef, DataId, DataStorage, Key, PeerId, Pusher, PusherRef, Query,
    SimTime, StateStorage,
};
pub use ps_node::{Node, NodeBuilder, NodeError};
