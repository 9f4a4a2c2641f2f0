// Decision strategies injected into a node
//
// Strategies never fail. When in doubt they reject or select nothing.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::ps_config::NodeConfig;
use crate::ps_distance::PeerDistanceCalculator;
use crate::ps_interface::{Chunk, ConnectorRef, Key, PeerId, Query, SimTime};
use crate::ps_node::PeerConnections;

pub trait ConnectionStrategy {
    fn is_connection_accepted_with(&self, candidate: &ConnectorRef, connections: &PeerConnections) -> bool;

    /// Peers from `all_known` to request connections with
    fn peers_to_connect(&self, all_known: &[ConnectorRef], connections: &PeerConnections) -> Vec<ConnectorRef>;
}

pub trait DataStrategy {
    fn is_chunk_accepted(&self, chunk: &Chunk, origin: PeerId) -> bool;

    fn forward_targets_for(&self, connected: &[ConnectorRef], key: &Key, origin: PeerId) -> Vec<ConnectorRef>;
}

pub trait QueryStrategy {
    fn is_query_accepted(&self, query: &Query, receiver: PeerId) -> bool;

    fn forward_targets_for(&self, connected: &[ConnectorRef], receiver: PeerId, query: &Query) -> Vec<ConnectorRef>;

    /// How long a pending query waits for data
    fn timeout_for(&self, query: &Query) -> SimTime;
}

pub trait AnnouncementStrategy {
    fn peers_to_announce(&self, known: &[ConnectorRef], receiver: PeerId) -> Vec<ConnectorRef>;
}

// ============================================================================
// Connections
// ============================================================================

/// Accepts peers while `connected + connecting < max_connections`; picks a
/// random subset when more peers are known than fit
pub struct MaxConnectionsStrategy {
    max_connections: usize,
    rng: RefCell<StdRng>,
}

impl MaxConnectionsStrategy {
    pub fn new(max_connections: usize, rng: StdRng) -> Self {
        Self {
            max_connections,
            rng: RefCell::new(rng),
        }
    }

    pub fn from_config(config: &NodeConfig, rng: StdRng) -> Self {
        Self::new(config.max_connections, rng)
    }
}

impl ConnectionStrategy for MaxConnectionsStrategy {
    fn is_connection_accepted_with(&self, _candidate: &ConnectorRef, connections: &PeerConnections) -> bool {
        connections.count() < self.max_connections
    }

    fn peers_to_connect(&self, all_known: &[ConnectorRef], connections: &PeerConnections) -> Vec<ConnectorRef> {
        let mut candidates: Vec<ConnectorRef> = all_known
            .iter()
            .filter(|peer| !connections.contains(peer.id()))
            .cloned()
            .collect();

        if candidates.len() > self.max_connections {
            candidates.shuffle(&mut *self.rng.borrow_mut());
            candidates.truncate(self.max_connections);
        }

        candidates
    }
}

// ============================================================================
// Data
// ============================================================================

/// Directed flooding: forward to every connected peer closer to the key than
/// this node
pub struct ClosenessDataStrategy {
    local_peer: PeerId,
    max_chunk_size: usize,
    distance: Rc<dyn PeerDistanceCalculator>,
}

impl ClosenessDataStrategy {
    pub fn new(local_peer: PeerId, max_chunk_size: usize, distance: Rc<dyn PeerDistanceCalculator>) -> Self {
        Self {
            local_peer,
            max_chunk_size,
            distance,
        }
    }

    pub fn from_config(local_peer: PeerId, config: &NodeConfig, distance: Rc<dyn PeerDistanceCalculator>) -> Self {
        Self::new(local_peer, config.max_chunk_size, distance)
    }
}

impl DataStrategy for ClosenessDataStrategy {
    fn is_chunk_accepted(&self, chunk: &Chunk, _origin: PeerId) -> bool {
        chunk.size() <= self.max_chunk_size
    }

    fn forward_targets_for(&self, connected: &[ConnectorRef], key: &Key, origin: PeerId) -> Vec<ConnectorRef> {
        let local = self.distance.distance(self.local_peer, key);

        connected
            .iter()
            .filter(|peer| peer.id() != origin)
            .filter(|peer| self.distance.distance(peer.id(), key) < local)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Forwards queries towards peers closer to any of the buckets the query
/// covers. Wider queries wait longer.
pub struct ClosenessQueryStrategy {
    local_peer: PeerId,
    query_timeout_ms: SimTime,
    distance: Rc<dyn PeerDistanceCalculator>,
}

impl ClosenessQueryStrategy {
    pub fn new(local_peer: PeerId, query_timeout_ms: SimTime, distance: Rc<dyn PeerDistanceCalculator>) -> Self {
        Self {
            local_peer,
            query_timeout_ms,
            distance,
        }
    }

    pub fn from_config(local_peer: PeerId, config: &NodeConfig, distance: Rc<dyn PeerDistanceCalculator>) -> Self {
        Self::new(local_peer, config.query_timeout_ms, distance)
    }

    fn min_distance(&self, peer: PeerId, query: &Query) -> Option<u64> {
        self.distance.distances(peer, query).into_iter().min()
    }
}

impl QueryStrategy for ClosenessQueryStrategy {
    fn is_query_accepted(&self, query: &Query, _receiver: PeerId) -> bool {
        query.time_from <= query.time_to
    }

    fn forward_targets_for(&self, connected: &[ConnectorRef], receiver: PeerId, query: &Query) -> Vec<ConnectorRef> {
        let Some(local) = self.min_distance(self.local_peer, query) else {
            return Vec::new();
        };

        connected
            .iter()
            .filter(|peer| peer.id() != receiver)
            .filter(|peer| matches!(self.min_distance(peer.id(), query), Some(d) if d < local))
            .cloned()
            .collect()
    }

    fn timeout_for(&self, query: &Query) -> SimTime {
        let buckets = self.distance.distances(self.local_peer, query).len().max(1);
        self.query_timeout_ms.saturating_mul(buckets as SimTime)
    }
}

// ============================================================================
// Announcements
// ============================================================================

pub struct RandomAnnouncementStrategy {
    max_announced_peers: usize,
    rng: RefCell<StdRng>,
}

impl RandomAnnouncementStrategy {
    pub fn new(max_announced_peers: usize, rng: StdRng) -> Self {
        Self {
            max_announced_peers,
            rng: RefCell::new(rng),
        }
    }

    pub fn from_config(config: &NodeConfig, rng: StdRng) -> Self {
        Self::new(config.max_announced_peers, rng)
    }
}

impl AnnouncementStrategy for RandomAnnouncementStrategy {
    fn peers_to_announce(&self, known: &[ConnectorRef], receiver: PeerId) -> Vec<ConnectorRef> {
        let candidates: Vec<&ConnectorRef> = known.iter().filter(|peer| peer.id() != receiver).collect();

        candidates
            .choose_multiple(&mut *self.rng.borrow_mut(), self.max_announced_peers)
            .map(|peer| Rc::clone(peer))
            .collect()
    }
}
