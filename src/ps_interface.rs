use std::fmt;
use std::rc::Rc;

// all identifiers share one address space so distances can be taken between
// peers and data
pub type PeerId = u64;
pub type DataId = PeerId;

/// Virtual time in milliseconds
pub type SimTime = u64;

/// "Never" - used for priorities that do not expire
pub const SIM_TIME_MAX: SimTime = u64::MAX;

/// Key timestamp marking data without a temporal dimension
pub const UNTIMED: SimTime = 0;

pub const MS_PER_SECOND: SimTime = 1_000;
pub const MS_PER_DAY: SimTime = 24 * 60 * 60 * MS_PER_SECOND;

// ============================================================================
// Data Model
// ============================================================================

/// Position of a chunk in the address space plus an optional point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub id: DataId,
    pub timestamp: SimTime,
}

impl Key {
    pub fn untimed(id: DataId) -> Self {
        Self {
            id,
            timestamp: UNTIMED,
        }
    }

    pub fn timed(id: DataId, timestamp: SimTime) -> Self {
        Self { id, timestamp }
    }

    pub fn is_timed(&self) -> bool {
        self.timestamp != UNTIMED
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_timed() {
            write!(f, "{:016x}@{}", self.id, self.timestamp)
        } else {
            write!(f, "{:016x}", self.id)
        }
    }
}

/// Immutable unit of content. Shared between nodes as `Rc<Chunk>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub key: Key,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(key: Key, data: Vec<u8>) -> Self {
        Self { key, data }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Request for all chunks with a given id inside a time window.
///
/// `time_from == time_to` is an exact (point) query, `0..=0` asks for the
/// untimed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Query {
    pub id: DataId,
    pub time_from: SimTime,
    pub time_to: SimTime,
}

impl Query {
    pub fn untimed(id: DataId) -> Self {
        Self::range(id, UNTIMED, UNTIMED)
    }

    pub fn range(id: DataId, time_from: SimTime, time_to: SimTime) -> Self {
        Self {
            id,
            time_from,
            time_to,
        }
    }

    /// Point query matching exactly the given key
    pub fn exactly(key: Key) -> Self {
        Self::range(key.id, key.timestamp, key.timestamp)
    }

    pub fn is_untimed(&self) -> bool {
        self.time_from == UNTIMED && self.time_to == UNTIMED
    }

    pub fn matches(&self, key: &Key) -> bool {
        self.id == key.id && self.time_from <= key.timestamp && key.timestamp <= self.time_to
    }

    /// True if the key is the only one this query can ever match
    pub fn matches_only(&self, key: &Key) -> bool {
        self.id == key.id && self.time_from == key.timestamp && self.time_to == key.timestamp
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_untimed() {
            write!(f, "{:016x}", self.id)
        } else {
            write!(f, "{:016x}@[{},{}]", self.id, self.time_from, self.time_to)
        }
    }
}

// ============================================================================
// Peer Contract
// ============================================================================

pub type PusherRef = Rc<dyn Pusher>;
pub type ConnectorRef = Rc<dyn Connector>;

/// Anything chunks can be delivered to: nodes, users, network wrappers.
///
/// Peers are compared by id, never by content.
pub trait Pusher {
    fn id(&self) -> PeerId;

    /// Deliver a chunk. `origin` is the id of the sender.
    fn push(&self, chunk: Rc<Chunk>, origin: PeerId);

    /// Full protocol view of this pusher, if it is a peer and not just a sink
    fn as_connector(&self) -> Option<ConnectorRef> {
        None
    }
}

/// The node-to-node protocol. All calls are fire-and-forget; answers come
/// back as calls on the peers passed in.
pub trait Connector: Pusher {
    fn query(&self, query: Query, receiver: PusherRef);

    fn request_connection_with(&self, peer: ConnectorRef);

    fn close_connection_with(&self, peer: ConnectorRef);

    /// Ask for known peers. The answer arrives as `receiver.announce_peers`.
    fn request_peers(&self, receiver: ConnectorRef);

    fn announce_peers(&self, from: ConnectorRef, peers: Vec<ConnectorRef>);
}

pub fn contains_peer<P: Pusher + ?Sized>(peers: &[Rc<P>], id: PeerId) -> bool {
    peers.iter().any(|p| p.id() == id)
}

pub fn peer_ids<P: Pusher + ?Sized>(peers: &[Rc<P>]) -> Vec<PeerId> {
    peers.iter().map(|p| p.id()).collect()
}

// ============================================================================
// Collaborators
// ============================================================================

/// Local chunk store. May drop whatever it likes.
pub trait DataStorage {
    fn consider_storage(&mut self, chunk: Rc<Chunk>);

    /// All locally held chunks matching the query
    fn query(&self, query: &Query) -> Vec<Rc<Chunk>>;
}

/// Persistent knowledge about other peers
pub trait StateStorage {
    fn get_all_known_peers(&self) -> Vec<ConnectorRef>;

    fn add_known_peer(&mut self, peer: ConnectorRef);

    fn is_known_peer(&self, peer: PeerId) -> bool;
}

pub trait Clock {
    fn time(&self) -> SimTime;
}

/// Storage retention score for a chunk and the time the score becomes stale
pub trait PriorityGenerator {
    fn priority(&self, chunk: &Chunk) -> (f64, SimTime);
}
