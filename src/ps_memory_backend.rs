// In-memory storage backends for chunks and peer knowledge
//
// Used by the simulator and by tests. Nothing here survives a restart of the
// process.

use std::rc::Rc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::trace;

use crate::ps_interface::{
    Chunk, Clock, ConnectorRef, DataStorage, Key, PeerId, PriorityGenerator, Query, SimTime,
    StateStorage,
};

// ============================================================================
// In-Memory Chunk Storage
// ============================================================================

struct StoredChunk {
    chunk: Rc<Chunk>,
    priority: f64,
    expiration: SimTime,
}

/// Chunk storage bounded by the total payload size
///
/// Every chunk is rated by a `PriorityGenerator` when it arrives. When the
/// storage is full, the lowest rated chunks make room for a new chunk, but
/// only if they are rated lower than the new one. Ratings that have expired
/// are refreshed before anything is evicted.
///
/// # Performance Characteristics
/// - Store without eviction: O(1)
/// - Store with eviction: O(n log n)
/// - Query: O(n)
pub struct MemChunkStorage {
    chunks: HashMap<Key, StoredChunk>,
    capacity: usize,
    used: usize,
    priority_generator: Rc<dyn PriorityGenerator>,
    clock: Rc<dyn Clock>,
}

impl MemChunkStorage {
    pub fn new(capacity: usize, priority_generator: Rc<dyn PriorityGenerator>, clock: Rc<dyn Clock>) -> Self {
        Self {
            chunks: HashMap::new(),
            capacity,
            used: 0,
            priority_generator,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Payload bytes currently stored
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.chunks.contains_key(key)
    }

    fn refresh_expired_priorities(&mut self) {
        let now = self.clock.time();
        for stored in self.chunks.values_mut() {
            if stored.expiration <= now {
                let (priority, expiration) = self.priority_generator.priority(&stored.chunk);
                stored.priority = priority;
                stored.expiration = expiration;
            }
        }
    }

    /// Keys to evict so that `needed` more bytes fit, all rated below
    /// `priority`. None if that is not possible.
    fn eviction_candidates(&self, needed: usize, priority: f64) -> Option<Vec<Key>> {
        let mut by_priority: Vec<(&Key, &StoredChunk)> = self
            .chunks
            .iter()
            .filter(|(_, stored)| stored.priority < priority)
            .collect();
        by_priority.sort_by(|a, b| a.1.priority.total_cmp(&b.1.priority).then(a.0.cmp(b.0)));

        let mut free = self.capacity - self.used;
        let mut evicted = Vec::new();
        for (key, stored) in by_priority {
            if free >= needed {
                break;
            }
            free += stored.chunk.size();
            evicted.push(*key);
        }

        (free >= needed).then_some(evicted)
    }
}

impl DataStorage for MemChunkStorage {
    fn consider_storage(&mut self, chunk: Rc<Chunk>) {
        let size = chunk.size();
        if size > self.capacity || self.chunks.contains_key(&chunk.key) {
            return;
        }

        let (priority, expiration) = self.priority_generator.priority(&chunk);

        if self.used + size > self.capacity {
            self.refresh_expired_priorities();
            let Some(evicted) = self.eviction_candidates(size, priority) else {
                trace!("not storing {}: priority {:.2} too low", chunk.key, priority);
                return;
            };
            for key in evicted {
                if let Some(stored) = self.chunks.remove(&key) {
                    self.used -= stored.chunk.size();
                    trace!("evicted {} (priority {:.2})", key, stored.priority);
                }
            }
        }

        self.used += size;
        self.chunks.insert(
            chunk.key,
            StoredChunk {
                chunk,
                priority,
                expiration,
            },
        );
    }

    fn query(&self, query: &Query) -> Vec<Rc<Chunk>> {
        let mut result: Vec<Rc<Chunk>> = self
            .chunks
            .values()
            .filter(|stored| query.matches(&stored.chunk.key))
            .map(|stored| stored.chunk.clone())
            .collect();
        result.sort_by_key(|chunk| chunk.key.timestamp);
        result
    }
}

// ============================================================================
// In-Memory State Storage
// ============================================================================

/// Known peers in the order they were learned, one entry per peer id
#[derive(Default)]
pub struct MemStateStorage {
    peers: IndexMap<PeerId, ConnectorRef>,
}

impl MemStateStorage {
    pub fn new() -> Self {
        Self {
            peers: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl StateStorage for MemStateStorage {
    fn get_all_known_peers(&self) -> Vec<ConnectorRef> {
        self.peers.values().cloned().collect()
    }

    fn add_known_peer(&mut self, peer: ConnectorRef) {
        self.peers.entry(peer.id()).or_insert(peer);
    }

    fn is_known_peer(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }
}
