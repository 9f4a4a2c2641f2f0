// Distance and priority calculation
//
// Distances are XOR distances of 64 bit hashes. Timed keys are hashed together
// with the index of the age bucket they currently fall into, so a chunk slowly
// moves through the address space as it ages:
//
//   bucket 1: [0, 1 day)   bucket 4: [30, 365 days)
//   bucket 2: [1, 7 days)  bucket 5: [365, 3650 days)
//   bucket 3: [7, 30 days) bucket 6: 3650 days and older
//
// Within a bucket the distance does not change. After ten years the key stays
// in the last bucket forever.

use std::rc::Rc;

use crate::ps_interface::{
    Chunk, Clock, DataId, Key, PeerId, PriorityGenerator, Query, SimTime, MS_PER_DAY,
    SIM_TIME_MAX, UNTIMED,
};

/// Upper bounds (exclusive, in days) of the age buckets. Keys older than the
/// last bound share one final bucket.
const AGE_LADDER_DAYS: [u64; 5] = [1, 7, 30, 365, 3650];

const OLDEST_BUCKET: u8 = AGE_LADDER_DAYS.len() as u8 + 1;

// ============================================================================
// Hashing
// ============================================================================

/// 64 bit hash over identifier bytes
pub trait IdHasher {
    fn hash64(&self, bytes: &[u8]) -> u64;
}

/// Lower 64 bits of a Blake3 digest
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl IdHasher for Blake3Hasher {
    fn hash64(&self, bytes: &[u8]) -> u64 {
        let hash = blake3::hash(bytes);
        let mut low = [0u8; 8];
        low.copy_from_slice(&hash.as_bytes()[0..8]);
        u64::from_le_bytes(low)
    }
}

// ============================================================================
// Age Ladder
// ============================================================================

/// Index (1-based) of the bucket an age falls into
pub fn age_bucket(age: SimTime) -> u8 {
    AGE_LADDER_DAYS
        .iter()
        .position(|&days| age < days * MS_PER_DAY)
        .map(|idx| idx as u8 + 1)
        .unwrap_or(OLDEST_BUCKET)
}

/// Age range `[lower, upper)` of a bucket in ms. `None` upper bound for the
/// oldest bucket.
fn bucket_age_range(bucket: u8) -> (SimTime, Option<SimTime>) {
    let idx = bucket as usize - 1;
    let lower = if idx == 0 {
        0
    } else {
        AGE_LADDER_DAYS[idx - 1] * MS_PER_DAY
    };
    let upper = AGE_LADDER_DAYS.get(idx).map(|days| days * MS_PER_DAY);
    (lower, upper)
}

// ============================================================================
// Distance Calculator
// ============================================================================

/// Distances between an identifier and data keys or queries
pub trait PeerDistanceCalculator {
    fn distance(&self, peer: PeerId, key: &Key) -> u64;

    /// One distance per age bucket the query window covers, youngest first
    fn distances(&self, peer: PeerId, query: &Query) -> Vec<u64>;
}

/// Hash-XOR distances with time ladder, plus storage priorities relative to
/// the local peer
pub struct PeerDistanceRelated {
    local_peer: PeerId,
    hasher: Box<dyn IdHasher>,
    clock: Rc<dyn Clock>,
}

impl PeerDistanceRelated {
    pub fn new(local_peer: PeerId, clock: Rc<dyn Clock>) -> Self {
        Self::with_hasher(local_peer, clock, Box::new(Blake3Hasher))
    }

    pub fn with_hasher(local_peer: PeerId, clock: Rc<dyn Clock>, hasher: Box<dyn IdHasher>) -> Self {
        Self {
            local_peer,
            hasher,
            clock,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn id_hash(&self, id: DataId) -> u64 {
        self.hasher.hash64(&id.to_le_bytes())
    }

    fn bucket_hash(&self, id: DataId, bucket: u8) -> u64 {
        let mut bytes = [0u8; 9];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        bytes[8] = bucket;
        self.hasher.hash64(&bytes)
    }

    fn age_of(&self, timestamp: SimTime) -> SimTime {
        self.clock.time().saturating_sub(timestamp)
    }

    fn key_hash(&self, key: &Key) -> u64 {
        if key.is_timed() {
            self.bucket_hash(key.id, age_bucket(self.age_of(key.timestamp)))
        } else {
            self.id_hash(key.id)
        }
    }

    /// Time at which the chunk moves into its next age bucket
    fn expiration(&self, key: &Key) -> SimTime {
        if !key.is_timed() {
            return SIM_TIME_MAX;
        }

        let bucket = age_bucket(self.age_of(key.timestamp));
        match bucket_age_range(bucket).1 {
            Some(upper) => key.timestamp.saturating_add(upper),
            None => SIM_TIME_MAX,
        }
    }
}

impl PeerDistanceCalculator for PeerDistanceRelated {
    fn distance(&self, peer: PeerId, key: &Key) -> u64 {
        self.id_hash(peer) ^ self.key_hash(key)
    }

    fn distances(&self, peer: PeerId, query: &Query) -> Vec<u64> {
        if query.time_from > query.time_to {
            return Vec::new();
        }

        if query.is_untimed() {
            return vec![self.distance(peer, &Key::untimed(query.id))];
        }

        if query.time_from == query.time_to {
            return vec![self.distance(peer, &Key::timed(query.id, query.time_from))];
        }

        let now = self.clock.time() as i128;
        let from = query.time_from as i128;
        let to = query.time_to as i128;
        let peer_hash = self.id_hash(peer);

        let mut distances: Vec<u64> = (1..=OLDEST_BUCKET)
            .filter(|&bucket| {
                let (lower, upper) = bucket_age_range(bucket);
                // timestamps of the bucket: (now - upper, now - lower]
                let youngest = now - lower as i128;
                let oldest_excl = upper.map(|u| now - u as i128).unwrap_or(i128::MIN);
                youngest >= 0 && youngest >= from && oldest_excl < to
            })
            .map(|bucket| peer_hash ^ self.bucket_hash(query.id, bucket))
            .collect();

        // a window starting at UNTIMED also matches the untimed key
        if query.time_from == UNTIMED {
            distances.push(self.distance(peer, &Key::untimed(query.id)));
        }
        distances
    }
}

impl PriorityGenerator for PeerDistanceRelated {
    fn priority(&self, chunk: &Chunk) -> (f64, SimTime) {
        // distance 0 is rated like distance 1
        let distance = self.distance(self.local_peer, &chunk.key).max(1);
        let closeness = (u64::MAX as f64 / distance as f64).log2();
        let freshness = self.clock.time() as f64 / MS_PER_DAY as f64;

        (closeness + 1.0 + freshness, self.expiration(&chunk.key))
    }
}
