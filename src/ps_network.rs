// Simulated network between peers
//
// Every peer is reached through exactly one NetworkConnector. Calls on the
// connector are not executed right away but scheduled on the event scheduler
// after latency + size / bandwidth. Calls from the same sender through the
// same connector are serialized: a call starts transferring only after the
// previous one was delivered.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use log::warn;

use crate::ps_interface::{
    Chunk, Connector, ConnectorRef, PeerId, Pusher, PusherRef, Query, SimTime, MS_PER_SECOND,
};
use crate::ps_scheduler::EventScheduler;

/// Transfer size of one peer in an announcement
const ANNOUNCED_PEER_SIZE: usize = std::mem::size_of::<PeerId>();

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct NetworkProperties {
    /// Fixed delay of every call (default: 50 ms)
    pub latency_ms: SimTime,

    /// Bytes per second, 0 for unlimited (default: 1 MB/s)
    pub bandwidth: u64,
}

impl NetworkProperties {
    /// Time a call of `size` bytes spends on the wire
    pub fn transfer_time(&self, size: usize) -> SimTime {
        let transmission = if self.bandwidth == 0 {
            0
        } else {
            size as SimTime * MS_PER_SECOND / self.bandwidth
        };
        self.latency_ms + transmission
    }
}

impl Default for NetworkProperties {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            bandwidth: 1_000_000,
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// Hands out one connector per peer id
pub struct Network {
    this: Weak<Network>,
    scheduler: Rc<EventScheduler>,
    properties: NetworkProperties,
    connectors: RefCell<HashMap<PeerId, Rc<NetworkConnector>>>,
}

impl Network {
    pub fn new(scheduler: Rc<EventScheduler>, properties: NetworkProperties) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            scheduler,
            properties,
            connectors: RefCell::new(HashMap::new()),
        })
    }

    pub fn properties(&self) -> NetworkProperties {
        self.properties
    }

    pub fn scheduler(&self) -> &Rc<EventScheduler> {
        &self.scheduler
    }

    /// The connector for `peer`. Wrapping a connector returned from here
    /// returns that same connector.
    pub fn wrap(&self, peer: ConnectorRef) -> Rc<NetworkConnector> {
        let id = peer.id();
        if let Some(existing) = self.connectors.borrow().get(&id) {
            return existing.clone();
        }

        let connector = Rc::new_cyclic(|this| NetworkConnector {
            this: this.clone(),
            inner: peer,
            network: self.this.clone(),
            last_delivery: RefCell::new(HashMap::new()),
        });
        self.connectors.borrow_mut().insert(id, connector.clone());
        connector
    }

    /// Wraps receivers that are peers. Plain sinks are passed on unchanged.
    pub fn wrap_receiver(&self, receiver: PusherRef) -> PusherRef {
        match receiver.as_connector() {
            Some(connector) => self.wrap(connector) as PusherRef,
            None => receiver,
        }
    }

    /// Number of distinct peers reached through this network
    pub fn connector_count(&self) -> usize {
        self.connectors.borrow().len()
    }
}

// ============================================================================
// Network Connector
// ============================================================================

pub struct NetworkConnector {
    this: Weak<NetworkConnector>,
    inner: ConnectorRef,
    network: Weak<Network>,
    last_delivery: RefCell<HashMap<PeerId, SimTime>>,
}

impl NetworkConnector {
    /// The peer behind this connector
    pub fn inner(&self) -> &ConnectorRef {
        &self.inner
    }

    /// Schedule `action` as a transfer of `size` bytes from `sender`
    fn deliver(&self, sender: PeerId, size: usize, action: impl FnOnce(&ConnectorRef) + 'static) {
        let Some(network) = self.network.upgrade() else {
            warn!("call to {:016x} dropped: network is gone", self.inner.id());
            return;
        };

        let now = network.scheduler.time();
        let delivery_time = {
            let mut last_delivery = self.last_delivery.borrow_mut();
            let start = last_delivery.get(&sender).map_or(now, |&last| last.max(now));
            let delivery_time = start.saturating_add(network.properties.transfer_time(size));
            last_delivery.insert(sender, delivery_time);
            delivery_time
        };

        let inner = self.inner.clone();
        network
            .scheduler
            .schedule_absolute(delivery_time, move || action(&inner));
    }

    fn wrap(&self, peer: ConnectorRef) -> ConnectorRef {
        match self.network.upgrade() {
            Some(network) => network.wrap(peer) as ConnectorRef,
            None => peer,
        }
    }

    fn wrap_receiver(&self, receiver: PusherRef) -> PusherRef {
        match self.network.upgrade() {
            Some(network) => network.wrap_receiver(receiver),
            None => receiver,
        }
    }
}

impl Pusher for NetworkConnector {
    fn id(&self) -> PeerId {
        self.inner.id()
    }

    fn push(&self, chunk: Rc<Chunk>, origin: PeerId) {
        let size = chunk.size();
        self.deliver(origin, size, move |inner| inner.push(chunk, origin));
    }

    fn as_connector(&self) -> Option<ConnectorRef> {
        self.this.upgrade().map(|this| this as ConnectorRef)
    }
}

impl Connector for NetworkConnector {
    fn query(&self, query: Query, receiver: PusherRef) {
        let receiver = self.wrap_receiver(receiver);
        self.deliver(receiver.id(), 0, move |inner| inner.query(query, receiver));
    }

    fn request_connection_with(&self, peer: ConnectorRef) {
        let peer = self.wrap(peer);
        self.deliver(peer.id(), 0, move |inner| inner.request_connection_with(peer));
    }

    fn close_connection_with(&self, peer: ConnectorRef) {
        let peer = self.wrap(peer);
        self.deliver(peer.id(), 0, move |inner| inner.close_connection_with(peer));
    }

    fn request_peers(&self, receiver: ConnectorRef) {
        let receiver = self.wrap(receiver);
        self.deliver(receiver.id(), 0, move |inner| inner.request_peers(receiver));
    }

    fn announce_peers(&self, from: ConnectorRef, peers: Vec<ConnectorRef>) {
        let from = self.wrap(from);
        let peers: Vec<ConnectorRef> = peers.into_iter().map(|p| self.wrap(p)).collect();
        let size = peers.len() * ANNOUNCED_PEER_SIZE;
        self.deliver(from.id(), size, move |inner| inner.announce_peers(from, peers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps_config::NodeConfig;
    use crate::ps_distance::PeerDistanceRelated;
    use crate::ps_interface::{Key, StateStorage};
    use crate::ps_memory_backend::{MemChunkStorage, MemStateStorage};
    use crate::ps_node::{Node, NodeBuilder};
    use crate::ps_strategy::{
        ClosenessDataStrategy, ClosenessQueryStrategy, MaxConnectionsStrategy,
        RandomAnnouncementStrategy,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn same_object<A: ?Sized, B: ?Sized>(a: &Rc<A>, b: &Rc<B>) -> bool {
        Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
    }

    /// Records calls together with the time they arrive
    struct TimedRecorder {
        id: PeerId,
        scheduler: Rc<EventScheduler>,
        arrivals: RefCell<Vec<(SimTime, &'static str, PeerId)>>,
        peers: RefCell<Vec<ConnectorRef>>,
        receivers: RefCell<Vec<PusherRef>>,
    }

    impl TimedRecorder {
        fn new(id: PeerId, scheduler: &Rc<EventScheduler>) -> Rc<Self> {
            Rc::new(Self {
                id,
                scheduler: scheduler.clone(),
                arrivals: RefCell::new(Vec::new()),
                peers: RefCell::new(Vec::new()),
                receivers: RefCell::new(Vec::new()),
            })
        }

        fn record(&self, call: &'static str, sender: PeerId) {
            self.arrivals
                .borrow_mut()
                .push((self.scheduler.time(), call, sender));
        }

        fn arrival_times(&self) -> Vec<SimTime> {
            self.arrivals.borrow().iter().map(|(t, _, _)| *t).collect()
        }
    }

    impl Pusher for TimedRecorder {
        fn id(&self) -> PeerId {
            self.id
        }

        fn push(&self, _chunk: Rc<Chunk>, origin: PeerId) {
            self.record("push", origin);
        }
    }

    impl Connector for TimedRecorder {
        fn query(&self, _query: Query, receiver: PusherRef) {
            self.record("query", receiver.id());
            self.receivers.borrow_mut().push(receiver);
        }

        fn request_connection_with(&self, peer: ConnectorRef) {
            self.record("request_connection", peer.id());
            self.peers.borrow_mut().push(peer);
        }

        fn close_connection_with(&self, peer: ConnectorRef) {
            self.record("close_connection", peer.id());
        }

        fn request_peers(&self, receiver: ConnectorRef) {
            self.record("request_peers", receiver.id());
        }

        fn announce_peers(&self, from: ConnectorRef, peers: Vec<ConnectorRef>) {
            self.record("announce_peers", from.id());
            self.peers.borrow_mut().extend(peers);
        }
    }

    /// Receives chunks but is not a peer
    struct Sink(PeerId);

    impl Pusher for Sink {
        fn id(&self) -> PeerId {
            self.0
        }

        fn push(&self, _chunk: Rc<Chunk>, _origin: PeerId) {}
    }

    fn network(latency_ms: SimTime, bandwidth: u64) -> (Rc<EventScheduler>, Rc<Network>) {
        let scheduler = Rc::new(EventScheduler::new());
        let network = Network::new(
            scheduler.clone(),
            NetworkProperties {
                latency_ms,
                bandwidth,
            },
        );
        (scheduler, network)
    }

    fn chunk(size: usize) -> Rc<Chunk> {
        Rc::new(Chunk::new(Key::untimed(42), vec![0; size]))
    }

    #[test]
    fn test_transfer_time() {
        let properties = NetworkProperties {
            latency_ms: 100,
            bandwidth: 1000,
        };

        assert_eq!(properties.transfer_time(0), 100);
        assert_eq!(properties.transfer_time(500), 600);

        let unlimited = NetworkProperties {
            latency_ms: 7,
            bandwidth: 0,
        };
        assert_eq!(unlimited.transfer_time(1 << 20), 7);
    }

    #[test]
    fn test_push_arrives_after_transfer_time() {
        let (scheduler, network) = network(100, 1000);
        let peer = TimedRecorder::new(1, &scheduler);
        let wrapped = network.wrap(peer.clone());

        wrapped.push(chunk(500), 7);
        assert!(peer.arrivals.borrow().is_empty());

        scheduler.run();
        assert_eq!(*peer.arrivals.borrow(), vec![(600, "push", 7)]);
    }

    #[test]
    fn test_calls_from_same_sender_are_serialized() {
        let (scheduler, network) = network(100, 1000);
        let peer = TimedRecorder::new(1, &scheduler);
        let wrapped = network.wrap(peer.clone());

        wrapped.push(chunk(500), 7);
        wrapped.push(chunk(500), 7);
        scheduler.run();

        assert_eq!(peer.arrival_times(), vec![600, 1200]);
    }

    #[test]
    fn test_serialization_restarts_when_idle() {
        let (scheduler, network) = network(100, 1000);
        let peer = TimedRecorder::new(1, &scheduler);
        let wrapped = network.wrap(peer.clone());

        wrapped.push(chunk(500), 7);
        scheduler.run_until(2000);
        wrapped.push(chunk(500), 7);
        scheduler.run();

        assert_eq!(peer.arrival_times(), vec![600, 2600]);
    }

    #[test]
    fn test_other_senders_are_not_delayed() {
        let (scheduler, network) = network(100, 1000);
        let peer = TimedRecorder::new(1, &scheduler);
        let wrapped = network.wrap(peer.clone());

        wrapped.push(chunk(500), 7);
        wrapped.push(chunk(500), 8);
        scheduler.run();

        assert_eq!(peer.arrival_times(), vec![600, 600]);
    }

    #[test]
    fn test_other_connectors_are_not_delayed() {
        let (scheduler, network) = network(100, 1000);
        let first = TimedRecorder::new(1, &scheduler);
        let second = TimedRecorder::new(2, &scheduler);

        network.wrap(first.clone()).push(chunk(500), 7);
        network.wrap(second.clone()).push(chunk(500), 7);
        scheduler.run();

        assert_eq!(first.arrival_times(), vec![600]);
        assert_eq!(second.arrival_times(), vec![600]);
    }

    #[test]
    fn test_announcement_size_depends_on_peer_count() {
        let (scheduler, network) = network(0, 8);
        let peer = TimedRecorder::new(1, &scheduler);
        let announcer = TimedRecorder::new(2, &scheduler);
        let announced: Vec<ConnectorRef> = (10..13)
            .map(|id| TimedRecorder::new(id, &scheduler) as ConnectorRef)
            .collect();

        network.wrap(peer.clone()).announce_peers(announcer, announced);
        scheduler.run();

        // 3 peers * 8 bytes at 8 bytes/s
        assert_eq!(peer.arrival_times(), vec![3000]);
    }

    #[test]
    fn test_wrapping_is_memoized() {
        let (scheduler, network) = network(10, 0);
        let peer = TimedRecorder::new(1, &scheduler);

        let first = network.wrap(peer.clone());
        let second = network.wrap(peer.clone());
        let rewrapped = network.wrap(first.clone());

        assert!(Rc::ptr_eq(&first, &second));
        assert!(Rc::ptr_eq(&first, &rewrapped));
        assert!(same_object(first.inner(), &peer));
        assert_eq!(network.connector_count(), 1);
    }

    #[test]
    fn test_peer_arguments_are_wrapped_once() {
        let (scheduler, network) = network(10, 0);
        let peer = TimedRecorder::new(1, &scheduler);
        let requester = TimedRecorder::new(2, &scheduler);
        let wrapped = network.wrap(peer.clone());

        wrapped.request_connection_with(requester.clone());
        wrapped.request_connection_with(network.wrap(requester.clone()));
        scheduler.run();

        let received = peer.peers.borrow();
        assert_eq!(received.len(), 2);
        let requester_connector = network.wrap(requester.clone());
        for arg in received.iter() {
            assert!(same_object(arg, &requester_connector));
        }
        assert_eq!(network.connector_count(), 2);
    }

    #[test]
    fn test_plain_receiver_is_not_wrapped() {
        let (scheduler, network) = network(10, 0);
        let peer = TimedRecorder::new(1, &scheduler);
        let sink = Rc::new(Sink(5));

        network.wrap(peer.clone()).query(Query::untimed(42), sink.clone());
        scheduler.run();

        let receivers = peer.receivers.borrow();
        assert_eq!(receivers.len(), 1);
        assert!(same_object(&receivers[0], &sink));
        assert_eq!(network.connector_count(), 1);
    }

    fn build_node(id: PeerId, network: &Rc<Network>) -> (Rc<Node>, Rc<RefCell<MemStateStorage>>) {
        let config = NodeConfig::default();
        let scheduler = network.scheduler().clone();
        let distance = Rc::new(PeerDistanceRelated::new(id, scheduler.clone()));
        let storage = Rc::new(RefCell::new(MemChunkStorage::new(
            1 << 20,
            distance.clone(),
            scheduler.clone(),
        )));
        let state = Rc::new(RefCell::new(MemStateStorage::new()));
        let rng = StdRng::from_seed([id as u8; 32]);

        let node = NodeBuilder::new(id)
            .connection_strategy(Box::new(MaxConnectionsStrategy::from_config(&config, rng.clone())))
            .data_strategy(Box::new(ClosenessDataStrategy::from_config(id, &config, distance.clone())))
            .query_strategy(Box::new(ClosenessQueryStrategy::from_config(id, &config, distance)))
            .announcement_strategy(Box::new(RandomAnnouncementStrategy::from_config(&config, rng)))
            .clock(scheduler)
            .data_storage(storage)
            .state_storage(state.clone())
            .config(config)
            .build()
            .unwrap();
        (node, state)
    }

    struct CountingSink {
        id: PeerId,
        scheduler: Rc<EventScheduler>,
        received: RefCell<Vec<(SimTime, Key)>>,
    }

    impl Pusher for CountingSink {
        fn id(&self) -> PeerId {
            self.id
        }

        fn push(&self, chunk: Rc<Chunk>, _origin: PeerId) {
            self.received.borrow_mut().push((self.scheduler.time(), chunk.key));
        }
    }

    #[test]
    fn test_nodes_connect_and_resolve_query_through_network() {
        let (scheduler, network) = network(50, 0);
        let (a, a_state) = build_node(1, &network);
        let (b, _) = build_node(2, &network);
        a_state.borrow_mut().add_known_peer(network.wrap(b.clone()));

        a.startup();
        b.startup();
        assert!(!a.is_connected_with(2));
        scheduler.run();
        assert!(a.is_connected_with(2));
        assert!(b.is_connected_with(1));

        // b is closest to data carrying its own id
        let key = Key::untimed(2);
        let sink = Rc::new(CountingSink {
            id: 99,
            scheduler: scheduler.clone(),
            received: RefCell::new(Vec::new()),
        });
        let start = scheduler.time();
        network.wrap(a.clone()).query(Query::exactly(key), sink.clone());
        scheduler.run();
        assert_eq!(a.pending_query_count(), 1);
        assert_eq!(b.pending_query_count(), 1);

        let wrapped_b = network.wrap(b.clone());
        wrapped_b.push(Rc::new(Chunk::new(key, vec![1, 2, 3])), 0);
        scheduler.run();

        let received = sink.received.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, key);
        // query to a, query to b, push to b, push to a
        assert_eq!(received[0].0, start + 4 * 50);
        assert_eq!(a.pending_query_count(), 0);
        assert_eq!(b.pending_query_count(), 0);
    }
}
