use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use hashbrown::HashSet;
use log::{debug, info, trace};

use crate::ps_config::NodeConfig;
use crate::ps_interface::{
    contains_peer, Chunk, Clock, Connector, ConnectorRef, DataStorage, Key, PeerId, Pusher, PusherRef, Query,
    SimTime, StateStorage,
};
use crate::ps_strategy::{AnnouncementStrategy, ConnectionStrategy, DataStrategy, QueryStrategy};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// A required collaborator was not provided to the builder
    MissingCollaborator(&'static str),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::MissingCollaborator(name) => write!(f, "node is missing its {}", name),
        }
    }
}

impl std::error::Error for NodeError {}

// ============================================================================
// Connection Sets
// ============================================================================

/// Peers we asked for a connection (connecting) and peers that accepted
/// (connected). A peer is never in both.
#[derive(Default)]
pub struct PeerConnections {
    connecting: Vec<ConnectorRef>,
    connected: Vec<ConnectorRef>,
}

impl PeerConnections {
    pub fn connected(&self) -> &[ConnectorRef] {
        &self.connected
    }

    pub fn connecting(&self) -> &[ConnectorRef] {
        &self.connecting
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        contains_peer(&self.connected, peer)
    }

    pub fn is_connecting(&self, peer: PeerId) -> bool {
        contains_peer(&self.connecting, peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.is_connected(peer) || self.is_connecting(peer)
    }

    /// connected + connecting
    pub fn count(&self) -> usize {
        self.connected.len() + self.connecting.len()
    }

    /// Returns false if the peer is already connecting or connected
    pub fn add_connecting(&mut self, peer: ConnectorRef) -> bool {
        if self.contains(peer.id()) {
            return false;
        }
        self.connecting.push(peer);
        true
    }

    pub fn confirm(&mut self, peer: ConnectorRef) {
        let id = peer.id();
        self.connecting.retain(|p| p.id() != id);
        if !self.is_connected(id) {
            self.connected.push(peer);
        }
    }

    pub fn remove(&mut self, peer: PeerId) -> bool {
        let before = self.count();
        self.connecting.retain(|p| p.id() != peer);
        self.connected.retain(|p| p.id() != peer);
        before != self.count()
    }

    /// Empty both sets, returning connecting peers first
    pub fn clear(&mut self) -> Vec<ConnectorRef> {
        let mut all = std::mem::take(&mut self.connecting);
        all.append(&mut self.connected);
        all
    }
}

// ============================================================================
// Pending Queries
// ============================================================================

struct PendingQuery {
    query: Query,
    expiration_time: SimTime,
    receivers: Vec<PusherRef>,
}

impl PendingQuery {
    fn add_receiver(&mut self, receiver: PusherRef, expiration_time: SimTime) {
        if !self.receivers.iter().any(|r| r.id() == receiver.id()) {
            self.receivers.push(receiver);
        }
        self.expiration_time = expiration_time;
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects the collaborators of a node. `build` fails if any is missing.
pub struct NodeBuilder {
    id: PeerId,
    config: Option<NodeConfig>,
    clock: Option<Rc<dyn Clock>>,
    data_storage: Option<Rc<RefCell<dyn DataStorage>>>,
    state_storage: Option<Rc<RefCell<dyn StateStorage>>>,
    connection_strategy: Option<Box<dyn ConnectionStrategy>>,
    data_strategy: Option<Box<dyn DataStrategy>>,
    query_strategy: Option<Box<dyn QueryStrategy>>,
    announcement_strategy: Option<Box<dyn AnnouncementStrategy>>,
}

impl NodeBuilder {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            config: None,
            clock: None,
            data_storage: None,
            state_storage: None,
            connection_strategy: None,
            data_strategy: None,
            query_strategy: None,
            announcement_strategy: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn data_storage(mut self, storage: Rc<RefCell<dyn DataStorage>>) -> Self {
        self.data_storage = Some(storage);
        self
    }

    pub fn state_storage(mut self, storage: Rc<RefCell<dyn StateStorage>>) -> Self {
        self.state_storage = Some(storage);
        self
    }

    pub fn connection_strategy(mut self, strategy: Box<dyn ConnectionStrategy>) -> Self {
        self.connection_strategy = Some(strategy);
        self
    }

    pub fn data_strategy(mut self, strategy: Box<dyn DataStrategy>) -> Self {
        self.data_strategy = Some(strategy);
        self
    }

    pub fn query_strategy(mut self, strategy: Box<dyn QueryStrategy>) -> Self {
        self.query_strategy = Some(strategy);
        self
    }

    pub fn announcement_strategy(mut self, strategy: Box<dyn AnnouncementStrategy>) -> Self {
        self.announcement_strategy = Some(strategy);
        self
    }

    pub fn build(self) -> Result<Rc<Node>, NodeError> {
        use NodeError::MissingCollaborator;

        let config = self.config.ok_or(MissingCollaborator("configuration"))?;
        let clock = self.clock.ok_or(MissingCollaborator("clock"))?;
        let data_storage = self.data_storage.ok_or(MissingCollaborator("data storage"))?;
        let state_storage = self.state_storage.ok_or(MissingCollaborator("state storage"))?;
        let connection_strategy = self
            .connection_strategy
            .ok_or(MissingCollaborator("connection strategy"))?;
        let data_strategy = self.data_strategy.ok_or(MissingCollaborator("data strategy"))?;
        let query_strategy = self.query_strategy.ok_or(MissingCollaborator("query strategy"))?;
        let announcement_strategy = self
            .announcement_strategy
            .ok_or(MissingCollaborator("announcement strategy"))?;

        let id = self.id;
        Ok(Rc::new_cyclic(|this| Node {
            id,
            this: this.clone(),
            config,
            clock,
            data_storage,
            state_storage,
            connection_strategy,
            data_strategy,
            query_strategy,
            announcement_strategy,
            connections: RefCell::new(PeerConnections::default()),
            pending_queries: RefCell::new(Vec::new()),
            started: Cell::new(false),
        }))
    }
}

// ============================================================================
// Node
// ============================================================================

/// Protocol core of a peer.
///
/// A node is only ever used through `Rc<Node>`. Calls to other peers are made
/// directly (or through a network wrapper that defers them), so no internal
/// borrow is held while another peer is called: the callee may call back.
pub struct Node {
    id: PeerId,
    this: Weak<Node>,
    config: NodeConfig,
    clock: Rc<dyn Clock>,
    data_storage: Rc<RefCell<dyn DataStorage>>,
    state_storage: Rc<RefCell<dyn StateStorage>>,
    connection_strategy: Box<dyn ConnectionStrategy>,
    data_strategy: Box<dyn DataStrategy>,
    query_strategy: Box<dyn QueryStrategy>,
    announcement_strategy: Box<dyn AnnouncementStrategy>,
    connections: RefCell<PeerConnections>,
    pending_queries: RefCell<Vec<PendingQuery>>,
    /// Set by `startup`, cleared by `shut_down`
    started: Cell<bool>,
}

impl Node {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Forget pending queries and connect to known peers
    pub fn startup(&self) {
        self.started.set(true);
        self.pending_queries.borrow_mut().clear();

        let known = self.state_storage.borrow().get_all_known_peers();
        let selected = {
            let connections = self.connections.borrow();
            self.connection_strategy.peers_to_connect(&known, &connections)
        };

        info!(
            "node {:016x} starting: {} known peers, connecting to {}",
            self.id,
            known.len(),
            selected.len()
        );
        self.connect_to(selected);
    }

    /// Close all connections. Until the next `startup` the node refuses
    /// connections and ignores queries and peer exchange.
    pub fn shut_down(&self) {
        self.started.set(false);
        self.pending_queries.borrow_mut().clear();
        let peers = self.connections.borrow_mut().clear();
        info!("node {:016x} shutting down, closing {} connections", self.id, peers.len());

        let Some(me) = self.handle() else {
            return;
        };
        for peer in peers {
            peer.close_connection_with(me.clone());
        }
    }

    pub fn connected_peers(&self) -> Vec<ConnectorRef> {
        self.connections.borrow().connected().to_vec()
    }

    pub fn connecting_peers(&self) -> Vec<ConnectorRef> {
        self.connections.borrow().connecting().to_vec()
    }

    pub fn is_connected_with(&self, peer: PeerId) -> bool {
        self.connections.borrow().is_connected(peer)
    }

    pub fn is_connection_pending_with(&self, peer: PeerId) -> bool {
        self.connections.borrow().is_connecting(peer)
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn pending_query_count(&self) -> usize {
        self.pending_queries.borrow().len()
    }

    fn handle(&self) -> Option<ConnectorRef> {
        self.this.upgrade().map(|node| node as ConnectorRef)
    }

    fn free_slots(&self) -> usize {
        self.config
            .max_connections
            .saturating_sub(self.connections.borrow().count())
    }

    fn connect_to(&self, peers: Vec<ConnectorRef>) {
        let Some(me) = self.handle() else {
            return;
        };

        for peer in peers {
            if peer.id() == self.id || !self.connections.borrow_mut().add_connecting(peer.clone()) {
                continue;
            }
            debug!("node {:016x}: requesting connection with {:016x}", self.id, peer.id());
            peer.request_connection_with(me.clone());
        }
    }

    fn register_pending_query(&self, query: Query, receiver: PusherRef) {
        let expiration_time = self
            .clock
            .time()
            .saturating_add(self.query_strategy.timeout_for(&query));
        let mut pending = self.pending_queries.borrow_mut();

        match pending.iter_mut().find(|p| p.query == query) {
            Some(existing) => existing.add_receiver(receiver, expiration_time),
            None => pending.push(PendingQuery {
                query,
                expiration_time,
                receivers: vec![receiver],
            }),
        }
    }

    fn pending_receivers_for(&self, key: &Key) -> Vec<PusherRef> {
        self.pending_queries
            .borrow()
            .iter()
            .filter(|p| p.query.matches(key))
            .flat_map(|p| p.receivers.iter().cloned())
            .collect()
    }

    fn remove_obsolete_queries(&self, fulfilled: &Key) {
        let resolved = {
            let mut pending = self.pending_queries.borrow_mut();
            let before = pending.len();
            pending.retain(|p| !p.query.matches_only(fulfilled));
            before - pending.len()
        };
        if resolved > 0 {
            trace!("node {:016x}: {} pending queries resolved", self.id, resolved);
        }
        self.sweep_expired_queries();
    }

    fn sweep_expired_queries(&self) {
        let now = self.clock.time();
        let mut pending = self.pending_queries.borrow_mut();
        let before = pending.len();

        pending.retain(|p| now < p.expiration_time);

        if pending.len() != before {
            trace!("node {:016x}: {} pending queries expired", self.id, before - pending.len());
        }
    }
}

impl Pusher for Node {
    fn id(&self) -> PeerId {
        self.id
    }

    fn push(&self, chunk: Rc<Chunk>, origin: PeerId) {
        if !self.data_strategy.is_chunk_accepted(&chunk, origin) {
            trace!("node {:016x}: dropped chunk {} from {:016x}", self.id, chunk.key, origin);
            self.sweep_expired_queries();
            return;
        }

        let forward = {
            let connections = self.connections.borrow();
            self.data_strategy
                .forward_targets_for(connections.connected(), &chunk.key, origin)
        };
        let receivers = self.pending_receivers_for(&chunk.key);

        let mut targeted: HashSet<PeerId> = HashSet::new();
        targeted.insert(origin);
        targeted.insert(self.id);

        for peer in forward {
            if targeted.insert(peer.id()) {
                trace!("node {:016x}: forwarding {} to {:016x}", self.id, chunk.key, peer.id());
                peer.push(chunk.clone(), self.id);
            }
        }
        for receiver in receivers {
            if targeted.insert(receiver.id()) {
                trace!("node {:016x}: delivering {} to {:016x}", self.id, chunk.key, receiver.id());
                receiver.push(chunk.clone(), self.id);
            }
        }

        let key = chunk.key;
        self.data_storage.borrow_mut().consider_storage(chunk);
        self.remove_obsolete_queries(&key);
    }

    fn as_connector(&self) -> Option<ConnectorRef> {
        self.handle()
    }
}

impl Connector for Node {
    fn query(&self, query: Query, receiver: PusherRef) {
        if !self.started.get() {
            trace!("node {:016x}: shut down, ignoring query {}", self.id, query);
            return;
        }
        if !self.query_strategy.is_query_accepted(&query, receiver.id()) {
            debug!("node {:016x}: rejected query {} from {:016x}", self.id, query, receiver.id());
            return;
        }

        let results = self.data_storage.borrow().query(&query);
        if !results.is_empty() {
            trace!("node {:016x}: answering {} with {} chunks", self.id, query, results.len());
            for chunk in results {
                receiver.push(chunk, self.id);
            }
            return;
        }

        let targets = {
            let connections = self.connections.borrow();
            self.query_strategy
                .forward_targets_for(connections.connected(), receiver.id(), &query)
        };
        self.register_pending_query(query, receiver);

        let Some(me) = self.handle() else {
            return;
        };
        trace!("node {:016x}: forwarding query {} to {} peers", self.id, query, targets.len());
        for peer in targets {
            peer.query(query, me.clone());
        }
    }

    fn request_connection_with(&self, peer: ConnectorRef) {
        let id = peer.id();
        if id == self.id {
            return;
        }

        let (was_pending, accepted) = {
            let connections = self.connections.borrow();
            if connections.is_connected(id) {
                return;
            }
            let pending = connections.is_connecting(id);
            (
                pending,
                self.started.get()
                    && (pending || self.connection_strategy.is_connection_accepted_with(&peer, &connections)),
            )
        };

        let Some(me) = self.handle() else {
            return;
        };

        if !accepted {
            debug!("node {:016x}: refusing connection with {:016x}", self.id, id);
            peer.close_connection_with(me);
            return;
        }

        self.connections.borrow_mut().confirm(peer.clone());
        {
            let mut state = self.state_storage.borrow_mut();
            if !state.is_known_peer(id) {
                state.add_known_peer(peer.clone());
            }
        }
        debug!("node {:016x}: connected with {:016x}", self.id, id);

        if !was_pending {
            peer.request_connection_with(me.clone());
        }
        if self.free_slots() > 0 && self.is_connected_with(id) {
            peer.request_peers(me);
        }
    }

    fn close_connection_with(&self, peer: ConnectorRef) {
        if self.connections.borrow_mut().remove(peer.id()) {
            debug!("node {:016x}: connection with {:016x} closed", self.id, peer.id());
        }
    }

    fn request_peers(&self, receiver: ConnectorRef) {
        if !self.started.get() {
            return;
        }
        let known = self.state_storage.borrow().get_all_known_peers();
        let peers = self.announcement_strategy.peers_to_announce(&known, receiver.id());

        let Some(me) = self.handle() else {
            return;
        };
        trace!("node {:016x}: announcing {} peers to {:016x}", self.id, peers.len(), receiver.id());
        receiver.announce_peers(me, peers);
    }

    fn announce_peers(&self, from: ConnectorRef, peers: Vec<ConnectorRef>) {
        if !self.started.get() {
            trace!("node {:016x}: shut down, ignoring announcement from {:016x}", self.id, from.id());
            return;
        }
        let peers: Vec<ConnectorRef> = peers.into_iter().filter(|p| p.id() != self.id).collect();

        {
            let mut state = self.state_storage.borrow_mut();
            for peer in &peers {
                if !state.is_known_peer(peer.id()) {
                    state.add_known_peer(peer.clone());
                }
            }
        }
        debug!("node {:016x}: {:016x} announced {} peers", self.id, from.id(), peers.len());

        let free = self.free_slots();
        if free == 0 {
            return;
        }

        let mut selected = {
            let connections = self.connections.borrow();
            self.connection_strategy.peers_to_connect(&peers, &connections)
        };
        selected.truncate(free);
        self.connect_to(selected);
    }
}
