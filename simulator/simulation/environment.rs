// Simulation Environment
//
// Wires one seed user plus the configured number of users onto a shared
// scheduler and network. Every user initially knows only the seed node.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::info;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::NormalError;

use ps_rust::ps_config::NodeConfig;
use ps_rust::ps_distance::PeerDistanceRelated;
use ps_rust::ps_interface::{Clock, ConnectorRef, PeerId, SimTime, StateStorage, SIM_TIME_MAX};
use ps_rust::ps_memory_backend::{MemChunkStorage, MemStateStorage};
use ps_rust::ps_network::Network;
use ps_rust::ps_node::{Node, NodeBuilder, NodeError};
use ps_rust::ps_randvar::{
    ConstantDuration, DurationSource, NormalDuration, NormalFloat, PositiveDuration, SharedRng,
};
use ps_rust::ps_scheduler::EventScheduler;
use ps_rust::ps_strategy::{
    ClosenessDataStrategy, ClosenessQueryStrategy, MaxConnectionsStrategy, RandomAnnouncementStrategy,
};

use super::activity::{Audience, Combined, QueryActivity, Upload, UploadSetup};
use super::config::{NormalSpec, SimulationConfig};
use super::stats::{NetworkSnapshot, QueryStats, SimulationResult};
use super::user::{SharedMeasures, SimulationMeasures, User, UserActivity, UserSetup};

pub const SEED_NODE_ID: PeerId = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum SetupError {
    Distribution(&'static str, NormalError),
    Node(NodeError),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Distribution(name, err) => write!(f, "invalid distribution for {}: {}", name, err),
            SetupError::Node(err) => write!(f, "cannot build node: {}", err),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<NodeError> for SetupError {
    fn from(err: NodeError) -> Self {
        SetupError::Node(err)
    }
}

fn positive_duration(name: &'static str, params: NormalSpec, rng: &SharedRng) -> Result<Box<dyn DurationSource>, SetupError> {
    let normal = NormalDuration::new(params.mean, params.std_dev, rng.clone())
        .map_err(|err| SetupError::Distribution(name, err))?;
    Ok(Box::new(PositiveDuration::new(normal)))
}

fn normal_float(name: &'static str, params: NormalSpec, rng: &SharedRng) -> Result<Box<NormalFloat>, SetupError> {
    NormalFloat::new(params.mean, params.std_dev, rng.clone())
        .map(Box::new)
        .map_err(|err| SetupError::Distribution(name, err))
}

// ============================================================================
// Node Factory
// ============================================================================

struct NodeFactory<'a> {
    scheduler: &'a Rc<EventScheduler>,
    network: &'a Rc<Network>,
    rng: &'a SharedRng,
    storage_capacity: usize,
}

impl NodeFactory<'_> {
    fn create(&self, id: PeerId, config: NodeConfig, bootstrap: Option<&Rc<Node>>) -> Result<Rc<Node>, NodeError> {
        let clock: Rc<dyn Clock> = self.scheduler.clone();
        let distance = Rc::new(PeerDistanceRelated::new(id, clock.clone()));

        let data_storage = MemChunkStorage::new(self.storage_capacity, distance.clone(), clock.clone());
        let mut state_storage = MemStateStorage::new();
        if let Some(peer) = bootstrap {
            state_storage.add_known_peer(self.network.wrap(peer.clone() as ConnectorRef) as ConnectorRef);
        }

        NodeBuilder::new(id)
            .connection_strategy(Box::new(MaxConnectionsStrategy::from_config(&config, self.fork_rng())))
            .data_strategy(Box::new(ClosenessDataStrategy::from_config(id, &config, distance.clone())))
            .query_strategy(Box::new(ClosenessQueryStrategy::from_config(id, &config, distance)))
            .announcement_strategy(Box::new(RandomAnnouncementStrategy::from_config(&config, self.fork_rng())))
            .config(config)
            .clock(clock)
            .data_storage(Rc::new(RefCell::new(data_storage)))
            .state_storage(Rc::new(RefCell::new(state_storage)))
            .build()
    }

    fn fork_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.rng.borrow_mut().next_u64())
    }
}

// ============================================================================
// Progress Reports
// ============================================================================

struct Progress {
    scheduler: Weak<EventScheduler>,
    users: Audience,
    measures: SharedMeasures,
    history: Rc<RefCell<Vec<NetworkSnapshot>>>,
    interval: SimTime,
    end: SimTime,
}

impl Progress {
    fn schedule_next(self: Rc<Self>) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        let next = scheduler.time().saturating_add(self.interval);
        if self.interval == 0 || next > self.end {
            return;
        }
        scheduler.schedule_absolute(next, move || {
            self.report(next);
            self.schedule_next();
        });
    }

    fn report(&self, time: SimTime) {
        let Some(users) = self.users.upgrade() else {
            return;
        };
        let snapshot = NetworkSnapshot::capture(time, &users.borrow());
        let queries = QueryStats::from_measures(&self.measures.borrow());

        info!(
            "[{:>7.2} h] {}/{} users online, avg {:.1} connections, {} queries ({} answered, {} timed out)",
            time as f64 / 3_600_000.0,
            snapshot.online_users,
            snapshot.users,
            snapshot.avg_connected_peers,
            queries.issued,
            queries.answered,
            queries.timed_out
        );
        self.history.borrow_mut().push(snapshot);
    }
}

// ============================================================================
// Environment
// ============================================================================

pub struct Environment {
    config: SimulationConfig,
    scheduler: Rc<EventScheduler>,
    network: Rc<Network>,
    rng: SharedRng,
    seed_user: Rc<User>,
    users: Rc<RefCell<Vec<Rc<User>>>>,
    measures: SharedMeasures,
    history: Rc<RefCell<Vec<NetworkSnapshot>>>,
}

impl Environment {
    pub fn new(config: SimulationConfig) -> Result<Self, SetupError> {
        let scheduler = Rc::new(EventScheduler::new());
        let network = Network::new(scheduler.clone(), config.network);
        let rng: SharedRng = Rc::new(RefCell::new(StdRng::seed_from_u64(config.seed)));
        let measures: SharedMeasures = Rc::new(RefCell::new(SimulationMeasures::default()));

        let factory = NodeFactory {
            scheduler: &scheduler,
            network: &network,
            rng: &rng,
            storage_capacity: config.storage_capacity,
        };

        let seed_config = NodeConfig {
            max_connections: config.seed_node_max_connections,
            ..config.node.clone()
        };
        let seed_node = factory.create(SEED_NODE_ID, seed_config, None)?;
        let seed_user = User::new(UserSetup {
            node: seed_node.clone(),
            scheduler: scheduler.clone(),
            startup_duration: Box::new(ConstantDuration(0)),
            online_duration: Box::new(ConstantDuration(SIM_TIME_MAX)),
            query_waiting_timeout_ms: config.users.query_waiting_timeout_ms,
            measures: None,
            selector: rng.clone(),
        });

        let users = Rc::new(RefCell::new(Vec::with_capacity(config.num_users)));
        let behaviour = &config.users;
        for index in 0..config.num_users {
            let id = SEED_NODE_ID + 1 + index as PeerId;
            let node = factory.create(id, config.node.clone(), Some(&seed_node))?;

            let user = User::new(UserSetup {
                node,
                scheduler: scheduler.clone(),
                startup_duration: positive_duration("startup_ms", behaviour.startup_ms, &rng)?,
                online_duration: positive_duration("online_ms", behaviour.online_ms, &rng)?,
                query_waiting_timeout_ms: behaviour.query_waiting_timeout_ms,
                measures: Some(measures.clone()),
                selector: rng.clone(),
            });

            let upload = Upload::new(
                &user,
                UploadSetup {
                    delay: positive_duration("upload_delay_ms", behaviour.upload_delay_ms, &rng)?,
                    data_size: normal_float("data_size", behaviour.data_size, &rng)?,
                    max_chunk_size: config.node.max_chunk_size,
                    attraction_ratio: normal_float("attraction_ratio", behaviour.attraction_ratio, &rng)?,
                    audience: Rc::downgrade(&users),
                    rng: rng.clone(),
                },
            );
            let query = QueryActivity::new(
                &user,
                positive_duration("query_pause_ms", behaviour.query_pause_ms, &rng)?,
            );
            let activities: Vec<Rc<dyn UserActivity>> = vec![Rc::new(upload), Rc::new(query)];
            user.set_activity(Rc::new(Combined::new(activities)));

            users.borrow_mut().push(user);
        }

        seed_user.activate();
        for user in users.borrow().iter() {
            user.activate();
        }

        let history = Rc::new(RefCell::new(Vec::new()));
        Rc::new(Progress {
            scheduler: Rc::downgrade(&scheduler),
            users: Rc::downgrade(&users),
            measures: measures.clone(),
            history: history.clone(),
            interval: config.progress_interval_ms,
            end: config.duration_ms,
        })
        .schedule_next();

        info!(
            "environment ready: {} users, seed node {:016x}, {} network links",
            config.num_users,
            SEED_NODE_ID,
            network.connector_count()
        );

        Ok(Self {
            config,
            scheduler,
            network,
            rng,
            seed_user,
            users,
            measures,
            history,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Rc<EventScheduler> {
        &self.scheduler
    }

    pub fn network(&self) -> &Rc<Network> {
        &self.network
    }

    pub fn rng(&self) -> &SharedRng {
        &self.rng
    }

    pub fn seed_user(&self) -> &Rc<User> {
        &self.seed_user
    }

    pub fn users(&self) -> Vec<Rc<User>> {
        self.users.borrow().clone()
    }

    /// The shared user list upload audiences refer to
    pub fn audience(&self) -> &Rc<RefCell<Vec<Rc<User>>>> {
        &self.users
    }

    pub fn measures(&self) -> &SharedMeasures {
        &self.measures
    }

    /// Run until the configured duration
    pub fn run(&self) -> SimulationResult {
        info!(
            "running {} users for {:.2} h (seed {})",
            self.config.num_users,
            self.config.duration_ms as f64 / 3_600_000.0,
            self.config.seed
        );
        self.scheduler.run_until(self.config.duration_ms);
        self.result()
    }

    /// Results as of the current simulated time
    pub fn result(&self) -> SimulationResult {
        let measures = self.measures.borrow();
        SimulationResult {
            config_summary: format!(
                "{} users, {} max connections, {} ms latency, {} B/s",
                self.config.num_users,
                self.config.node.max_connections,
                self.config.network.latency_ms,
                self.config.network.bandwidth
            ),
            seed_used: self.config.seed,
            end_time: self.scheduler.time(),
            final_state: NetworkSnapshot::capture(self.scheduler.time(), &self.users.borrow()),
            history: self.history.borrow().clone(),
            uploads: measures.uploads,
            queries: QueryStats::from_measures(&measures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_rust::ps_interface::Pusher;

    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig {
            num_users: 8,
            duration_ms: 4 * 3_600_000,
            seed: 7,
            progress_interval_ms: 3_600_000,
            ..SimulationConfig::default()
        };
        config.node.max_connections = 4;
        config.users.startup_ms = NormalSpec::new(60_000.0, 30_000.0);
        config.users.online_ms = NormalSpec::new(3_600_000.0, 600_000.0);
        config.users.upload_delay_ms = NormalSpec::new(300_000.0, 60_000.0);
        config.users.query_pause_ms = NormalSpec::new(120_000.0, 60_000.0);
        config.users.data_size = NormalSpec::new(1_000.0, 500.0);
        config
    }

    #[test]
    fn test_users_get_sequential_node_ids() {
        let env = Environment::new(small_config()).unwrap();

        assert_eq!(env.seed_user().node().id(), SEED_NODE_ID);
        let ids: Vec<PeerId> = env.users().iter().map(|u| u.node().id()).collect();
        assert_eq!(ids, (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_network_uses_configured_properties() {
        let mut config = small_config();
        config.network.latency_ms = 321;
        let env = Environment::new(config).unwrap();

        assert_eq!(env.network().properties(), env.config().network);
        assert_eq!(env.network().properties().latency_ms, 321);
    }

    #[test]
    fn test_seed_node_gets_its_own_connection_budget() {
        let mut config = small_config();
        config.seed_node_max_connections = 123;
        let env = Environment::new(config).unwrap();

        assert_eq!(env.seed_user().node().config().max_connections, 123);
        assert_eq!(env.users()[0].node().config().max_connections, 4);
    }

    #[test]
    fn test_seed_user_is_online_from_start() {
        let env = Environment::new(small_config()).unwrap();

        env.scheduler().run_until(0);

        assert!(env.seed_user().is_online());
    }

    #[test]
    fn test_invalid_distribution_is_reported() {
        let mut config = small_config();
        config.users.online_ms = NormalSpec::new(1.0, -1.0);

        let err = Environment::new(config).err().unwrap();

        assert!(err.to_string().contains("online_ms"), "{}", err);
    }

    #[test]
    fn test_users_find_each_other_through_seed() {
        let env = Environment::new(small_config()).unwrap();

        env.scheduler().run_until(30 * 60_000);

        let user = env.users()[0].clone();
        assert!(user.is_online());
        let others = user
            .node()
            .connected_peers()
            .iter()
            .filter(|peer| peer.id() != SEED_NODE_ID)
            .count();
        assert!(others > 0, "user only knows the seed node");
    }

    #[test]
    fn test_offline_users_have_no_connections() {
        let mut config = small_config();
        config.users.startup_ms = NormalSpec::new(1_800_000.0, 600_000.0);
        let env = Environment::new(config).unwrap();
        let settle = 60_000;
        let mut checked = 0;

        for step in 1..24 {
            let time = step * 10 * 60_000;
            env.scheduler().run_until(time);
            let offline_before: Vec<PeerId> = env
                .users()
                .iter()
                .filter(|u| !u.is_online())
                .map(|u| u.node().id())
                .collect();

            // let close calls in flight arrive
            env.scheduler().run_until(time + settle);

            let mut everyone = env.users();
            everyone.push(env.seed_user().clone());
            for user in env.users() {
                let id = user.node().id();
                if user.is_online() || !offline_before.contains(&id) {
                    continue;
                }
                checked += 1;
                assert!(user.node().connected_peers().is_empty(), "offline node {} is connected", id);
                assert!(user.node().connecting_peers().is_empty(), "offline node {} is connecting", id);
                for other in everyone.iter().filter(|o| o.is_online()) {
                    assert!(
                        !other.node().is_connected_with(id),
                        "node {} still connected with offline node {}",
                        other.node().id(),
                        id
                    );
                }
            }
        }

        assert!(checked > 0);
    }

    #[test]
    fn test_run_produces_measurements_and_history() {
        let env = Environment::new(small_config()).unwrap();

        let result = env.run();

        assert_eq!(result.end_time, 4 * 3_600_000);
        assert_eq!(result.history.len(), 4);
        assert!(result.uploads > 0);
        assert!(result.queries.issued > 0);
        assert!(result.queries.answered + result.queries.timed_out > 0);
        assert!(result.queries.success_rate >= 0.0 && result.queries.success_rate <= 1.0);
    }

    #[test]
    fn test_same_seed_same_result() {
        let a = Environment::new(small_config()).unwrap().run();
        let b = Environment::new(small_config()).unwrap().run();

        assert_eq!(a.uploads, b.uploads);
        assert_eq!(a.queries.issued, b.queries.issued);
        assert_eq!(a.queries.answered, b.queries.answered);
        assert_eq!(a.queries.timed_out, b.queries.timed_out);
        assert_eq!(a.final_state, b.final_state);
    }
}
