// Simulated Users
//
// A user owns one node and alternates between offline and online periods.
// While online its activity uploads chunks and queries chunks other users
// made it interested in.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::{debug, trace};
use rand::Rng;

use ps_rust::ps_interface::{Chunk, Connector, PeerId, Pusher, PusherRef, Query, SimTime};
use ps_rust::ps_node::Node;
use ps_rust::ps_randvar::{DurationSource, SharedRng};
use ps_rust::ps_scheduler::EventScheduler;

use super::measure::Discrete;

/// Set on every user id so users never collide with node ids
pub const USER_ID_FLAG: PeerId = 1 << 63;

/// Something a user does while online
pub trait UserActivity {
    /// Schedule all actions between now and `max_time`
    fn schedule_until(self: Rc<Self>, max_time: SimTime);
}

#[derive(Debug, Default)]
pub struct SimulationMeasures {
    /// Time until the first answer of a successful query, ms
    pub query_duration: Discrete,
    /// 1 for every answered query, 0 for every timed out one
    pub query_success: Discrete,
    pub uploads: usize,
    pub queries: usize,
}

pub type SharedMeasures = Rc<RefCell<SimulationMeasures>>;

pub struct UserSetup {
    pub node: Rc<Node>,
    pub scheduler: Rc<EventScheduler>,
    pub startup_duration: Box<dyn DurationSource>,
    pub online_duration: Box<dyn DurationSource>,
    pub query_waiting_timeout_ms: SimTime,
    /// Users without measures are not counted, e.g. the seed user
    pub measures: Option<SharedMeasures>,
    pub selector: SharedRng,
}

struct OpenQuery {
    query: Query,
    issued_at: SimTime,
}

pub struct User {
    this: Weak<User>,
    id: PeerId,
    node: Rc<Node>,
    scheduler: Rc<EventScheduler>,
    startup_duration: Box<dyn DurationSource>,
    online_duration: Box<dyn DurationSource>,
    activity: RefCell<Option<Rc<dyn UserActivity>>>,
    attractive_queries: RefCell<Vec<Query>>,
    open_queries: RefCell<Vec<OpenQuery>>,
    query_waiting_timeout_ms: SimTime,
    measures: Option<SharedMeasures>,
    selector: SharedRng,
    online: Cell<bool>,
    received_chunks: Cell<usize>,
}

impl User {
    pub fn new(setup: UserSetup) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            id: setup.node.id() | USER_ID_FLAG,
            node: setup.node,
            scheduler: setup.scheduler,
            startup_duration: setup.startup_duration,
            online_duration: setup.online_duration,
            activity: RefCell::new(None),
            attractive_queries: RefCell::new(Vec::new()),
            open_queries: RefCell::new(Vec::new()),
            query_waiting_timeout_ms: setup.query_waiting_timeout_ms,
            measures: setup.measures,
            selector: setup.selector,
            online: Cell::new(false),
            received_chunks: Cell::new(0),
        })
    }

    pub fn node(&self) -> &Rc<Node> {
        &self.node
    }

    pub fn scheduler(&self) -> &Rc<EventScheduler> {
        &self.scheduler
    }

    pub fn set_activity(&self, activity: Rc<dyn UserActivity>) {
        *self.activity.borrow_mut() = Some(activity);
    }

    pub fn is_online(&self) -> bool {
        self.online.get()
    }

    pub fn received_chunks(&self) -> usize {
        self.received_chunks.get()
    }

    pub fn open_query_count(&self) -> usize {
        self.open_queries.borrow().len()
    }

    pub fn attractive_query_count(&self) -> usize {
        self.attractive_queries.borrow().len()
    }

    // ========================================================================
    // Online Cycle
    // ========================================================================

    /// Go online after the next startup duration
    pub fn activate(&self) {
        let delay = self.startup_duration.next_sample();
        let this = self.this.clone();
        self.scheduler.schedule(delay, move || {
            if let Some(user) = this.upgrade() {
                user.go_online();
            }
        });
    }

    fn go_online(&self) {
        self.online.set(true);
        self.node.startup();

        let end = self
            .scheduler
            .time()
            .saturating_add(self.online_duration.next_sample());
        debug!("user {:016x} online until {}", self.id, end);

        let activity = self.activity.borrow().clone();
        if let Some(activity) = activity {
            activity.schedule_until(end);
        }

        let this = self.this.clone();
        self.scheduler.schedule_absolute(end, move || {
            if let Some(user) = this.upgrade() {
                user.go_offline();
            }
        });
    }

    fn go_offline(&self) {
        debug!("user {:016x} going offline", self.id);
        self.online.set(false);
        self.node.shut_down();
        self.activate();
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub fn upload(&self, chunk: Chunk) {
        if let Some(measures) = &self.measures {
            measures.borrow_mut().uploads += 1;
        }
        self.node.push(Rc::new(chunk), self.id);
    }

    /// Remember interest in data some other user uploaded
    pub fn attract_to(&self, query: Query) {
        let mut attractive = self.attractive_queries.borrow_mut();
        if !attractive.contains(&query) {
            attractive.push(query);
        }
    }

    /// Take a random remembered query
    pub fn pop_attractive_query(&self) -> Option<Query> {
        let mut attractive = self.attractive_queries.borrow_mut();
        if attractive.is_empty() {
            return None;
        }
        let index = self.selector.borrow_mut().gen_range(0..attractive.len());
        Some(attractive.swap_remove(index))
    }

    /// Ask the node for data and count it as failed if nothing arrives in time
    pub fn query(&self, query: Query) {
        let Some(receiver) = self.handle() else {
            return;
        };
        let issued_at = self.scheduler.time();
        if let Some(measures) = &self.measures {
            measures.borrow_mut().queries += 1;
        }
        self.open_queries.borrow_mut().push(OpenQuery { query, issued_at });

        let this = self.this.clone();
        self.scheduler.schedule(self.query_waiting_timeout_ms, move || {
            if let Some(user) = this.upgrade() {
                user.expire_query(&query, issued_at);
            }
        });

        self.node.query(query, receiver);
    }

    fn expire_query(&self, query: &Query, issued_at: SimTime) {
        {
            let mut open = self.open_queries.borrow_mut();
            let Some(index) = open
                .iter()
                .position(|q| q.query == *query && q.issued_at == issued_at)
            else {
                return;
            };
            open.remove(index);
        }

        trace!("user {:016x}: query {} timed out", self.id, query);
        if let Some(measures) = &self.measures {
            measures.borrow_mut().query_success.add_sample(0.0);
        }
    }

    fn handle(&self) -> Option<PusherRef> {
        self.this.upgrade().map(|user| user as PusherRef)
    }
}

impl Pusher for User {
    fn id(&self) -> PeerId {
        self.id
    }

    fn push(&self, chunk: Rc<Chunk>, _origin: PeerId) {
        self.received_chunks.set(self.received_chunks.get() + 1);

        let now = self.scheduler.time();
        let answered: Vec<OpenQuery> = {
            let mut open = self.open_queries.borrow_mut();
            let (answered, still_open): (Vec<OpenQuery>, Vec<OpenQuery>) =
                open.drain(..).partition(|q| q.query.matches(&chunk.key));
            *open = still_open;
            answered
        };

        let Some(measures) = &self.measures else {
            return;
        };
        let mut measures = measures.borrow_mut();
        for open in answered {
            trace!("user {:016x}: query {} answered", self.id, open.query);
            measures.query_duration.add_sample((now - open.issued_at) as f64);
            measures.query_success.add_sample(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::config::{NormalSpec, SimulationConfig};
    use crate::simulation::environment::Environment;
    use ps_rust::ps_interface::Key;

    const TIMEOUT: SimTime = 5_000;

    /// Users go online after 1s and stay online for 10s
    fn environment(num_users: usize) -> Environment {
        let mut config = SimulationConfig {
            num_users,
            duration_ms: 60_000,
            ..SimulationConfig::default()
        };
        config.users.startup_ms = NormalSpec::new(1_000.0, 0.0);
        config.users.online_ms = NormalSpec::new(10_000.0, 0.0);
        config.users.upload_delay_ms = NormalSpec::new(1e12, 0.0);
        config.users.query_pause_ms = NormalSpec::new(1e12, 0.0);
        config.users.query_waiting_timeout_ms = TIMEOUT;
        Environment::new(config).unwrap()
    }

    #[test]
    fn test_user_id_differs_from_node_id() {
        let env = environment(1);
        let user = env.users()[0].clone();

        assert_ne!(user.id(), user.node().id());
        assert_eq!(user.id() & !USER_ID_FLAG, user.node().id());
    }

    #[test]
    fn test_online_offline_cycle() {
        let env = environment(1);
        let user = env.users()[0].clone();

        assert!(!user.is_online());
        env.scheduler().run_until(1_000);
        assert!(user.is_online());
        env.scheduler().run_until(10_999);
        assert!(user.is_online());
        env.scheduler().run_until(11_000);
        assert!(!user.is_online());
        env.scheduler().run_until(12_000);
        assert!(user.is_online());
    }

    #[test]
    fn test_online_user_connects_to_seed() {
        let env = environment(1);
        let user = env.users()[0].clone();

        env.scheduler().run_until(2_000);

        assert!(user.node().is_connected_with(env.seed_user().node().id()));
    }

    #[test]
    fn test_offline_user_closes_connections() {
        let env = environment(1);
        let user = env.users()[0].clone();

        env.scheduler().run_until(11_500);

        assert!(user.node().connected_peers().is_empty());
        assert!(!env.seed_user().node().is_connected_with(user.node().id()));
    }

    #[test]
    fn test_local_data_answers_query_at_once() {
        let env = environment(1);
        let user = env.users()[0].clone();
        env.scheduler().run_until(2_000);

        user.upload(Chunk::new(Key::untimed(42), vec![1, 2, 3]));
        user.query(Query::untimed(42));

        let measures = env.measures().borrow();
        assert_eq!(measures.uploads, 1);
        assert_eq!(measures.queries, 1);
        assert_eq!(measures.query_success.mean(), 1.0);
        assert_eq!(measures.query_duration.mean(), 0.0);
        drop(measures);
        assert_eq!(user.open_query_count(), 0);
        assert_eq!(user.received_chunks(), 1);
    }

    #[test]
    fn test_unanswered_query_fails_after_timeout() {
        let env = environment(1);
        let user = env.users()[0].clone();
        env.scheduler().run_until(2_000);

        user.query(Query::untimed(4711));
        assert_eq!(user.open_query_count(), 1);

        env.scheduler().run_until(2_000 + TIMEOUT);

        assert_eq!(user.open_query_count(), 0);
        let measures = env.measures().borrow();
        assert_eq!(measures.query_success.count(), 1);
        assert_eq!(measures.query_success.mean(), 0.0);
        assert_eq!(measures.query_duration.count(), 0);
    }

    #[test]
    fn test_late_answer_is_not_counted_twice() {
        let env = environment(1);
        let user = env.users()[0].clone();
        env.scheduler().run_until(2_000);

        user.query(Query::untimed(7));
        env.scheduler().run_until(2_000 + TIMEOUT);
        user.push(Rc::new(Chunk::new(Key::untimed(7), vec![0])), 0);

        let measures = env.measures().borrow();
        assert_eq!(measures.query_success.count(), 1);
        assert_eq!(measures.query_duration.count(), 0);
    }

    #[test]
    fn test_attractive_queries_are_unique_and_drained() {
        let env = environment(1);
        let user = env.users()[0].clone();

        user.attract_to(Query::untimed(1));
        user.attract_to(Query::untimed(2));
        user.attract_to(Query::untimed(1));
        assert_eq!(user.attractive_query_count(), 2);

        let mut popped = vec![
            user.pop_attractive_query().unwrap(),
            user.pop_attractive_query().unwrap(),
        ];
        popped.sort_by_key(|q| q.id);

        assert_eq!(popped, vec![Query::untimed(1), Query::untimed(2)]);
        assert_eq!(user.pop_attractive_query(), None);
    }
}
