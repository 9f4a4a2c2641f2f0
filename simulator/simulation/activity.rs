// User Activities

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, trace};
use rand::RngCore;

use ps_rust::ps_interface::{Chunk, Key, Pusher, Query, SimTime};
use ps_rust::ps_randvar::{DurationSource, FloatSource, Permutator, SharedRng};

use super::user::{User, UserActivity};

/// All users that may become interested in an upload
pub type Audience = Weak<RefCell<Vec<Rc<User>>>>;

/// Schedule `action` after every sampled delay until `max_time` is passed
fn schedule_repeated<A>(user: &User, delay: &dyn DurationSource, max_time: SimTime, action: A)
where
    A: Fn() + Clone + 'static,
{
    let scheduler = user.scheduler();
    let mut next = scheduler.time().saturating_add(delay.next_sample());
    while next <= max_time && next < SimTime::MAX {
        scheduler.schedule_absolute(next, action.clone());
        next = next.saturating_add(delay.next_sample().max(1));
    }
}

// ============================================================================
// Upload
// ============================================================================

/// Uploads random chunks and makes part of the audience interested in them
pub struct Upload {
    user: Weak<User>,
    delay: Box<dyn DurationSource>,
    data_size: Box<dyn FloatSource>,
    max_chunk_size: usize,
    attraction_ratio: Box<dyn FloatSource>,
    audience: Audience,
    permutator: Permutator,
    rng: SharedRng,
}

pub struct UploadSetup {
    pub delay: Box<dyn DurationSource>,
    pub data_size: Box<dyn FloatSource>,
    pub max_chunk_size: usize,
    pub attraction_ratio: Box<dyn FloatSource>,
    pub audience: Audience,
    pub rng: SharedRng,
}

impl Upload {
    pub fn new(user: &Rc<User>, setup: UploadSetup) -> Self {
        Self {
            user: Rc::downgrade(user),
            delay: setup.delay,
            data_size: setup.data_size,
            max_chunk_size: setup.max_chunk_size.max(1),
            attraction_ratio: setup.attraction_ratio,
            audience: setup.audience,
            permutator: Permutator::new(setup.rng.clone()),
            rng: setup.rng,
        }
    }

    fn upload(&self) {
        let Some(user) = self.user.upgrade() else {
            return;
        };
        if !user.is_online() {
            return;
        }

        let size = (self.data_size.next_sample().round().max(1.0) as usize).min(self.max_chunk_size);
        let id = self.rng.borrow_mut().next_u64();
        debug!("user {:016x} uploads {:016x} ({} bytes)", user.id(), id, size);

        user.upload(Chunk::new(Key::untimed(id), vec![0u8; size]));
        self.attract_audience(&user, Query::untimed(id));
    }

    fn attract_audience(&self, uploader: &User, query: Query) {
        let Some(audience) = self.audience.upgrade() else {
            return;
        };
        let audience = audience.borrow().clone();

        let ratio = self.attraction_ratio.next_sample().clamp(0.0, 1.0);
        let count = ((audience.len() as f64 * ratio).round() as usize).min(audience.len());

        let attracted = self
            .permutator
            .permutation(audience.len())
            .into_iter()
            .take(count)
            .map(|index| &audience[index])
            .filter(|user| user.id() != uploader.id());
        for user in attracted {
            user.attract_to(query);
        }
        trace!("{} of {} users attracted to {}", count, audience.len(), query);
    }
}

impl UserActivity for Upload {
    fn schedule_until(self: Rc<Self>, max_time: SimTime) {
        let Some(user) = self.user.upgrade() else {
            return;
        };
        let this = self.clone();
        schedule_repeated(&user, self.delay.as_ref(), max_time, move || this.upload());
    }
}

// ============================================================================
// Query
// ============================================================================

/// Queries data the user was made interested in
pub struct QueryActivity {
    user: Weak<User>,
    pause: Box<dyn DurationSource>,
}

impl QueryActivity {
    pub fn new(user: &Rc<User>, pause: Box<dyn DurationSource>) -> Self {
        Self {
            user: Rc::downgrade(user),
            pause,
        }
    }

    fn query(&self) {
        let Some(user) = self.user.upgrade() else {
            return;
        };
        if !user.is_online() {
            return;
        }

        match user.pop_attractive_query() {
            Some(query) => {
                debug!("user {:016x} queries {}", user.id(), query);
                user.query(query);
            }
            None => trace!("user {:016x} has nothing to query", user.id()),
        }
    }
}

impl UserActivity for QueryActivity {
    fn schedule_until(self: Rc<Self>, max_time: SimTime) {
        let Some(user) = self.user.upgrade() else {
            return;
        };
        let this = self.clone();
        schedule_repeated(&user, self.pause.as_ref(), max_time, move || this.query());
    }
}

// ============================================================================
// Combined
// ============================================================================

pub struct Combined {
    activities: Vec<Rc<dyn UserActivity>>,
}

impl Combined {
    pub fn new(activities: Vec<Rc<dyn UserActivity>>) -> Self {
        Self { activities }
    }
}

impl UserActivity for Combined {
    fn schedule_until(self: Rc<Self>, max_time: SimTime) {
        for activity in &self.activities {
            activity.clone().schedule_until(max_time);
        }
    }
}
