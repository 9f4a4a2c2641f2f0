// Discrete-event scheduler
//
// Single threaded. Shared as Rc<EventScheduler> by everything that needs the
// current time or wants to defer work. Actions scheduled for the same instant
// run in the order they were scheduled.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::trace;

use crate::ps_interface::{Clock, SimTime};

pub type Action = Box<dyn FnOnce()>;

struct ScheduledAction {
    time: SimTime,
    seq: u64,
    action: Action,
}

// BinaryHeap is a max-heap; reversed so the earliest (time, seq) pops first
impl Ord for ScheduledAction {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledAction {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledAction {}

pub struct EventScheduler {
    queue: RefCell<BinaryHeap<ScheduledAction>>,
    now: Cell<SimTime>,
    next_seq: Cell<u64>,
    stop_requested: Cell<bool>,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(time: SimTime) -> Self {
        Self {
            queue: RefCell::new(BinaryHeap::new()),
            now: Cell::new(time),
            next_seq: Cell::new(0),
            stop_requested: Cell::new(false),
        }
    }

    pub fn time(&self) -> SimTime {
        self.now.get()
    }

    /// Run `action` after `delay_ms` of virtual time
    pub fn schedule(&self, delay_ms: SimTime, action: impl FnOnce() + 'static) {
        self.schedule_absolute(self.time().saturating_add(delay_ms), action);
    }

    /// Run `action` at `time`. Times in the past run at the current time.
    pub fn schedule_absolute(&self, time: SimTime, action: impl FnOnce() + 'static) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        self.queue.borrow_mut().push(ScheduledAction {
            time: time.max(self.time()),
            seq,
            action: Box::new(action),
        });
    }

    /// Execute the earliest action. Returns false if nothing was pending.
    pub fn exec_next(&self) -> bool {
        // release the queue before running: actions schedule more actions
        let next = self.queue.borrow_mut().pop();

        match next {
            Some(scheduled) => {
                self.now.set(scheduled.time);
                (scheduled.action)();
                true
            }
            None => false,
        }
    }

    /// Drain the queue until it is empty or `stop` is called
    pub fn run(&self) {
        trace!("scheduler run from t={} with {} events", self.time(), self.pending_events());

        self.stop_requested.set(false);
        while !self.stop_requested.get() {
            if !self.exec_next() {
                break;
            }
        }
        self.stop_requested.set(false);
    }

    /// Execute all actions scheduled up to and including `time`, then move
    /// the clock to `time`
    pub fn run_until(&self, time: SimTime) {
        self.stop_requested.set(false);
        while !self.stop_requested.get() {
            let due = matches!(self.queue.borrow().peek(), Some(next) if next.time <= time);
            if !due {
                break;
            }
            self.exec_next();
        }

        if !self.stop_requested.replace(false) {
            self.now.set(self.time().max(time));
        }
    }

    /// Halt the current `run` after the action in progress. Has no effect
    /// outside of a run.
    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    pub fn pending_events(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for EventScheduler {
    fn time(&self) -> SimTime {
        self.now.get()
    }
}
