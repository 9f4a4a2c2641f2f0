// Random variables for the simulation
//
// Each variable draws from a shared seeded StdRng, so a whole simulation is
// reproducible from one seed.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal, NormalError};

use crate::ps_interface::SimTime;

pub type SharedRng = Rc<RefCell<StdRng>>;

/// Resampling limit for `PositiveDuration`
const MAX_RESAMPLES: usize = 1000;

pub trait DurationSource {
    fn next_sample(&self) -> SimTime;
}

pub trait FloatSource {
    fn next_sample(&self) -> f64;
}

/// Always the same duration
#[derive(Debug, Clone, Copy)]
pub struct ConstantDuration(pub SimTime);

impl DurationSource for ConstantDuration {
    fn next_sample(&self) -> SimTime {
        self.0
    }
}

/// Normally distributed duration in ms. Negative samples become 0.
pub struct NormalDuration {
    normal: Normal<f64>,
    rng: SharedRng,
}

impl NormalDuration {
    pub fn new(mean_ms: f64, stddev_ms: f64, rng: SharedRng) -> Result<Self, NormalError> {
        Ok(Self {
            normal: Normal::new(mean_ms, stddev_ms)?,
            rng,
        })
    }
}

impl DurationSource for NormalDuration {
    fn next_sample(&self) -> SimTime {
        let sample = self.normal.sample(&mut *self.rng.borrow_mut());
        sample.max(0.0).round() as SimTime
    }
}

/// Resamples the inner duration until it is greater than zero
pub struct PositiveDuration<D: DurationSource> {
    inner: D,
}

impl<D: DurationSource> PositiveDuration<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D: DurationSource> DurationSource for PositiveDuration<D> {
    fn next_sample(&self) -> SimTime {
        (0..MAX_RESAMPLES)
            .map(|_| self.inner.next_sample())
            .find(|&sample| sample > 0)
            .unwrap_or(1)
    }
}

pub struct NormalFloat {
    normal: Normal<f64>,
    rng: SharedRng,
}

impl NormalFloat {
    pub fn new(mean: f64, stddev: f64, rng: SharedRng) -> Result<Self, NormalError> {
        Ok(Self {
            normal: Normal::new(mean, stddev)?,
            rng,
        })
    }
}

impl FloatSource for NormalFloat {
    fn next_sample(&self) -> f64 {
        self.normal.sample(&mut *self.rng.borrow_mut())
    }
}

/// Random orderings
pub struct Permutator {
    rng: SharedRng,
}

impl Permutator {
    pub fn new(rng: SharedRng) -> Self {
        Self { rng }
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.borrow_mut());
    }

    /// Random permutation of `0..n`
    pub fn permutation(&self, n: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..n).collect();
        self.shuffle(&mut indices);
        indices
    }
}
