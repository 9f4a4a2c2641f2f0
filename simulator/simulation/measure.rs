// Simulation Measures

/// Running mean and variance of discrete samples
#[derive(Debug, Clone, Default)]
pub struct Discrete {
    count: usize,
    sum: f64,
    sum_of_squares: f64,
}

impl Discrete {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.sum_of_squares += sample * sample;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Arithmetic mean, NaN without samples
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }

    /// Unbiased sample variance, NaN with fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return f64::NAN;
        }
        let n = self.count as f64;
        (self.sum_of_squares - self.sum * self.sum / n) / (n - 1.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
