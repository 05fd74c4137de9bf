use serde::{Deserialize, Serialize};

/// Streaming mean/variance accumulator (Welford's online algorithm).
///
/// Keeps only count, running mean and the running sum of squared
/// deviations, so each update is O(1) regardless of history length.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamState {
    count: u64,
    mean: f64,
    m2: f64,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the running statistics. `sample` must be finite;
    /// a NaN or infinity poisons the mean and `m2` for good.
    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample - self.mean;
        // delta * delta2 >= 0 for finite samples, so m2 never decreases
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Population variance; zero until two samples have been seen.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
