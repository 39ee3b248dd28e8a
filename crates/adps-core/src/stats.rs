//! Running statistics with mergeable higher moments.
//!
//! Samples are folded in with the Welford/Terriberry single-pass update and
//! two accumulators are combined with the Chan/Pébay pairwise formulas, so a
//! merge reproduces the statistics of the concatenated sample streams without
//! touching any individual sample again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire layout: `(count, mean, m2, m3, m4)`.
pub type StatsTuple = (u64, f64, f64, f64, f64);

/// Online accumulator of count, mean and the 2nd-4th central moment sums.
///
/// # Example
///
/// ```
/// use adps_core::stats::RunningStatistics;
///
/// let mut a = RunningStatistics::from_samples([1.0, 2.0, 3.0]);
/// let b = RunningStatistics::from_samples([4.0, 5.0]);
/// a.merge(&b);
///
/// assert_eq!(a.count(), 5);
/// assert!((a.mean() - 3.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "StatsTuple", into = "StatsTuple")]
pub struct RunningStatistics {
    count: u64,
    mean: f64,
    m2: f64,
    m3: f64,
    m4: f64,
}

impl RunningStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate every sample of `samples`.
    pub fn from_samples<I: IntoIterator<Item = f64>>(samples: I) -> Self {
        let mut stats = Self::new();
        for x in samples {
            stats.update(x);
        }
        stats
    }

    /// Fold one sample into the accumulator. Non-finite samples are ignored.
    pub fn update(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }

        let n1 = self.count as f64;
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * n1;

        self.mean += delta_n;
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;
    }

    /// Combine `other` into `self` as if both sample streams had been fed to
    /// one accumulator. An empty operand on either side is an exact identity.
    pub fn merge(&mut self, other: &RunningStatistics) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let na = self.count as f64;
        let nb = other.count as f64;
        let n = na + nb;

        let delta = other.mean - self.mean;
        let delta2 = delta * delta;
        let delta3 = delta2 * delta;
        let delta4 = delta2 * delta2;

        let mean = self.mean + delta * nb / n;

        let m2 = self.m2 + other.m2 + delta2 * na * nb / n;

        let m3 = self.m3
            + other.m3
            + delta3 * na * nb * (na - nb) / (n * n)
            + 3.0 * delta * (na * other.m2 - nb * self.m2) / n;

        let m4 = self.m4
            + other.m4
            + delta4 * na * nb * (na * na - na * nb + nb * nb) / (n * n * n)
            + 6.0 * delta2 * (na * na * other.m2 + nb * nb * self.m2) / (n * n)
            + 4.0 * delta * (na * other.m3 - nb * self.m3) / n;

        self.count += other.count;
        self.mean = mean;
        self.m2 = m2;
        self.m3 = m3;
        self.m4 = m4;
    }

    /// Non-mutating merge.
    pub fn merged(&self, other: &RunningStatistics) -> RunningStatistics {
        let mut out = *self;
        out.merge(other);
        out
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether every moment is a finite number.
    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.m2.is_finite() && self.m3.is_finite() && self.m4.is_finite()
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// Unbiased variance (Bessel's correction).
    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn skewness(&self) -> f64 {
        if self.count < 2 || self.m2 <= 0.0 {
            return 0.0;
        }
        (self.count as f64).sqrt() * self.m3 / self.m2.powf(1.5)
    }

    /// Excess kurtosis.
    pub fn kurtosis(&self) -> f64 {
        if self.count < 2 || self.m2 <= 0.0 {
            return 0.0;
        }
        self.count as f64 * self.m4 / (self.m2 * self.m2) - 3.0
    }

    pub fn to_tuple(&self) -> StatsTuple {
        (self.count, self.mean, self.m2, self.m3, self.m4)
    }

    pub fn from_tuple(t: StatsTuple) -> Self {
        let (count, mean, m2, m3, m4) = t;
        Self {
            count,
            mean,
            m2,
            m3,
            m4,
        }
    }
}

impl From<StatsTuple> for RunningStatistics {
    fn from(t: StatsTuple) -> Self {
        Self::from_tuple(t)
    }
}

impl From<RunningStatistics> for StatsTuple {
    fn from(s: RunningStatistics) -> Self {
        s.to_tuple()
    }
}

impl fmt::Display for RunningStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} mean={:.6} stddev={:.6}",
            self.count,
            self.mean(),
            self.stddev()
        )
    }
}
