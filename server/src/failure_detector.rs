//! Phi-accrual failure detection over leader heartbeats.
//!
//! Inter-arrival gaps of leader claims are treated as normally distributed.
//! The running mean and variance are maintained online (Welford), so memory
//! use is constant regardless of how long a leader reigns. The suspicion
//! score for a silence of `t` seconds is
//!
//! ```text
//! phi(t) = -log10(1 - F(t))
//! ```
//!
//! where `F` is the normal CDF with the running mean and standard deviation.
//! A phi of 1 means roughly a 10% chance the leader is still alive and merely
//! late, 2 means 1%, and so on.

use std::time::Instant;

/// Floor on the standard deviation, as a fraction of the mean gap.
/// Perfectly regular heartbeats would otherwise make phi jump from 0 to
/// infinity the instant a beat is late.
const MIN_STD_DEV_RATIO: f64 = 0.1;

/// Absolute floor on the standard deviation, in seconds.
const MIN_STD_DEV_SECS: f64 = 0.001;

/// Ceiling returned when the survival probability underflows.
pub const MAX_PHI: f64 = 300.0;

/// Online statistics of heartbeat inter-arrival times for one leader epoch.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStats {
    last_arrival: Option<Instant>,
    samples: u64,
    mean: f64,
    m2: f64,
}

impl HeartbeatStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat arrival. The first arrival only sets the baseline.
    pub fn record(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let gap = now.saturating_duration_since(last).as_secs_f64();
            self.samples += 1;
            let delta = gap - self.mean;
            self.mean += delta / self.samples as f64;
            self.m2 += delta * (gap - self.mean);
        }
        self.last_arrival = Some(now);
    }

    /// Forgets everything. Used when the recognized leader changes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of inter-arrival gaps observed.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.last_arrival
    }

    /// Mean gap in seconds.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance of the gaps in seconds squared.
    pub fn variance(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.m2 / self.samples as f64
        }
    }

    /// Suspicion score for the silence since the last arrival.
    ///
    /// Returns 0 until at least one gap has been observed.
    pub fn phi(&self, now: Instant) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        if self.samples == 0 {
            return 0.0;
        }

        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let std_dev = self
            .variance()
            .sqrt()
            .max(self.mean * MIN_STD_DEV_RATIO)
            .max(MIN_STD_DEV_SECS);
        let z = (elapsed - self.mean) / std_dev;

        let survival = normal_survival(z);
        if survival <= 0.0 {
            MAX_PHI
        } else {
            (-survival.log10()).clamp(0.0, MAX_PHI)
        }
    }
}

const TAIL_COEFFICIENTS: [f64; 5] = [
    0.319_381_530,
    -0.356_563_782,
    1.781_477_937,
    -1.821_255_978,
    1.330_274_429,
];

/// `1 - Φ(z)` for the standard normal distribution.
///
/// Abramowitz & Stegun 26.2.17, absolute error below 7.5e-8.
pub fn normal_survival(z: f64) -> f64 {
    if z < 0.0 {
        return 1.0 - normal_survival(-z);
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = t * TAIL_COEFFICIENTS.iter().rev().fold(0.0, |acc, b| b + t * acc);
    let density = (-z * z / 2.0).exp() * 0.398_942_280_401_432_7;
    density * poly
}

/// Threshold check over [`HeartbeatStats`].
#[derive(Debug, Clone, Copy)]
pub struct PhiDetector {
    pub threshold: f64,
}

impl PhiDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// True once the leader's silence crosses the threshold.
    ///
    /// With no gap samples yet there is nothing to judge against, so the
    /// leader is suspected and the election timeout decides.
    pub fn is_suspect(&self, stats: &HeartbeatStats, now: Instant) -> bool {
        stats.samples() == 0 || stats.phi(now) >= self.threshold
    }
}
