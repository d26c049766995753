//! # Adaptive Bitrate Selection
//!
//! Picks the quality level of the next segment from recent throughput and
//! the current buffer level.
//!
//! ## Policy
//!
//! - No throughput history yet: lowest level.
//! - Buffer below the low-water mark: lowest level, whatever the estimate
//!   says (starvation protection).
//! - Otherwise the estimate is the harmonic mean of the last `window`
//!   samples, scaled by `safety_margin`. The candidate is the highest level
//!   whose nominal bitrate fits under it (the lowest level if none does).
//! - Downward moves go straight to the candidate.
//! - Upward moves need the buffer at or above the high-water mark and climb
//!   one level per decision.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vidbench_common::manifest::{Manifest, QualityLevel};

/// Configuration for the ABR engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AbrConfig {
    /// Number of recent throughput samples the estimate is taken over.
    pub window: usize,
    /// Fraction of the estimated throughput a level may use, in `(0, 1]`.
    pub safety_margin: f64,
    /// Below this buffer level the lowest quality is forced.
    pub low_water: Duration,
    /// At or above this buffer level the engine may step up one level.
    pub high_water: Duration,
}

impl Default for AbrConfig {
    fn default() -> Self {
        AbrConfig {
            window: 5,
            safety_margin: 0.9,
            low_water: Duration::from_secs(4),
            high_water: Duration::from_secs(10),
        }
    }
}

/// One completed segment download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// When the download completed, relative to the session start.
    pub at: Duration,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl ThroughputSample {
    /// Measured rate in bits/sec.
    pub fn rate_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64().max(1e-6);
        self.bytes as f64 * 8.0 / secs
    }
}

/// Sliding window over the most recent samples.
#[derive(Debug, Clone)]
pub struct ThroughputHistory {
    capacity: usize,
    samples: VecDeque<ThroughputSample>,
}

impl ThroughputHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: ThroughputSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&ThroughputSample> {
        self.samples.back()
    }

    /// Harmonic mean of the measured rates, in bits/sec.
    ///
    /// Dominated by the slow samples, so one short burst cannot inflate it.
    pub fn harmonic_mean_bps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let inv_sum: f64 = self.samples.iter().map(|s| 1.0 / s.rate_bps()).sum();
        Some(self.samples.len() as f64 / inv_sum)
    }
}

/// Playback buffer as seen by the ABR engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferState {
    pub buffered: Duration,
    pub stalled: bool,
}

/// Why the quality level changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    ThroughputDriven,
    BufferStarvation,
    BufferSurplus,
}

/// Result of one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub level: QualityLevel,
    /// Set when `level` differs from the level the decision started from.
    pub switch: Option<SwitchReason>,
    /// Safety-margined throughput estimate, bits/sec.
    pub budget_bps: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AbrEngine {
    config: AbrConfig,
}

impl AbrEngine {
    pub fn new(config: AbrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AbrConfig {
        &self.config
    }

    /// Throughput budget for the next segment: harmonic mean × safety margin.
    pub fn budget_bps(&self, history: &ThroughputHistory) -> Option<f64> {
        history
            .harmonic_mean_bps()
            .map(|estimate| estimate * self.config.safety_margin)
    }

    pub fn decide(
        &self,
        history: &ThroughputHistory,
        buffer: &BufferState,
        manifest: &Manifest,
        current: &QualityLevel,
    ) -> Decision {
        let levels = manifest.levels();
        let current_rank = manifest.rank(current.id).unwrap_or(0);
        let budget_bps = self.budget_bps(history);

        let (target_rank, reason) = match budget_bps {
            None => (0, SwitchReason::ThroughputDriven),
            Some(_) if buffer.buffered < self.config.low_water => {
                (0, SwitchReason::BufferStarvation)
            }
            Some(budget) => {
                let affordable = levels
                    .iter()
                    .rposition(|l| l.nominal_bitrate_bps as f64 <= budget)
                    .unwrap_or(0);
                if affordable < current_rank {
                    (affordable, SwitchReason::ThroughputDriven)
                } else if affordable > current_rank && buffer.buffered >= self.config.high_water {
                    (current_rank + 1, SwitchReason::BufferSurplus)
                } else {
                    (current_rank, SwitchReason::ThroughputDriven)
                }
            }
        };

        let level = levels[target_rank].clone();
        let switch = (level.id != current.id).then_some(reason);
        Decision {
            level,
            switch,
            budget_bps,
        }
    }
}
