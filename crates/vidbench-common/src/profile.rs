//! Network-condition profiles.
//!
//! [`ScenarioParams`] is the raw boundary value produced by the CLI (or a
//! test); [`ScenarioParams::validate`] turns it into an immutable
//! [`NetworkProfile`] that is applied to the emulated link for one run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("bandwidth must be > 0 Mbit/s, got {0}")]
    Bandwidth(f64),
    #[error("delay must be >= 0 ms, got {0}")]
    Delay(f64),
    #[error("jitter must be >= 0 ms, got {0}")]
    Jitter(f64),
    #[error("loss must be within [0, 100] %, got {0}")]
    Loss(f64),
    #[error("unknown cross-traffic mode: {0}")]
    CrossTraffic(String),
}

/// Background traffic injected next to the video sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossTrafficMode {
    #[default]
    None,
    Random,
    Worst,
}

impl fmt::Display for CrossTrafficMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossTrafficMode::None => write!(f, "none"),
            CrossTrafficMode::Random => write!(f, "random"),
            CrossTrafficMode::Worst => write!(f, "worst"),
        }
    }
}

impl FromStr for CrossTrafficMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CrossTrafficMode::None),
            "random" => Ok(CrossTrafficMode::Random),
            "worst" => Ok(CrossTrafficMode::Worst),
            other => Err(ProfileError::CrossTraffic(other.to_string())),
        }
    }
}

/// Unvalidated scenario parameters, as they arrive from the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub bandwidth_mbps: f64,
    pub delay_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    /// Kept as text so that an unknown mode is reported as a config error
    /// rather than rejected by the parser.
    pub cross_traffic: String,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 20.0,
            delay_ms: 10.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            cross_traffic: CrossTrafficMode::None.to_string(),
        }
    }
}

impl ScenarioParams {
    pub fn validate(&self) -> Result<NetworkProfile, ProfileError> {
        if !(self.bandwidth_mbps > 0.0) || !self.bandwidth_mbps.is_finite() {
            return Err(ProfileError::Bandwidth(self.bandwidth_mbps));
        }
        if !(self.delay_ms >= 0.0) || !self.delay_ms.is_finite() {
            return Err(ProfileError::Delay(self.delay_ms));
        }
        if !(self.jitter_ms >= 0.0) || !self.jitter_ms.is_finite() {
            return Err(ProfileError::Jitter(self.jitter_ms));
        }
        if !(0.0..=100.0).contains(&self.loss_pct) {
            return Err(ProfileError::Loss(self.loss_pct));
        }
        let cross_traffic = self.cross_traffic.parse()?;

        Ok(NetworkProfile {
            bandwidth_mbps: self.bandwidth_mbps,
            delay_ms: self.delay_ms,
            jitter_ms: self.jitter_ms,
            loss_pct: self.loss_pct,
            cross_traffic,
        })
    }
}

/// Validated link conditions for one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub bandwidth_mbps: f64,
    pub delay_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub cross_traffic: CrossTrafficMode,
}

impl NetworkProfile {
    pub fn bandwidth_bps(&self) -> f64 {
        self.bandwidth_mbps * 1_000_000.0
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_ms / 1000.0)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_ms / 1000.0)
    }

    /// Loss as a fraction in `[0, 1]`.
    pub fn loss_fraction(&self) -> f64 {
        self.loss_pct / 100.0
    }

    /// Round-trip time of the unloaded link; the configured delay applies
    /// once per direction.
    pub fn base_rtt(&self) -> Duration {
        self.delay() * 2
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Mbit/s delay={}ms jitter={}ms loss={}% cross={}",
            self.bandwidth_mbps, self.delay_ms, self.jitter_ms, self.loss_pct, self.cross_traffic
        )
    }
}
