use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::abr::AbrConfig;
use crate::fetch::Transport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayerConfigInput {
    pub abr: AbrConfigInput,
    pub playback: PlaybackConfigInput,
    pub transport: TransportConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbrConfigInput {
    pub window: Option<usize>,
    pub safety_margin: Option<f64>,
    pub low_water_secs: Option<f64>,
    pub high_water_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlaybackConfigInput {
    pub startup_threshold_secs: Option<f64>,
    pub max_buffer_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub tcp_timeout_secs: Option<f64>,
    pub udp_timeout_secs: Option<f64>,
    pub udp_nack_interval_ms: Option<u64>,
    pub http_reuse_connections: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Bound on one TCP segment fetch.
    pub tcp_timeout: Duration,
    /// Bound on one UDP segment reassembly.
    pub udp_timeout: Duration,
    /// Quiet period after which the UDP fetcher NACKs missing chunks.
    pub udp_nack_interval: Duration,
    /// Keep HTTP connections alive between segments. Off by default: every
    /// segment pays its own handshake, as a fresh TCP request would.
    pub http_reuse_connections: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(30),
            udp_timeout: Duration::from_secs(30),
            udp_nack_interval: Duration::from_millis(200),
            http_reuse_connections: false,
        }
    }
}

impl TransportConfig {
    pub fn timeout_for(&self, transport: Transport) -> Duration {
        match transport {
            Transport::Tcp => self.tcp_timeout,
            Transport::Udp => self.udp_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    pub abr: AbrConfig,
    /// Buffer level at which playback first starts.
    pub startup_threshold: Duration,
    /// The fetch loop pauses while the buffer holds this much.
    pub max_buffer: Duration,
    pub transport: TransportConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            abr: AbrConfig::default(),
            startup_threshold: Duration::from_secs(2),
            max_buffer: Duration::from_secs(30),
            transport: TransportConfig::default(),
        }
    }
}

fn secs(field: &str, value: Option<f64>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v >= 0.0 => Duration::try_from_secs_f64(v)
            .map_err(|_| ConfigError::Invalid(format!("{field} is out of range: {v}"))),
        Some(v) => Err(ConfigError::Invalid(format!("{field} must be >= 0, got {v}"))),
    }
}

impl PlayerConfigInput {
    pub fn resolve(self) -> Result<PlayerConfig, ConfigError> {
        let defaults = PlayerConfig::default();

        let safety_margin = self.abr.safety_margin.unwrap_or(defaults.abr.safety_margin);
        if !(safety_margin > 0.0 && safety_margin <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "abr.safety_margin must be in (0, 1], got {safety_margin}"
            )));
        }
        let window = self.abr.window.unwrap_or(defaults.abr.window);
        if window == 0 {
            return Err(ConfigError::Invalid("abr.window must be at least 1".into()));
        }

        let abr = AbrConfig {
            window,
            safety_margin,
            low_water: secs("abr.low_water_secs", self.abr.low_water_secs, defaults.abr.low_water)?,
            high_water: secs(
                "abr.high_water_secs",
                self.abr.high_water_secs,
                defaults.abr.high_water,
            )?,
        };
        let startup_threshold = secs(
            "playback.startup_threshold_secs",
            self.playback.startup_threshold_secs,
            defaults.startup_threshold,
        )?;
        let max_buffer = secs(
            "playback.max_buffer_secs",
            self.playback.max_buffer_secs,
            defaults.max_buffer,
        )?;

        if startup_threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "playback.startup_threshold_secs must be > 0".into(),
            ));
        }
        if abr.low_water > abr.high_water || abr.high_water > max_buffer {
            return Err(ConfigError::Invalid(format!(
                "buffer marks must satisfy low_water <= high_water <= max_buffer ({:?} / {:?} / {:?})",
                abr.low_water, abr.high_water, max_buffer
            )));
        }

        let transport = TransportConfig {
            tcp_timeout: secs(
                "transport.tcp_timeout_secs",
                self.transport.tcp_timeout_secs,
                defaults.transport.tcp_timeout,
            )?,
            udp_timeout: secs(
                "transport.udp_timeout_secs",
                self.transport.udp_timeout_secs,
                defaults.transport.udp_timeout,
            )?,
            udp_nack_interval: self
                .transport
                .udp_nack_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.transport.udp_nack_interval)
                .max(Duration::from_millis(1)),
            http_reuse_connections: self
                .transport
                .http_reuse_connections
                .unwrap_or(defaults.transport.http_reuse_connections),
        };
        if transport.tcp_timeout.is_zero() || transport.udp_timeout.is_zero() {
            return Err(ConfigError::Invalid("fetch timeouts must be > 0".into()));
        }

        Ok(PlayerConfig {
            abr,
            startup_threshold,
            max_buffer,
            transport,
        })
    }
}

impl PlayerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(PlayerConfig::default());
        }
        let parsed: PlayerConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = PlayerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PlayerConfig::default());
        assert_eq!(cfg.abr.window, 5);
        assert_eq!(cfg.abr.safety_margin, 0.9);
        assert_eq!(cfg.transport.tcp_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parse_toml_config_overrides() {
        let toml = r#"
            [abr]
            window = 3
            safety_margin = 0.8
            low_water_secs = 2.5

            [playback]
            startup_threshold_secs = 4
            max_buffer_secs = 20

            [transport]
            udp_timeout_secs = 5
            udp_nack_interval_ms = 50
            http_reuse_connections = true
        "#;
        let cfg = PlayerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.abr.window, 3);
        assert_eq!(cfg.abr.safety_margin, 0.8);
        assert_eq!(cfg.abr.low_water, Duration::from_millis(2500));
        assert_eq!(cfg.abr.high_water, Duration::from_secs(10));
        assert_eq!(cfg.startup_threshold, Duration::from_secs(4));
        assert_eq!(cfg.max_buffer, Duration::from_secs(20));
        assert_eq!(cfg.transport.udp_timeout, Duration::from_secs(5));
        assert_eq!(cfg.transport.udp_nack_interval, Duration::from_millis(50));
        assert!(cfg.transport.http_reuse_connections);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for bad in [
            "[abr]\nsafety_margin = 0.0",
            "[abr]\nsafety_margin = 1.5",
            "[abr]\nwindow = 0",
            "[abr]\nlow_water_secs = 12.0",
            "[playback]\nstartup_threshold_secs = 0",
            "[playback]\nmax_buffer_secs = 5",
            "[transport]\ntcp_timeout_secs = -1",
            "[transport]\nudp_timeout_secs = 1e30",
            "[playback]\nmax_buffer_secs = inf",
        ] {
            assert!(
                matches!(PlayerConfig::from_toml_str(bad), Err(ConfigError::Invalid(_))),
                "accepted {bad:?}"
            );
        }
    }
}
