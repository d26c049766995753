//! Link shaping.
//!
//! [`LinkShaper`] applies one [`NetworkProfile`] to a link and restores the
//! unshaped link afterwards. [`NetemShaper`] does it with a single root
//! `tc netem` qdisc carrying delay, jitter, loss and rate.

use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};
use vidbench_common::profile::NetworkProfile;

use crate::topology::LinkHandle;

#[derive(Debug, Error)]
pub enum ShapingError {
    /// A profile is already active; `clear()` must run before the next `apply()`.
    #[error("a network profile is already applied ({0})")]
    AlreadyApplied(String),
    #[error("tc failed: {stderr} (command: tc {command})")]
    Command { command: String, stderr: String },
    #[error("failed to run tc: {0}")]
    Io(#[from] io::Error),
}

/// Applies and clears a network-condition profile on one link.
///
/// `apply` twice without a `clear` in between is rejected with
/// [`ShapingError::AlreadyApplied`]. `clear` with nothing applied is a no-op.
pub trait LinkShaper: Send {
    fn apply(&mut self, profile: &NetworkProfile) -> Result<(), ShapingError>;
    fn clear(&mut self) -> Result<(), ShapingError>;
    fn active_profile(&self) -> Option<&NetworkProfile>;
}

/// Bytes per packet used to turn the bandwidth-delay product into a queue limit.
const LIMIT_MTU: u64 = 1400;
const MIN_LIMIT_PACKETS: u64 = 20;

/// Queue limit for the netem qdisc: 2 × BDP in packets, at least 20.
///
/// A finite queue makes netem drop excess packets at the configured rate
/// instead of buffering them forever.
pub fn netem_limit(profile: &NetworkProfile) -> u64 {
    let rtt_ms = (profile.delay_ms * 2.0).max(1.0);
    let bdp_bytes = profile.bandwidth_bps() / 8.0 * rtt_ms / 1000.0;
    let bdp_packets = (bdp_bytes / LIMIT_MTU as f64) as u64;
    (bdp_packets * 2).max(MIN_LIMIT_PACKETS)
}

/// Arguments for `tc` that install `profile` as the root qdisc of `interface`.
pub fn netem_args(profile: &NetworkProfile, interface: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
        "limit".into(),
        netem_limit(profile).to_string(),
    ];

    args.push("delay".into());
    args.push(format!("{}ms", profile.delay_ms));
    if profile.jitter_ms > 0.0 {
        args.push(format!("{}ms", profile.jitter_ms));
    }

    if profile.loss_pct > 0.0 {
        args.push("loss".into());
        args.push(format!("{}%", profile.loss_pct));
    }

    args.push("rate".into());
    args.push(format!("{}kbit", (profile.bandwidth_mbps * 1000.0).round() as u64));
    args
}

fn clear_args(interface: &str) -> Vec<String> {
    ["qdisc", "del", "dev", interface, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// `tc netem` shaper for a real (or namespaced) interface.
pub struct NetemShaper {
    link: LinkHandle,
    active: Option<NetworkProfile>,
}

impl NetemShaper {
    pub fn new(link: LinkHandle) -> Self {
        Self { link, active: None }
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    fn tc(&self, args: &[String]) -> Result<(), ShapingError> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.link.exec("tc", &refs)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ShapingError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl LinkShaper for NetemShaper {
    fn apply(&mut self, profile: &NetworkProfile) -> Result<(), ShapingError> {
        if let Some(active) = &self.active {
            return Err(ShapingError::AlreadyApplied(active.to_string()));
        }

        // Remove whatever a previous, unclean run left behind (best effort).
        let _ = self.tc(&clear_args(&self.link.interface));

        let args = netem_args(profile, &self.link.interface);
        debug!(command = %args.join(" "), "tc");
        self.tc(&args)?;
        info!(iface = %self.link.interface, %profile, "network profile applied");
        self.active = Some(profile.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ShapingError> {
        if self.active.take().is_none() {
            return Ok(());
        }
        match self.tc(&clear_args(&self.link.interface)) {
            Ok(()) => {
                info!(iface = %self.link.interface, "network profile cleared");
                Ok(())
            }
            Err(e) => {
                warn!(iface = %self.link.interface, error = %e, "failed to clear network profile");
                Err(e)
            }
        }
    }

    fn active_profile(&self) -> Option<&NetworkProfile> {
        self.active.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidbench_common::profile::ScenarioParams;

    fn profile(bw: f64, delay: f64, jitter: f64, loss: f64) -> NetworkProfile {
        ScenarioParams {
            bandwidth_mbps: bw,
            delay_ms: delay,
            jitter_ms: jitter,
            loss_pct: loss,
            cross_traffic: "none".into(),
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn netem_args_carry_all_parameters() {
        let args = netem_args(&profile(2.0, 80.0, 30.0, 3.0), "c1-eth0");
        assert_eq!(
            args.join(" "),
            "qdisc add dev c1-eth0 root netem limit 56 delay 80ms 30ms loss 3% rate 2000kbit"
        );
    }

    #[test]
    fn zero_jitter_and_loss_are_omitted() {
        let args = netem_args(&profile(20.0, 10.0, 0.0, 0.0), "eth1").join(" ");
        assert!(!args.contains("loss"));
        assert!(args.contains("delay 10ms rate 20000kbit"));
    }

    #[test]
    fn limit_scales_with_bdp_and_has_a_floor() {
        // 20 Mbit/s × 20 ms = 50 kB ≈ 35 packets → 70
        assert_eq!(netem_limit(&profile(20.0, 10.0, 0.0, 0.0)), 70);
        assert_eq!(netem_limit(&profile(0.5, 0.0, 0.0, 0.0)), MIN_LIMIT_PACKETS);
    }

    #[test]
    fn clear_without_apply_is_noop() {
        let mut shaper = NetemShaper::new(LinkHandle::new("does-not-exist0"));
        assert!(shaper.clear().is_ok());
        assert!(shaper.active_profile().is_none());
    }
}
