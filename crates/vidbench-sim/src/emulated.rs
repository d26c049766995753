//! In-process stand-in for a shaped link.
//!
//! [`EmulatedLink`] holds the active [`NetworkProfile`], the background load
//! put on it by [`EmulatedCrossTraffic`], and the number of transfers in
//! flight. Each transfer samples [`LinkConditions`] when it begins: a
//! jittered RTT, the loss fraction, and its fair share of the capacity
//! left over after UDP cross traffic.
//!
//! All timing is left to the caller, so the link works with a paused tokio
//! clock and scenario tests run deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use tracing::{debug, info};
use vidbench_common::profile::{CrossTrafficMode, NetworkProfile};

use crate::cross_traffic::{
    CrossTrafficError, CrossTrafficGenerator, FlowPlan, RunningFlows, sleep_or_cancel,
};
use crate::impairment::{LinkShaper, ShapingError};

/// Share of the capacity unresponsive UDP cross traffic may take.
pub const MAX_UDP_SHARE: f64 = 0.6;

/// Conditions of an unshaped link.
pub const UNSHAPED_RATE_BPS: f64 = 1_000_000_000.0;
pub const UNSHAPED_RTT: Duration = Duration::from_micros(200);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BackgroundLoad {
    pub udp_mbps: f64,
    pub tcp_streams: u32,
}

/// What one transfer sees of the link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    pub rtt: Duration,
    /// Capacity available to this transfer, bits/sec.
    pub rate_bps: f64,
    /// Loss fraction in `[0, 1]`.
    pub loss: f64,
}

struct LinkState {
    profile: Option<NetworkProfile>,
    loads: HashMap<u64, BackgroundLoad>,
    next_load_id: u64,
    active_transfers: u32,
    rng: StdRng,
}

impl LinkState {
    fn total_load(&self) -> BackgroundLoad {
        self.loads
            .values()
            .fold(BackgroundLoad::default(), |acc, l| BackgroundLoad {
                udp_mbps: acc.udp_mbps + l.udp_mbps,
                tcp_streams: acc.tcp_streams + l.tcp_streams,
            })
    }

    fn sample(&mut self) -> LinkConditions {
        let Some(profile) = &self.profile else {
            return LinkConditions {
                rtt: UNSHAPED_RTT,
                rate_bps: UNSHAPED_RATE_BPS,
                loss: 0.0,
            };
        };

        let capacity = profile.bandwidth_bps();
        let load = self.total_load();
        let udp_bps = (load.udp_mbps * 1_000_000.0).min(capacity * MAX_UDP_SHARE);
        let sharers = load.tcp_streams + self.active_transfers.max(1);
        let rate_bps = (capacity - udp_bps) / sharers as f64;

        let base_ms = profile.delay_ms * 2.0;
        let jitter_ms = profile.jitter_ms;
        let loss = profile.loss_fraction();
        let rtt_ms = if jitter_ms > 0.0 {
            (base_ms + self.rng.random_range(-jitter_ms..=jitter_ms)).max(0.0)
        } else {
            base_ms
        };

        LinkConditions {
            rtt: Duration::try_from_secs_f64(rtt_ms / 1000.0).unwrap_or(Duration::MAX),
            rate_bps,
            loss,
        }
    }
}

/// Shared handle to the emulated link; clones refer to the same link.
#[derive(Clone)]
pub struct EmulatedLink {
    inner: Arc<Mutex<LinkState>>,
}

impl EmulatedLink {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkState {
                profile: None,
                loads: HashMap::new(),
                next_load_id: 0,
                active_transfers: 0,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn profile(&self) -> Option<NetworkProfile> {
        self.state().profile.clone()
    }

    pub fn background_load(&self) -> BackgroundLoad {
        self.state().total_load()
    }

    pub fn active_transfers(&self) -> u32 {
        self.state().active_transfers
    }

    /// Register a transfer and sample the conditions it will see.
    ///
    /// The transfer counts against the fair share of later transfers until
    /// the guard is dropped.
    pub fn begin_transfer(&self) -> TransferGuard {
        let mut state = self.state();
        state.active_transfers += 1;
        let conditions = state.sample();
        TransferGuard {
            link: self.clone(),
            conditions,
        }
    }

    /// Put background load on the link until the handle is dropped.
    pub fn add_load(&self, load: BackgroundLoad) -> LoadHandle {
        let mut state = self.state();
        let id = state.next_load_id;
        state.next_load_id += 1;
        state.loads.insert(id, load);
        LoadHandle {
            link: self.clone(),
            id,
        }
    }

    pub fn shaper(&self) -> EmulatedShaper {
        EmulatedShaper {
            link: self.clone(),
            active: None,
        }
    }

    pub fn cross_traffic(&self, seed: u64) -> EmulatedCrossTraffic {
        EmulatedCrossTraffic {
            link: self.clone(),
            seed,
            running: None,
        }
    }
}

pub struct TransferGuard {
    link: EmulatedLink,
    conditions: LinkConditions,
}

impl TransferGuard {
    pub fn conditions(&self) -> LinkConditions {
        self.conditions
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let mut state = self.link.state();
        state.active_transfers = state.active_transfers.saturating_sub(1);
    }
}

pub struct LoadHandle {
    link: EmulatedLink,
    id: u64,
}

impl LoadHandle {
    pub fn set(&self, load: BackgroundLoad) {
        self.link.state().loads.insert(self.id, load);
    }
}

impl Drop for LoadHandle {
    fn drop(&mut self) {
        self.link.state().loads.remove(&self.id);
    }
}

// ─── Shaper ─────────────────────────────────────────────────────────────────

/// [`LinkShaper`] that installs the profile on an [`EmulatedLink`].
pub struct EmulatedShaper {
    link: EmulatedLink,
    active: Option<NetworkProfile>,
}

impl LinkShaper for EmulatedShaper {
    fn apply(&mut self, profile: &NetworkProfile) -> Result<(), ShapingError> {
        if let Some(active) = &self.active {
            return Err(ShapingError::AlreadyApplied(active.to_string()));
        }
        self.link.state().profile = Some(profile.clone());
        self.active = Some(profile.clone());
        info!(%profile, "emulated link shaped");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ShapingError> {
        if self.active.take().is_some() {
            self.link.state().profile = None;
            info!("emulated link cleared");
        }
        Ok(())
    }

    fn active_profile(&self) -> Option<&NetworkProfile> {
        self.active.as_ref()
    }
}

// ─── Cross traffic ──────────────────────────────────────────────────────────

/// Plays a [`FlowPlan`] as background load on an [`EmulatedLink`].
pub struct EmulatedCrossTraffic {
    link: EmulatedLink,
    seed: u64,
    running: Option<RunningFlows>,
}

#[async_trait]
impl CrossTrafficGenerator for EmulatedCrossTraffic {
    fn start(&mut self, mode: CrossTrafficMode) -> Result<(), CrossTrafficError> {
        if self.running.is_some() {
            return Err(CrossTrafficError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CrossTrafficError::NoRuntime)?;

        let plan = FlowPlan::for_mode(mode, self.seed);
        info!(%mode, flows = plan.flows.len(), "starting emulated cross traffic");

        let mut running = RunningFlows::new();
        for (i, flow) in plan.flows.into_iter().enumerate() {
            let phases = flow.phases();
            // Flows due immediately load the link before start() returns.
            let initial = match phases.first() {
                Some(p) if flow.start_offset.is_zero() && p.offset.is_zero() => BackgroundLoad {
                    udp_mbps: p.udp_mbps as f64,
                    tcp_streams: p.tcp_streams,
                },
                _ => BackgroundLoad::default(),
            };
            let handle = self.link.add_load(initial);
            let cancel = running.token();
            running.push(runtime.spawn(async move {
                if !sleep_or_cancel(flow.start_offset, &cancel).await {
                    return;
                }
                let mut elapsed = Duration::ZERO;
                for phase in phases {
                    if !sleep_or_cancel(phase.offset.saturating_sub(elapsed), &cancel).await {
                        return;
                    }
                    debug!(flow = i, udp_mbps = phase.udp_mbps, tcp_streams = phase.tcp_streams, "flow phase");
                    handle.set(BackgroundLoad {
                        udp_mbps: phase.udp_mbps as f64,
                        tcp_streams: phase.tcp_streams,
                    });
                    if !sleep_or_cancel(phase.duration, &cancel).await {
                        return;
                    }
                    elapsed = phase.offset + phase.duration;
                }
                drop(handle);
            }));
        }
        self.running = Some(running);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown().await;
            info!("emulated cross traffic stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
