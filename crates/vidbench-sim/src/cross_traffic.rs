//! Background traffic sharing the shaped link with the video sessions.
//!
//! A [`FlowPlan`] is derived from the scenario's [`CrossTrafficMode`]; a
//! [`CrossTrafficGenerator`] turns the plan into live flows. The real
//! implementation is [`IperfCrossTraffic`] (one `iperf3` client per flow);
//! the in-process one lives in [`crate::emulated`].

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use thiserror::Error;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vidbench_common::profile::CrossTrafficMode;

use crate::topology::LinkHandle;

#[derive(Debug, Error)]
pub enum CrossTrafficError {
    #[error("cross traffic is already running")]
    AlreadyRunning,
    #[error("cross traffic needs a tokio runtime")]
    NoRuntime,
}

/// Starts and stops the background flows of one scenario.
///
/// `stop` terminates every spawned flow and waits for it; calling it when
/// nothing was started is fine.
#[async_trait]
pub trait CrossTrafficGenerator: Send {
    fn start(&mut self, mode: CrossTrafficMode) -> Result<(), CrossTrafficError>;
    async fn stop(&mut self);
    fn is_running(&self) -> bool;
}

// ─── Flow plans ─────────────────────────────────────────────────────────────

/// Ladder cycled by the adversarial UDP flow, in Mbit/s.
pub const WORST_LADDER_MBPS: [u32; 6] = [1, 2, 4, 6, 8, 10];
pub const WORST_STEP: Duration = Duration::from_secs(5);
pub const WORST_DURATION: Duration = Duration::from_secs(60);
pub const WORST_UDP_MBPS: u32 = 10;
pub const WORST_TCP_STREAMS: u32 = 4;

pub const RANDOM_MAX_FLOWS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum FlowKind {
    /// Bulk TCP transfer with `streams` parallel connections.
    Tcp { streams: u32 },
    /// Constant-rate UDP.
    Udp { rate_mbps: u32 },
    /// UDP whose rate walks `rates_mbps` in order, one `step` each, repeating.
    UdpLadder { rates_mbps: Vec<u32>, step: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowSpec {
    pub kind: FlowKind,
    /// Delay from `start()` until the flow begins.
    pub start_offset: Duration,
    pub duration: Duration,
}

/// One phase of a flow at a fixed load.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowPhase {
    pub offset: Duration,
    pub duration: Duration,
    pub udp_mbps: u32,
    pub tcp_streams: u32,
}

impl FlowSpec {
    /// Split the flow into constant-load phases, offsets relative to flow start.
    pub fn phases(&self) -> Vec<FlowPhase> {
        match &self.kind {
            FlowKind::Tcp { streams } => vec![FlowPhase {
                offset: Duration::ZERO,
                duration: self.duration,
                udp_mbps: 0,
                tcp_streams: *streams,
            }],
            FlowKind::Udp { rate_mbps } => vec![FlowPhase {
                offset: Duration::ZERO,
                duration: self.duration,
                udp_mbps: *rate_mbps,
                tcp_streams: 0,
            }],
            FlowKind::UdpLadder { rates_mbps, step } => {
                let mut phases = Vec::new();
                if rates_mbps.is_empty() || step.is_zero() {
                    return phases;
                }
                let mut offset = Duration::ZERO;
                for rate in rates_mbps.iter().cycle() {
                    if offset >= self.duration {
                        break;
                    }
                    let duration = (*step).min(self.duration - offset);
                    phases.push(FlowPhase {
                        offset,
                        duration,
                        udp_mbps: *rate,
                        tcp_streams: 0,
                    });
                    offset += *step;
                }
                phases
            }
        }
    }

    /// `iperf3` client arguments for each phase, against `server:port`.
    pub fn commands(&self, server: &str, port: u16) -> Vec<(Duration, Vec<String>)> {
        self.phases()
            .into_iter()
            .map(|phase| {
                let secs = phase.duration.as_secs().max(1).to_string();
                let mut args: Vec<String> = vec![
                    "-c".into(),
                    server.into(),
                    "-p".into(),
                    port.to_string(),
                    "-t".into(),
                    secs,
                ];
                if phase.tcp_streams > 0 {
                    args.push("-P".into());
                    args.push(phase.tcp_streams.to_string());
                } else {
                    args.push("-u".into());
                    args.push("-b".into());
                    args.push(format!("{}M", phase.udp_mbps));
                }
                (phase.offset, args)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlowPlan {
    pub flows: Vec<FlowSpec>,
}

impl FlowPlan {
    pub fn for_mode(mode: CrossTrafficMode, seed: u64) -> Self {
        match mode {
            CrossTrafficMode::None => FlowPlan::default(),
            CrossTrafficMode::Random => FlowPlan::random(&mut StdRng::seed_from_u64(seed)),
            CrossTrafficMode::Worst => FlowPlan::worst(),
        }
    }

    /// 1 to 5 flows, each TCP (1-4 streams) or UDP (1-100 Mbit/s), lasting
    /// 10-30 s, started 0.5-2 s apart.
    pub fn random(rng: &mut StdRng) -> Self {
        let count = rng.random_range(1..=RANDOM_MAX_FLOWS);
        let mut offset = Duration::ZERO;
        let mut flows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = if rng.random::<bool>() {
                FlowKind::Tcp {
                    streams: rng.random_range(1..=4),
                }
            } else {
                FlowKind::Udp {
                    rate_mbps: rng.random_range(1..=100),
                }
            };
            flows.push(FlowSpec {
                kind,
                start_offset: offset,
                duration: Duration::from_secs(rng.random_range(10..=30)),
            });
            offset += Duration::from_secs_f64(rng.random_range(0.5..=2.0));
        }
        FlowPlan { flows }
    }

    /// Fixed adversarial pattern: a UDP flow walking the bitrate ladder, a
    /// constant 10 Mbit/s UDP flow and a 4-stream TCP bulk flow, all for 60 s.
    pub fn worst() -> Self {
        let flow = |kind| FlowSpec {
            kind,
            start_offset: Duration::ZERO,
            duration: WORST_DURATION,
        };
        FlowPlan {
            flows: vec![
                flow(FlowKind::UdpLadder {
                    rates_mbps: WORST_LADDER_MBPS.to_vec(),
                    step: WORST_STEP,
                }),
                flow(FlowKind::Udp {
                    rate_mbps: WORST_UDP_MBPS,
                }),
                flow(FlowKind::Tcp {
                    streams: WORST_TCP_STREAMS,
                }),
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Time from `start()` until the last flow ends.
    pub fn span(&self) -> Duration {
        self.flows
            .iter()
            .map(|f| f.start_offset + f.duration)
            .max()
            .unwrap_or_default()
    }
}

/// Sleep for `delay`, returning `false` if cancelled first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Tasks spawned for one `start()`; cancelled and joined by `stop()`.
#[derive(Default)]
pub(crate) struct RunningFlows {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningFlows {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "cross-traffic task failed");
            }
        }
    }
}

// ─── iperf3 flows ───────────────────────────────────────────────────────────

/// Runs each planned flow as `iperf3` clients against `server`.
///
/// Flow `i` talks to port `base_port + i`, so the server side needs one
/// `iperf3 -s` listener per concurrent flow.
pub struct IperfCrossTraffic {
    link: LinkHandle,
    server: String,
    base_port: u16,
    seed: u64,
    running: Option<RunningFlows>,
}

impl IperfCrossTraffic {
    pub const DEFAULT_PORT: u16 = 5201;

    pub fn new(link: LinkHandle, server: impl Into<String>, seed: u64) -> Self {
        Self {
            link,
            server: server.into(),
            base_port: Self::DEFAULT_PORT,
            seed,
            running: None,
        }
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }
}

async fn run_iperf(
    link: LinkHandle,
    flow: usize,
    start_offset: Duration,
    commands: Vec<(Duration, Vec<String>)>,
    cancel: CancellationToken,
) {
    if !sleep_or_cancel(start_offset, &cancel).await {
        return;
    }
    let started = tokio::time::Instant::now();
    for (offset, args) in commands {
        let wait = offset.saturating_sub(started.elapsed());
        if !sleep_or_cancel(wait, &cancel).await {
            return;
        }
        debug!(flow, args = %args.join(" "), "starting iperf3");
        let mut command = link.command("iperf3", &args);
        command
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(flow, error = %e, "failed to spawn iperf3");
                return;
            }
        };
        if !wait_or_kill(flow, child, &cancel).await {
            return;
        }
    }
}

/// Wait for the child to exit; kill it on cancellation. Returns `false` if cancelled.
async fn wait_or_kill(flow: usize, mut child: Child, cancel: &CancellationToken) -> bool {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => warn!(flow, status = %s, "iperf3 exited with failure"),
                Err(e) => warn!(flow, error = %e, "iperf3 wait failed"),
            }
            true
        }
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(flow, error = %e, "failed to kill iperf3");
            }
            false
        }
    }
}

#[async_trait]
impl CrossTrafficGenerator for IperfCrossTraffic {
    fn start(&mut self, mode: CrossTrafficMode) -> Result<(), CrossTrafficError> {
        if self.running.is_some() {
            return Err(CrossTrafficError::AlreadyRunning);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| CrossTrafficError::NoRuntime)?;

        let plan = FlowPlan::for_mode(mode, self.seed);
        info!(%mode, flows = plan.flows.len(), server = %self.server, "starting cross traffic");

        let mut running = RunningFlows::new();
        for (i, flow) in plan.flows.iter().enumerate() {
            let port = self.base_port.saturating_add(i as u16);
            let commands = flow.commands(&self.server, port);
            running.push(handle.spawn(run_iperf(
                self.link.clone(),
                i,
                flow.start_offset,
                commands,
                running.token(),
            )));
        }
        self.running = Some(running);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown().await;
            info!("cross traffic stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
