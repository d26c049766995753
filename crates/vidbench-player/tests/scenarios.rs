//! # Scenario tests on the emulated link
//!
//! Full `ScenarioRunner` runs with both transports over an in-process
//! `EmulatedLink` on a paused tokio clock: shaping, cross traffic, the two
//! sessions and teardown, without touching the host network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vidbench_common::manifest::{Manifest, QualityLevel};
use vidbench_common::profile::ScenarioParams;
use vidbench_player::config::PlayerConfig;
use vidbench_player::fetch::{
    self, EmulatedFetcher, FetchError, FetchOutcome, SegmentFetcher, Transport,
};
use vidbench_player::runner::{
    ExecutionMode, ScenarioError, ScenarioReport, ScenarioRunner, ScenarioSummary,
};
use vidbench_player::session::PlaybackState;
use vidbench_player::telemetry::{JsonlSink, MemorySink, TelemetryEvent, TelemetrySink};
use vidbench_sim::cross_traffic::CrossTrafficGenerator;
use vidbench_sim::emulated::{BackgroundLoad, EmulatedCrossTraffic, EmulatedLink, EmulatedShaper};
use vidbench_sim::impairment::LinkShaper;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn manifest(segments: u32) -> Arc<Manifest> {
    Arc::new(
        Manifest::from_ladder(
            Duration::from_secs(2),
            segments,
            &[(1_000_000, "360p"), (3_000_000, "720p"), (6_000_000, "1080p")],
        )
        .unwrap(),
    )
}

fn params(bw: f64, delay: f64, jitter: f64, loss: f64, cross: &str) -> ScenarioParams {
    ScenarioParams {
        bandwidth_mbps: bw,
        delay_ms: delay,
        jitter_ms: jitter,
        loss_pct: loss,
        cross_traffic: cross.into(),
    }
}

struct Harness {
    link: EmulatedLink,
    manifest: Arc<Manifest>,
    sink: Arc<MemorySink>,
    runner: ScenarioRunner<EmulatedShaper, EmulatedCrossTraffic>,
}

impl Harness {
    fn new(segments: u32) -> Self {
        let link = EmulatedLink::new(7);
        Self::with_shaper(link.shaper(), link, segments)
    }

    fn with_shaper(shaper: EmulatedShaper, link: EmulatedLink, segments: u32) -> Self {
        let manifest = manifest(segments);
        let sink = Arc::new(MemorySink::new());
        let runner = ScenarioRunner::new(
            shaper,
            link.cross_traffic(7),
            manifest.clone(),
            PlayerConfig::default(),
            sink.clone(),
        );
        Self {
            link,
            manifest,
            sink,
            runner,
        }
    }

    fn fetchers(&self) -> Vec<Box<dyn SegmentFetcher>> {
        fetch::emulated::fetchers(
            &self.link,
            &self.manifest,
            &PlayerConfig::default().transport,
            &Transport::ALL,
        )
    }

    async fn run(&mut self, params: &ScenarioParams) -> Result<ScenarioReport, ScenarioError> {
        let fetchers = self.fetchers();
        self.runner
            .run(params, fetchers, CancellationToken::new())
            .await
    }

    /// Link is back to its pristine state.
    fn assert_torn_down(&self) {
        assert!(self.link.profile().is_none());
        assert_eq!(self.link.background_load(), BackgroundLoad::default());
        assert_eq!(self.link.active_transfers(), 0);
        assert!(self.runner.shaper().active_profile().is_none());
        assert!(!self.runner.cross_traffic().is_running());
    }
}

fn stall_count(report: &ScenarioReport) -> u32 {
    report.sessions.iter().map(|s| s.summary.stall_count).sum()
}

// ─── Reference Profiles ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn ample_bandwidth_finishes_without_stalls() {
    let mut h = Harness::new(15);
    let report = h.run(&params(20.0, 10.0, 0.0, 0.0, "none")).await.unwrap();

    assert_eq!(report.sessions.len(), 2);
    assert!(report.all_finished());
    assert_eq!(stall_count(&report), 0);
    for s in &report.sessions {
        assert_eq!(s.summary.segments_received, 15);
        assert!(s.summary.startup_delay_ms.unwrap() < 1000.0);
    }
    h.assert_torn_down();
}

#[tokio::test(start_paused = true)]
async fn constrained_worst_case_stalls_at_lowest_level() {
    let mut h = Harness::new(8);
    let report = h.run(&params(2.0, 80.0, 30.0, 3.0, "worst")).await.unwrap();

    assert!(stall_count(&report) >= 1);
    for s in &report.sessions {
        for r in &s.records {
            if let TelemetryEvent::SegmentReceived { quality_id, .. } = r.event {
                assert_eq!(quality_id, 0, "{} picked level {quality_id}", s.summary.transport);
            }
        }
    }
    h.assert_torn_down();
}

// ─── Failure Paths ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn invalid_parameters_never_touch_the_link() {
    let mut h = Harness::new(3);
    for bad in [
        params(0.0, 10.0, 0.0, 0.0, "none"),
        params(5.0, -1.0, 0.0, 0.0, "none"),
        params(5.0, 10.0, 0.0, 101.0, "none"),
        params(5.0, 10.0, 0.0, 0.0, "flood"),
    ] {
        let err = h.run(&bad).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Config(_)), "{err}");
    }
    assert!(h.sink.records().is_empty());
    h.assert_torn_down();
}

#[tokio::test(start_paused = true)]
async fn already_shaped_link_is_rejected() {
    let link = EmulatedLink::new(3);
    let mut shaper = link.shaper();
    let existing = params(50.0, 1.0, 0.0, 0.0, "none").validate().unwrap();
    shaper.apply(&existing).unwrap();

    let mut h = Harness::with_shaper(shaper, link, 3);
    let err = h.run(&params(20.0, 10.0, 0.0, 0.0, "worst")).await.unwrap_err();

    assert!(matches!(err, ScenarioError::ProfileAlreadyApplied(_)), "{err}");
    assert_eq!(h.link.profile(), Some(existing));
    assert!(!h.runner.cross_traffic().is_running());
    assert!(h.sink.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn aborted_session_does_not_cancel_its_sibling() {
    let mut h = Harness::new(4);
    // This fetcher's server only has 2 of the 4 segments.
    let short: Box<dyn SegmentFetcher> = Box::new(EmulatedFetcher::new(
        h.link.clone(),
        manifest(2),
        Transport::Udp,
        Duration::from_secs(30),
    ));
    let full = fetch::emulated::fetchers(
        &h.link,
        &h.manifest,
        &PlayerConfig::default().transport,
        &[Transport::Tcp],
    );
    let fetchers: Vec<Box<dyn SegmentFetcher>> = full.into_iter().chain([short]).collect();

    let report = h
        .runner
        .run(&params(20.0, 10.0, 0.0, 0.0, "none"), fetchers, CancellationToken::new())
        .await
        .unwrap();

    let states: Vec<PlaybackState> = report.sessions.iter().map(|s| s.state).collect();
    assert_eq!(states, vec![PlaybackState::Finished, PlaybackState::Aborted]);
    assert_eq!(report.sessions[0].summary.segments_received, 4);
    h.assert_torn_down();
}

/// Fetcher whose transport blows up on the first request.
struct PanickingFetcher;

#[async_trait]
impl SegmentFetcher for PanickingFetcher {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn fetch(&self, _quality: &QualityLevel, _index: u32) -> Result<FetchOutcome, FetchError> {
        panic!("transport bug");
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_session_is_isolated_and_link_torn_down() {
    let mut h = Harness::new(4);
    let tcp = fetch::emulated::fetchers(
        &h.link,
        &h.manifest,
        &PlayerConfig::default().transport,
        &[Transport::Tcp],
    );
    let broken: Box<dyn SegmentFetcher> = Box::new(PanickingFetcher);
    let fetchers: Vec<Box<dyn SegmentFetcher>> = tcp.into_iter().chain([broken]).collect();

    let report = h
        .runner
        .run(&params(20.0, 10.0, 0.0, 0.0, "random"), fetchers, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.sessions[0].state, PlaybackState::Finished);
    assert_eq!(report.sessions[0].summary.segments_received, 4);
    let broken = &report.sessions[1];
    assert_eq!(broken.state, PlaybackState::Aborted);
    assert_eq!(broken.summary.transport, Transport::Udp);
    assert!(broken.summary.reason.as_deref().unwrap().contains("session task failed"));
    h.assert_torn_down();
}

#[tokio::test(start_paused = true)]
async fn vanishing_bandwidth_aborts_sessions_but_tears_down() {
    let mut h = Harness::new(3);
    let report = h.run(&params(1e-20, 10.0, 0.0, 0.0, "none")).await.unwrap();

    for s in &report.sessions {
        assert_eq!(s.state, PlaybackState::Aborted);
        assert!(s.summary.reason.as_deref().unwrap().contains("timed out"), "{:?}", s.summary.reason);
    }
    h.assert_torn_down();
}

#[tokio::test(start_paused = true)]
async fn cancellation_still_tears_down() {
    let mut h = Harness::new(30);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let fetchers = h.fetchers();
    let report = h
        .runner
        .run(&params(2.0, 80.0, 30.0, 3.0, "worst"), fetchers, cancel)
        .await
        .unwrap();

    for s in &report.sessions {
        assert_eq!(s.state, PlaybackState::Aborted);
        assert_eq!(s.summary.reason.as_deref(), Some("cancelled"));
        assert!(s.records.last().unwrap().event.is_terminal());
    }
    h.assert_torn_down();
}

// ─── Execution Modes & Output ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sequential_sessions_do_not_overlap() {
    let link = EmulatedLink::new(11);
    let manifest = manifest(4);
    let sink = Arc::new(MemorySink::new());
    let mut runner = ScenarioRunner::new(
        link.shaper(),
        link.cross_traffic(11),
        manifest.clone(),
        PlayerConfig::default(),
        sink.clone(),
    )
    .with_mode(ExecutionMode::Sequential);
    let fetchers = fetch::emulated::fetchers(
        &link,
        &manifest,
        &PlayerConfig::default().transport,
        &Transport::ALL,
    );

    let report = runner
        .run(&params(20.0, 10.0, 0.0, 0.0, "none"), fetchers, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_finished());
    let first_end = report.sessions[0].records.last().unwrap().at;
    let second_start = report.sessions[1].records.first().unwrap().at;
    assert!(second_start >= first_end);
    assert_eq!(sink.records().len(), report.sessions.iter().map(|s| s.records.len()).sum::<usize>());
}

#[tokio::test(start_paused = true)]
async fn telemetry_and_summary_are_persisted() {
    let dir = std::env::temp_dir().join(format!("vidbench-scenario-{}", std::process::id()));
    let events = dir.join("events.jsonl");
    let sink = Arc::new(JsonlSink::create(&events).unwrap());

    let link = EmulatedLink::new(5);
    let manifest = manifest(3);
    let mut runner = ScenarioRunner::new(
        link.shaper(),
        link.cross_traffic(5),
        manifest.clone(),
        PlayerConfig::default(),
        sink.clone() as Arc<dyn TelemetrySink>,
    );
    let fetchers = fetch::emulated::fetchers(
        &link,
        &manifest,
        &PlayerConfig::default().transport,
        &Transport::ALL,
    );
    let report = runner
        .run(&params(10.0, 20.0, 5.0, 0.5, "random"), fetchers, CancellationToken::new())
        .await
        .unwrap();
    report.write_summary(&dir.join("summary.json")).unwrap();

    let lines = std::fs::read_to_string(&events).unwrap();
    let total: usize = report.sessions.iter().map(|s| s.records.len()).sum();
    assert_eq!(lines.lines().count(), total);
    let run_finished = lines
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .filter(|v| v["event"] == "run_finished")
        .count();
    assert_eq!(run_finished, 2);

    let summary: ScenarioSummary =
        serde_json::from_str(&std::fs::read_to_string(dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary.run_id, report.run_id);
    assert_eq!(summary.sessions.len(), 2);
    assert_eq!(summary.profile.cross_traffic.to_string(), "random");
    let _ = std::fs::remove_dir_all(dir);
}
