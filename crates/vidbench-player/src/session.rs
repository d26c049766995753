//! # Playback Session
//!
//! Drives one transport through the whole content:
//!
//! ```text
//! Starting → Buffering → Playing ⇄ Stalled
//!                           ↓
//!              Finished | Aborted
//! ```
//!
//! Fetches are strictly sequential: decide, fetch, update, repeat. The
//! buffer drains at wall-clock rate while `Playing`. If it runs dry while a
//! download is in flight the session stalls at that instant, and resumes
//! when the download lands. A failed fetch is retried once (same level,
//! same index) unless it is `NotFound`; a second failure aborts the session.
//!
//! Every transition, decision and fetch is recorded as telemetry in the
//! order it happens, with timestamps that never go backwards. Each decision
//! lands in the `SegmentRequested` it leads to (level and budget), plus a
//! `QualitySwitch` when the level changes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vidbench_common::ids;
use vidbench_common::manifest::{Manifest, QualityLevel};

use crate::abr::{AbrEngine, BufferState, ThroughputHistory, ThroughputSample};
use crate::config::PlayerConfig;
use crate::fetch::{FetchError, FetchOutcome, SegmentFetcher, Transport};
use crate::telemetry::{
    RunStatus, SessionSummary, StallCause, TelemetryEvent, TelemetryRecord, TelemetrySink, millis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Starting,
    Buffering,
    Playing,
    Stalled,
    Finished,
    Aborted,
}

/// Result of a finished (or aborted) session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: PlaybackState,
    pub summary: SessionSummary,
    pub records: Vec<TelemetryRecord>,
}

pub struct PlaybackSession {
    id: String,
    fetcher: Box<dyn SegmentFetcher>,
    manifest: Arc<Manifest>,
    engine: AbrEngine,
    startup_threshold: Duration,
    max_buffer: Duration,
    sink: Arc<dyn TelemetrySink>,
    epoch: Instant,
}

impl PlaybackSession {
    /// `epoch` is the scenario start; telemetry timestamps are offsets from it.
    pub fn new(
        fetcher: Box<dyn SegmentFetcher>,
        manifest: Arc<Manifest>,
        config: &PlayerConfig,
        sink: Arc<dyn TelemetrySink>,
        epoch: Instant,
    ) -> Self {
        Self {
            id: ids::session_id(),
            fetcher,
            manifest,
            engine: AbrEngine::new(config.abr.clone()),
            startup_threshold: config.startup_threshold,
            max_buffer: config.max_buffer,
            sink,
            epoch,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> Transport {
        self.fetcher.transport()
    }

    /// Play the content to the end, or until a fatal fetch error or `cancel`.
    pub async fn run(self, cancel: CancellationToken) -> SessionReport {
        let mut run = Run::new(&self);
        run.record(TelemetryEvent::RunStarted {
            wall_clock: Utc::now(),
            segment_count: self.manifest.segment_count(),
        });
        info!(
            session = %self.id,
            transport = %self.transport(),
            segments = self.manifest.segment_count(),
            "playback session started"
        );

        let result = run.play(&cancel).await;
        run.finish(result)
    }
}

/// Buffered media, draining at wall-clock rate while playback runs.
#[derive(Debug, Clone, Copy)]
struct Playout {
    level: Duration,
    since: Instant,
    draining: bool,
}

impl Playout {
    fn level_at(&self, now: Instant) -> Duration {
        if self.draining {
            self.level
                .saturating_sub(now.saturating_duration_since(self.since))
        } else {
            self.level
        }
    }

    fn settle(&mut self, now: Instant) {
        self.level = self.level_at(now);
        self.since = now;
    }

    fn add(&mut self, now: Instant, media: Duration) {
        self.settle(now);
        self.level += media;
    }

    fn set_draining(&mut self, now: Instant, draining: bool) {
        self.settle(now);
        self.draining = draining;
    }

    /// When the buffer runs dry, if it is draining.
    fn depletion(&self) -> Option<Instant> {
        self.draining.then(|| self.since + self.level)
    }
}

/// Mutable state of one `run()`.
struct Run<'a> {
    session: &'a PlaybackSession,
    state: PlaybackState,
    started: Instant,
    playout: Playout,
    history: ThroughputHistory,
    current: QualityLevel,
    stall_started: Option<Instant>,
    records: Vec<TelemetryRecord>,
    last_at: Duration,
    sink_failed: bool,
}

type Abort = String;

impl<'a> Run<'a> {
    fn new(session: &'a PlaybackSession) -> Self {
        let now = Instant::now();
        Self {
            session,
            state: PlaybackState::Starting,
            started: now,
            playout: Playout {
                level: Duration::ZERO,
                since: now,
                draining: false,
            },
            history: ThroughputHistory::new(session.engine.config().window),
            current: session.manifest.lowest().clone(),
            stall_started: None,
            records: Vec::new(),
            last_at: Duration::ZERO,
            sink_failed: false,
        }
    }

    fn record(&mut self, event: TelemetryEvent) {
        let at = Instant::now()
            .saturating_duration_since(self.session.epoch)
            .max(self.last_at);
        self.last_at = at;
        let record = TelemetryRecord {
            at,
            session_id: self.session.id.clone(),
            transport: self.session.transport(),
            event,
        };
        if let Err(e) = self.session.sink.record(&record) {
            if !self.sink_failed {
                warn!(session = %self.session.id, error = %e, "telemetry sink rejected record");
                self.sink_failed = true;
            }
        }
        self.records.push(record);
    }

    fn transition(&mut self, to: PlaybackState) {
        debug!(session = %self.session.id, from = ?self.state, ?to, "state");
        self.state = to;
    }

    fn buffer_state(&self, now: Instant) -> BufferState {
        BufferState {
            buffered: self.playout.level_at(now),
            stalled: self.state == PlaybackState::Stalled,
        }
    }

    async fn play(&mut self, cancel: &CancellationToken) -> Result<(), Abort> {
        let session = self.session;
        let manifest = &session.manifest;
        self.transition(PlaybackState::Buffering);

        for index in 0..manifest.segment_count() {
            self.wait_for_room(cancel).await?;

            let decision = session.engine.decide(
                &self.history,
                &self.buffer_state(Instant::now()),
                manifest,
                &self.current,
            );
            if let Some(reason) = decision.switch {
                info!(
                    session = %session.id,
                    from = self.current.id,
                    to = decision.level.id,
                    ?reason,
                    "quality switch"
                );
                self.record(TelemetryEvent::QualitySwitch {
                    from: self.current.id,
                    to: decision.level.id,
                    reason,
                    budget_bps: decision.budget_bps,
                });
            }
            self.current = decision.level;

            let outcome = self.fetch_segment(index, decision.budget_bps, cancel).await?;
            self.on_segment(index, outcome);
        }

        self.drain(cancel).await?;
        Ok(())
    }

    /// Hold off while the buffer has no room for another segment.
    async fn wait_for_room(&mut self, cancel: &CancellationToken) -> Result<(), Abort> {
        let room_at = self
            .session
            .max_buffer
            .saturating_sub(self.session.manifest.segment_duration());
        if room_at.is_zero() {
            return Ok(());
        }
        while self.state == PlaybackState::Playing {
            let level = self.playout.level_at(Instant::now());
            if level <= room_at {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err("cancelled".into()),
                _ = sleep(level - room_at) => {}
            }
        }
        Ok(())
    }

    /// One segment, with at most one retry.
    async fn fetch_segment(
        &mut self,
        index: u32,
        budget_bps: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, Abort> {
        let session = self.session;
        let level = self.current.clone();
        let timeout = session.fetcher.timeout();
        let mut attempt = 1;

        loop {
            self.record(TelemetryEvent::SegmentRequested {
                index,
                quality_id: level.id,
                attempt,
                budget_bps,
            });
            let cause = if attempt == 1 {
                StallCause::SlowFetch
            } else {
                StallCause::FetchRetry
            };
            let fetch = async {
                match tokio::time::timeout(timeout, session.fetcher.fetch(&level, index)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                }
            };

            let error = match self.watch(fetch, index, cause, cancel).await? {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            let retrying = attempt == 1 && !error.is_fatal();
            warn!(
                session = %session.id,
                index,
                quality = level.id,
                attempt,
                retrying,
                error = %error,
                "segment fetch failed"
            );
            self.record(TelemetryEvent::FetchFailed {
                index,
                quality_id: level.id,
                kind: error.kind().to_string(),
                error: error.to_string(),
                retrying,
            });
            if !retrying {
                return Err(format!("segment {index}: {error}"));
            }
            attempt += 1;
        }
    }

    /// Await `fetch`, entering `Stalled` at the instant the buffer runs dry.
    async fn watch<F>(
        &mut self,
        fetch: F,
        index: u32,
        cause: StallCause,
        cancel: &CancellationToken,
    ) -> Result<Result<FetchOutcome, FetchError>, Abort>
    where
        F: Future<Output = Result<FetchOutcome, FetchError>>,
    {
        tokio::pin!(fetch);
        loop {
            let depletion = match self.state {
                PlaybackState::Playing => self.playout.depletion(),
                _ => None,
            };
            let dry = async {
                match depletion {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err("cancelled".into()),
                result = &mut fetch => return Ok(result),
                _ = dry => {
                    let now = Instant::now();
                    self.playout.set_draining(now, false);
                    self.stall_started = Some(now);
                    self.transition(PlaybackState::Stalled);
                    info!(session = %self.session.id, index, ?cause, "stall");
                    self.record(TelemetryEvent::StallStart { index, cause });
                }
            }
        }
    }

    fn on_segment(&mut self, index: u32, outcome: FetchOutcome) {
        let session = self.session;
        let now = Instant::now();
        self.history.push(ThroughputSample {
            at: now.saturating_duration_since(self.started),
            bytes: outcome.bytes_len,
            elapsed: outcome.elapsed,
        });
        self.playout.add(now, session.manifest.segment_duration());
        self.record(TelemetryEvent::SegmentReceived {
            index,
            quality_id: self.current.id,
            bitrate_bps: self.current.nominal_bitrate_bps,
            bytes: outcome.bytes_len,
            elapsed_ms: millis(outcome.elapsed),
            buffer_ms: millis(self.playout.level),
            throughput_bps: self.history.harmonic_mean_bps(),
        });

        match self.state {
            PlaybackState::Stalled => {
                let stalled_for = self
                    .stall_started
                    .take()
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                self.playout.set_draining(now, true);
                self.transition(PlaybackState::Playing);
                info!(session = %session.id, ?stalled_for, "stall ended");
                self.record(TelemetryEvent::StallEnd {
                    duration_ms: millis(stalled_for),
                });
            }
            PlaybackState::Buffering => {
                let last = index + 1 == session.manifest.segment_count();
                if self.playout.level >= session.startup_threshold || last {
                    let startup_delay = now.saturating_duration_since(self.started);
                    self.playout.set_draining(now, true);
                    self.transition(PlaybackState::Playing);
                    info!(session = %session.id, ?startup_delay, "playback started");
                    self.record(TelemetryEvent::PlaybackStarted {
                        startup_delay_ms: millis(startup_delay),
                    });
                }
            }
            _ => {}
        }
    }

    /// Play out what is left after the last segment arrived.
    async fn drain(&mut self, cancel: &CancellationToken) -> Result<(), Abort> {
        if let Some(at) = self.playout.depletion() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err("cancelled".into()),
                _ = sleep_until(at) => {}
            }
        }
        Ok(())
    }

    fn finish(mut self, result: Result<(), Abort>) -> SessionReport {
        let (state, status, reason) = match result {
            Ok(()) => (PlaybackState::Finished, RunStatus::Finished, None),
            Err(reason) => (PlaybackState::Aborted, RunStatus::Aborted, Some(reason)),
        };
        self.transition(state);
        match &reason {
            None => info!(session = %self.session.id, "playback session finished"),
            Some(r) => warn!(session = %self.session.id, reason = %r, "playback session aborted"),
        }
        self.record(TelemetryEvent::RunFinished { status, reason });

        let summary = SessionSummary::from_records(&self.records).unwrap_or_else(|| {
            SessionSummary::unfinished(&self.session.id, self.session.transport())
        });
        SessionReport {
            state,
            summary,
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playout_drains_only_while_playing() {
        let t0 = Instant::now();
        let mut p = Playout {
            level: Duration::ZERO,
            since: t0,
            draining: false,
        };
        p.add(t0, Duration::from_secs(4));
        assert_eq!(p.level_at(t0 + Duration::from_secs(3)), Duration::from_secs(4));
        assert!(p.depletion().is_none());

        p.set_draining(t0 + Duration::from_secs(1), true);
        assert_eq!(p.level_at(t0 + Duration::from_secs(2)), Duration::from_secs(3));
        assert_eq!(p.depletion(), Some(t0 + Duration::from_secs(5)));
        assert_eq!(p.level_at(t0 + Duration::from_secs(9)), Duration::ZERO);

        p.set_draining(t0 + Duration::from_secs(4), false);
        assert_eq!(p.level, Duration::from_secs(1));
    }
}
