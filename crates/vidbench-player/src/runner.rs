//! # Scenario Runner
//!
//! One scenario, end to end:
//!
//! ```text
//! validate → apply profile → start cross traffic → run sessions
//!          → stop cross traffic → clear profile → flush telemetry
//! ```
//!
//! Invalid parameters fail before the link is touched. Once the profile is
//! applied, teardown runs on every path: a failing or aborted session does
//! not cancel its sibling, and external cancellation stops the sessions but
//! not the teardown.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vidbench_common::ids;
use vidbench_common::manifest::Manifest;
use vidbench_common::profile::{CrossTrafficMode, NetworkProfile, ProfileError, ScenarioParams};
use vidbench_sim::cross_traffic::{CrossTrafficError, CrossTrafficGenerator};
use vidbench_sim::impairment::{LinkShaper, ShapingError};

use crate::config::PlayerConfig;
use crate::fetch::SegmentFetcher;
use crate::session::{PlaybackSession, PlaybackState, SessionReport};
use crate::telemetry::{SessionSummary, TelemetryError, TelemetrySink};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid scenario parameters: {0}")]
    Config(#[from] ProfileError),
    #[error("a network profile is already applied ({0}); clear it first")]
    ProfileAlreadyApplied(String),
    #[error("link shaping failed: {0}")]
    LinkShaping(ShapingError),
    #[error("cross traffic failed: {0}")]
    CrossTraffic(#[from] CrossTrafficError),
    #[error("telemetry flush failed: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// How the sessions of one scenario share the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// All sessions at once, competing for the link.
    #[default]
    Concurrent,
    /// One session after the other under the same profile.
    Sequential,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Concurrent => write!(f, "concurrent"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub profile: NetworkProfile,
    pub mode: ExecutionMode,
    pub sessions: Vec<SessionReport>,
}

/// The persisted form of a [`ScenarioReport`] (`summary.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub profile: NetworkProfile,
    pub mode: ExecutionMode,
    pub sessions: Vec<SessionSummary>,
}

impl ScenarioReport {
    pub fn all_finished(&self) -> bool {
        self.sessions
            .iter()
            .all(|s| s.state == PlaybackState::Finished)
    }

    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            profile: self.profile.clone(),
            mode: self.mode,
            sessions: self.sessions.iter().map(|s| s.summary.clone()).collect(),
        }
    }

    pub fn write_summary(&self, path: &Path) -> Result<(), TelemetryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.summary())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Owns the shared link resources for the duration of a scenario.
pub struct ScenarioRunner<S, C> {
    shaper: S,
    cross_traffic: C,
    manifest: Arc<Manifest>,
    config: PlayerConfig,
    sink: Arc<dyn TelemetrySink>,
    mode: ExecutionMode,
}

impl<S: LinkShaper, C: CrossTrafficGenerator> ScenarioRunner<S, C> {
    pub fn new(
        shaper: S,
        cross_traffic: C,
        manifest: Arc<Manifest>,
        config: PlayerConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            shaper,
            cross_traffic,
            manifest,
            config,
            sink,
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn shaper(&self) -> &S {
        &self.shaper
    }

    pub fn cross_traffic(&self) -> &C {
        &self.cross_traffic
    }

    /// Run one session per fetcher under `params`.
    pub async fn run(
        &mut self,
        params: &ScenarioParams,
        fetchers: Vec<Box<dyn SegmentFetcher>>,
        cancel: CancellationToken,
    ) -> Result<ScenarioReport, ScenarioError> {
        let profile = params.validate()?;
        let run_id = ids::run_id();
        let started_at = Utc::now();
        info!(
            run = %run_id,
            %profile,
            sessions = fetchers.len(),
            mode = %self.mode,
            "scenario starting"
        );

        match self.shaper.apply(&profile) {
            Ok(()) => {}
            Err(ShapingError::AlreadyApplied(active)) => {
                error!(run = %run_id, %active, "link already shaped");
                return Err(ScenarioError::ProfileAlreadyApplied(active));
            }
            Err(e) => {
                error!(run = %run_id, error = %e, "applying profile failed");
                if let Err(clear) = self.shaper.clear() {
                    warn!(run = %run_id, error = %clear, "clearing after failed apply failed");
                }
                return Err(ScenarioError::LinkShaping(e));
            }
        }

        if profile.cross_traffic != CrossTrafficMode::None {
            if let Err(e) = self.cross_traffic.start(profile.cross_traffic) {
                error!(run = %run_id, error = %e, "starting cross traffic failed");
                self.cross_traffic.stop().await;
                if let Err(clear) = self.shaper.clear() {
                    warn!(run = %run_id, error = %clear, "clearing profile failed");
                }
                return Err(e.into());
            }
        }

        let sessions = self.play(fetchers, &cancel).await;

        self.cross_traffic.stop().await;
        let cleared = self.shaper.clear();
        if let Err(e) = &cleared {
            error!(run = %run_id, error = %e, "clearing profile failed");
        }
        self.sink.flush()?;
        cleared.map_err(ScenarioError::LinkShaping)?;

        let report = ScenarioReport {
            run_id,
            started_at,
            profile,
            mode: self.mode,
            sessions,
        };
        info!(
            run = %report.run_id,
            finished = report.all_finished(),
            cancelled = cancel.is_cancelled(),
            "scenario complete"
        );
        Ok(report)
    }

    async fn play(
        &self,
        fetchers: Vec<Box<dyn SegmentFetcher>>,
        cancel: &CancellationToken,
    ) -> Vec<SessionReport> {
        let epoch = Instant::now();
        let sessions = fetchers.into_iter().map(|fetcher| {
            PlaybackSession::new(
                fetcher,
                self.manifest.clone(),
                &self.config,
                self.sink.clone(),
                epoch,
            )
        });

        match self.mode {
            ExecutionMode::Concurrent => {
                let handles: Vec<_> = sessions.map(|s| spawn_session(s, cancel.child_token())).collect();
                futures::future::join_all(handles).await
            }
            ExecutionMode::Sequential => {
                let mut reports = Vec::new();
                for session in sessions {
                    reports.push(spawn_session(session, cancel.child_token()).await);
                }
                reports
            }
        }
    }
}

/// Run `session` on its own task. A panicking session becomes an aborted
/// report instead of unwinding through the runner.
async fn spawn_session(session: PlaybackSession, cancel: CancellationToken) -> SessionReport {
    let id = session.id().to_string();
    let transport = session.transport();
    match tokio::spawn(session.run(cancel)).await {
        Ok(report) => report,
        Err(e) => {
            error!(session = %id, %transport, error = %e, "session task failed");
            let mut summary = SessionSummary::unfinished(&id, transport);
            summary.reason = Some(format!("session task failed: {e}"));
            SessionReport {
                state: PlaybackState::Aborted,
                summary,
                records: Vec::new(),
            }
        }
    }
}
