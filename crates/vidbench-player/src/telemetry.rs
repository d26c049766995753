//! Session telemetry: the durable record of a run.
//!
//! Every playback session appends [`TelemetryRecord`]s to a shared
//! [`TelemetrySink`]. Timestamps are offsets from the scenario epoch, so
//! records of sessions that ran side by side line up. [`SessionSummary`]
//! condenses one session's records into the comparison metrics.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::abr::SwitchReason;
use crate::fetch::Transport;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode telemetry record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    Aborted,
}

/// What the session was waiting on when the buffer ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallCause {
    /// The segment download was still in flight.
    SlowFetch,
    /// The first attempt failed and the retry was still in flight.
    FetchRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RunStarted {
        wall_clock: DateTime<Utc>,
        segment_count: u32,
    },
    /// Also the record of the ABR decision that picked `quality_id`.
    SegmentRequested {
        index: u32,
        quality_id: u32,
        attempt: u32,
        budget_bps: Option<f64>,
    },
    SegmentReceived {
        index: u32,
        quality_id: u32,
        bitrate_bps: u64,
        bytes: u64,
        elapsed_ms: f64,
        buffer_ms: f64,
        /// Smoothed estimate including this segment.
        throughput_bps: Option<f64>,
    },
    FetchFailed {
        index: u32,
        quality_id: u32,
        kind: String,
        error: String,
        retrying: bool,
    },
    QualitySwitch {
        from: u32,
        to: u32,
        reason: SwitchReason,
        budget_bps: Option<f64>,
    },
    PlaybackStarted {
        startup_delay_ms: f64,
    },
    StallStart {
        index: u32,
        cause: StallCause,
    },
    StallEnd {
        duration_ms: f64,
    },
    RunFinished {
        status: RunStatus,
        reason: Option<String>,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::RunStarted { .. } => "run_started",
            TelemetryEvent::SegmentRequested { .. } => "segment_requested",
            TelemetryEvent::SegmentReceived { .. } => "segment_received",
            TelemetryEvent::FetchFailed { .. } => "fetch_failed",
            TelemetryEvent::QualitySwitch { .. } => "quality_switch",
            TelemetryEvent::PlaybackStarted { .. } => "playback_started",
            TelemetryEvent::StallStart { .. } => "stall_start",
            TelemetryEvent::StallEnd { .. } => "stall_end",
            TelemetryEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TelemetryEvent::RunFinished { .. })
    }
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(millis(*d))
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Offset from the scenario epoch.
    #[serde(rename = "t_ms", serialize_with = "serialize_millis")]
    pub at: Duration,
    pub session_id: String,
    pub transport: Transport,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Append-only destination for telemetry records.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &TelemetryRecord) -> Result<(), TelemetryError>;
    fn flush(&self) -> Result<(), TelemetryError>;
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, TelemetryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlSink {
    fn record(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        let mut writer = locked(&self.writer);
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), TelemetryError> {
        locked(&self.writer).flush()?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        locked(&self.records).clone()
    }

    pub fn session(&self, session_id: &str) -> Vec<TelemetryRecord> {
        locked(&self.records)
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        locked(&self.records).push(record.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// ─── Summary ────────────────────────────────────────────────────────────────

/// Per-session comparison metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub transport: Transport,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub startup_delay_ms: Option<f64>,
    pub segments_received: u32,
    pub bytes_received: u64,
    /// Total bytes over total transfer time.
    pub mean_throughput_bps: Option<f64>,
    pub harmonic_throughput_bps: Option<f64>,
    pub stall_count: u32,
    pub total_stall_ms: f64,
    pub quality_switches: u32,
    pub mean_bitrate_bps: Option<f64>,
    pub max_buffer_ms: f64,
    pub duration_ms: f64,
}

impl SessionSummary {
    /// A session with no recorded outcome.
    pub fn unfinished(session_id: &str, transport: Transport) -> Self {
        SessionSummary {
            session_id: session_id.to_string(),
            transport,
            status: RunStatus::Aborted,
            reason: Some("session did not finish".into()),
            startup_delay_ms: None,
            segments_received: 0,
            bytes_received: 0,
            mean_throughput_bps: None,
            harmonic_throughput_bps: None,
            stall_count: 0,
            total_stall_ms: 0.0,
            quality_switches: 0,
            mean_bitrate_bps: None,
            max_buffer_ms: 0.0,
            duration_ms: 0.0,
        }
    }

    /// Summarize the records of one session, in emission order.
    pub fn from_records(records: &[TelemetryRecord]) -> Option<Self> {
        let first = records.first()?;
        let last = records.last()?;

        let mut summary = SessionSummary::unfinished(&first.session_id, first.transport);
        summary.duration_ms = millis(last.at.saturating_sub(first.at));

        let mut transfer_ms = 0.0;
        let mut inverse_rates = 0.0;
        let mut bitrate_sum = 0.0;
        let mut open_stall: Option<Duration> = None;

        for record in records {
            match &record.event {
                TelemetryEvent::SegmentReceived {
                    bitrate_bps,
                    bytes,
                    elapsed_ms,
                    buffer_ms,
                    ..
                } => {
                    summary.segments_received += 1;
                    summary.max_buffer_ms = summary.max_buffer_ms.max(*buffer_ms);
                    summary.bytes_received += bytes;
                    transfer_ms += elapsed_ms;
                    let rate = *bytes as f64 * 8000.0 / elapsed_ms.max(1e-3);
                    if rate > 0.0 {
                        inverse_rates += 1.0 / rate;
                    }
                    bitrate_sum += *bitrate_bps as f64;
                }
                TelemetryEvent::PlaybackStarted { startup_delay_ms } => {
                    summary.startup_delay_ms = Some(*startup_delay_ms);
                }
                TelemetryEvent::StallStart { .. } => {
                    summary.stall_count += 1;
                    open_stall = Some(record.at);
                }
                TelemetryEvent::StallEnd { duration_ms } => {
                    summary.total_stall_ms += duration_ms;
                    open_stall = None;
                }
                TelemetryEvent::QualitySwitch { .. } => summary.quality_switches += 1,
                TelemetryEvent::RunFinished { status, reason } => {
                    summary.status = *status;
                    summary.reason = reason.clone();
                }
                _ => {}
            }
        }

        if let Some(since) = open_stall {
            summary.total_stall_ms += millis(last.at.saturating_sub(since));
        }
        if summary.segments_received > 0 {
            let n = summary.segments_received as f64;
            summary.mean_throughput_bps =
                Some(summary.bytes_received as f64 * 8000.0 / transfer_ms.max(1e-3));
            if inverse_rates > 0.0 {
                summary.harmonic_throughput_bps = Some(n / inverse_rates);
            }
            summary.mean_bitrate_bps = Some(bitrate_sum / n);
        }
        Some(summary)
    }
}
