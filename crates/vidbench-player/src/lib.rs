//! Adaptive streaming client and scenario controller.
//!
//! A [`ScenarioRunner`](runner::ScenarioRunner) shapes the link, starts
//! cross traffic, and drives one [`PlaybackSession`](session::PlaybackSession)
//! per transport. Each session asks the [`AbrEngine`](abr::AbrEngine) for a
//! quality level before every fetch, pulls the segment through its
//! [`SegmentFetcher`](fetch::SegmentFetcher), and records telemetry.

pub mod abr;
pub mod config;
pub mod fetch;
pub mod runner;
pub mod session;
pub mod telemetry;

pub use abr::{AbrConfig, AbrEngine, BufferState, Decision, SwitchReason, ThroughputHistory};
pub use config::PlayerConfig;
pub use fetch::{FetchError, FetchOutcome, SegmentFetcher, Transport};
pub use runner::{ExecutionMode, ScenarioError, ScenarioReport, ScenarioRunner, ScenarioSummary};
pub use session::{PlaybackSession, PlaybackState, SessionReport};
pub use telemetry::{SessionSummary, TelemetryEvent, TelemetrySink};
