//! Segment fetchers.
//!
//! Both transports implement [`SegmentFetcher`]; the playback loop never
//! knows which one it is driving. [`http::HttpFetcher`] is the TCP variant,
//! [`udp::UdpFetcher`] the UDP variant, and [`emulated::EmulatedFetcher`]
//! models either one over an in-process emulated link.

pub mod emulated;
pub mod http;
pub mod udp;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vidbench_common::manifest::QualityLevel;

pub use emulated::EmulatedFetcher;
pub use http::HttpFetcher;
pub use udp::UdpFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Tcp, Transport::Udp];
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "http" | "dash" => Ok(Transport::Tcp),
            "udp" | "quic" => Ok(Transport::Udp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("segment fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// The segment does not exist. Never retried.
    #[error("segment {index} at quality {quality_id} not found")]
    NotFound { quality_id: u32, index: u32 },
    #[error("transient I/O error: {0}")]
    TransientIo(String),
}

impl FetchError {
    /// Whether the error ends the session without a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::ConnectionReset(_) => "connection_reset",
            FetchError::NotFound { .. } => "not_found",
            FetchError::TransientIo(_) => "transient_io",
        }
    }
}

/// What one successful fetch delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchOutcome {
    pub bytes_len: u64,
    /// Request sent to body fully received (or segment reassembled).
    pub elapsed: Duration,
}

/// Fetches one segment at one quality level.
///
/// Implementations report bytes and wall-clock transfer time regardless of
/// how many retransmissions the transport needed underneath.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    fn transport(&self) -> Transport;

    /// Upper bound on one `fetch`.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, quality: &QualityLevel, index: u32) -> Result<FetchOutcome, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names() {
        assert_eq!("QUIC".parse::<Transport>(), Ok(Transport::Udp));
        assert_eq!("dash".parse::<Transport>(), Ok(Transport::Tcp));
        assert!("sctp".parse::<Transport>().is_err());
        assert_eq!(Transport::Udp.to_string(), "udp");
    }

    #[test]
    fn only_not_found_is_fatal() {
        assert!(FetchError::NotFound { quality_id: 0, index: 9 }.is_fatal());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!FetchError::ConnectionReset("rst".into()).is_fatal());
        assert!(!FetchError::TransientIo("eio".into()).is_fatal());
    }
}
