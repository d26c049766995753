//! Fetcher that models a transfer over an [`EmulatedLink`] instead of
//! moving bytes.
//!
//! The link is sampled once when the transfer begins; the modelled time is
//! then slept on the tokio clock.
//!
//! - TCP: connection handshake RTT + request RTT + body at the lower of the
//!   fair share and the loss-limited rate (Mathis et al.).
//! - UDP: one request RTT on an established association + body at the
//!   loss-thinned fair share + one recovery RTT when loss is non-zero.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;
use vidbench_common::manifest::{Manifest, QualityLevel};
use vidbench_sim::emulated::{EmulatedLink, LinkConditions};

use super::{FetchError, FetchOutcome, SegmentFetcher, Transport};
use crate::config::TransportConfig;

/// Segment size used for the loss-limited TCP rate.
pub const TCP_MSS: f64 = 1460.0;

/// Modelled transfer time of `bytes` under `conditions`, or `None` if the
/// transfer can never complete (no capacity, total loss).
pub fn transfer_time(transport: Transport, bytes: u64, conditions: &LinkConditions) -> Option<Duration> {
    let rtt = conditions.rtt.as_secs_f64();
    let bits = bytes as f64 * 8.0;
    let loss = conditions.loss.clamp(0.0, 1.0);

    let secs = match transport {
        Transport::Tcp => {
            let loss_limited = if loss > 0.0 && rtt > 0.0 {
                TCP_MSS * 8.0 / (rtt * (2.0 * loss / 3.0).sqrt())
            } else {
                f64::INFINITY
            };
            let rate = conditions.rate_bps.min(loss_limited);
            2.0 * rtt + bits / rate
        }
        Transport::Udp => {
            let rate = conditions.rate_bps * (1.0 - loss);
            let recovery = if loss > 0.0 { rtt } else { 0.0 };
            rtt + bits / rate + recovery
        }
    };

    if secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

pub struct EmulatedFetcher {
    link: EmulatedLink,
    manifest: Arc<Manifest>,
    transport: Transport,
    timeout: Duration,
}

impl EmulatedFetcher {
    pub fn new(
        link: EmulatedLink,
        manifest: Arc<Manifest>,
        transport: Transport,
        timeout: Duration,
    ) -> Self {
        Self {
            link,
            manifest,
            transport,
            timeout,
        }
    }
}

/// One fetcher per transport, all sharing `link`.
pub fn fetchers(
    link: &EmulatedLink,
    manifest: &Arc<Manifest>,
    config: &TransportConfig,
    transports: &[Transport],
) -> Vec<Box<dyn SegmentFetcher>> {
    transports
        .iter()
        .map(|&t| {
            Box::new(EmulatedFetcher::new(
                link.clone(),
                manifest.clone(),
                t,
                config.timeout_for(t),
            )) as Box<dyn SegmentFetcher>
        })
        .collect()
}

#[async_trait]
impl SegmentFetcher for EmulatedFetcher {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, quality: &QualityLevel, index: u32) -> Result<FetchOutcome, FetchError> {
        let level = match self.manifest.level(quality.id) {
            Some(level) if self.manifest.contains_segment(index) => level,
            _ => {
                return Err(FetchError::NotFound {
                    quality_id: quality.id,
                    index,
                });
            }
        };

        let started = Instant::now();
        let transfer = self.link.begin_transfer();
        let conditions = transfer.conditions();
        let modelled = transfer_time(self.transport, level.average_segment_size, &conditions);
        trace!(transport = %self.transport, index, ?conditions, ?modelled, "emulated transfer");

        match modelled {
            Some(t) if t <= self.timeout => {
                tokio::time::sleep(t).await;
                Ok(FetchOutcome {
                    bytes_len: level.average_segment_size,
                    elapsed: started.elapsed(),
                })
            }
            _ => {
                tokio::time::sleep(self.timeout).await;
                Err(FetchError::Timeout(self.timeout))
            }
        }
    }
}
