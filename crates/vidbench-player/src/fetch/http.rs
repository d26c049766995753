use std::error::Error as _;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::trace;
use vidbench_common::manifest::QualityLevel;

use super::{FetchError, FetchOutcome, SegmentFetcher, Transport};

/// TCP variant: one HTTP GET per segment.
///
/// Requests go to `{base}/segments/{quality_id}/{index}`. Timing spans
/// request send to the last body byte.
pub struct HttpFetcher {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl HttpFetcher {
    /// Without `reuse_connections` no idle connection is kept, so every
    /// segment opens a fresh TCP connection.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        reuse_connections: bool,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !reuse_connections {
            builder = builder.pool_max_idle_per_host(0);
        }
        Ok(Self {
            client: builder.build()?,
            base: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn segment_url(&self, quality_id: u32, index: u32) -> String {
        format!("{}/segments/{}/{}", self.base, quality_id, index)
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            return FetchError::Timeout(self.timeout);
        }
        if e.is_connect() {
            return FetchError::ConnectionReset(e.to_string());
        }
        let mut source = e.source();
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                ) {
                    return FetchError::ConnectionReset(io_err.to_string());
                }
            }
            source = err.source();
        }
        FetchError::TransientIo(e.to_string())
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, quality: &QualityLevel, index: u32) -> Result<FetchOutcome, FetchError> {
        let url = self.segment_url(quality.id, index);
        let started = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(FetchError::NotFound {
                    quality_id: quality.id,
                    index,
                });
            }
            status if !status.is_success() => {
                return Err(FetchError::TransientIo(format!("HTTP {status} for {url}")));
            }
            _ => {}
        }

        let mut body = response.bytes_stream();
        let mut bytes_len = 0u64;
        while let Some(chunk) = body.next().await {
            bytes_len += chunk.map_err(|e| self.map_error(e))?.len() as u64;
        }

        let elapsed = started.elapsed();
        trace!(%url, bytes_len, ?elapsed, "segment received");
        Ok(FetchOutcome { bytes_len, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_url_layout() {
        let f = HttpFetcher::new("http://10.0.0.2:8080/", Duration::from_secs(1), false).unwrap();
        assert_eq!(f.segment_url(2, 17), "http://10.0.0.2:8080/segments/2/17");
    }

    #[tokio::test]
    async fn refused_connection_is_connection_reset() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let f = HttpFetcher::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2), false)
            .unwrap();
        let level = QualityLevel {
            id: 0,
            name: "low".into(),
            nominal_bitrate_bps: 1_000_000,
            average_segment_size: 250_000,
        };
        let err = f.fetch(&level, 0).await.unwrap_err();
        assert!(matches!(err, FetchError::ConnectionReset(_)), "{err:?}");
    }
}
