//! UDP variant: request/chunk transfer over one datagram socket.
//!
//! The client sends a request datagram; the server answers with the segment
//! split into numbered chunks. Chunks may arrive in any order and more than
//! once. When nothing arrives for `nack_interval`, the client NACKs the
//! missing ranges (or repeats the request if no chunk arrived yet). The
//! fetch fails with [`FetchError::Timeout`] if the segment is not
//! reassembled within the timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};
use vidbench_common::manifest::QualityLevel;
use vidbench_common::wire::{
    self, Chunk, Datagram, ErrorCode, Nack, SegmentRequest, WireError, coalesce_ranges,
};

use super::{FetchError, FetchOutcome, SegmentFetcher, Transport};

const RECV_BUF: usize = 64 * 1024;

/// Out-of-order reassembly of one segment.
#[derive(Debug)]
pub struct Reassembly {
    chunks: Vec<Option<Bytes>>,
    received: u32,
    total_len: u64,
}

impl Reassembly {
    /// Layout announced by the first chunk; refused when it cannot describe
    /// a real segment.
    pub fn new(chunk_count: u32, total_len: u64) -> Result<Self, WireError> {
        wire::check_layout(chunk_count, total_len)?;
        Ok(Self {
            chunks: vec![None; chunk_count as usize],
            received: 0,
            total_len,
        })
    }

    /// Store a chunk. Returns `false` for duplicates and chunks that do
    /// not belong to this segment's layout.
    pub fn insert(&mut self, chunk: Chunk) -> bool {
        if chunk.chunk_count as usize != self.chunks.len() || chunk.total_len != self.total_len {
            return false;
        }
        match self.chunks.get_mut(chunk.chunk_index as usize) {
            Some(slot @ None) => {
                *slot = Some(chunk.payload);
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received as usize == self.chunks.len()
    }

    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u32)
    }

    /// Concatenated body, once complete.
    pub fn into_bytes(self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.total_len as usize);
        for chunk in self.chunks.into_iter().flatten() {
            out.extend_from_slice(&chunk);
        }
        (out.len() as u64 == self.total_len).then(|| out.freeze())
    }
}

pub struct UdpFetcher {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    nack_interval: Duration,
    next_request: AtomicU32,
}

impl UdpFetcher {
    /// Bind an ephemeral local socket and connect it to `server`.
    pub async fn connect(
        server: SocketAddr,
        timeout: Duration,
        nack_interval: Duration,
    ) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().map_err(io::Error::other)?
        } else {
            "[::]:0".parse().map_err(io::Error::other)?
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            server,
            timeout,
            nack_interval,
            next_request: AtomicU32::new(1),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), FetchError> {
        self.socket
            .send(&datagram.encode())
            .await
            .map(|_| ())
            .map_err(io_error)
    }
}

fn io_error(e: io::Error) -> FetchError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => FetchError::ConnectionReset(e.to_string()),
        _ => FetchError::TransientIo(e.to_string()),
    }
}

#[async_trait]
impl SegmentFetcher for UdpFetcher {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, quality: &QualityLevel, index: u32) -> Result<FetchOutcome, FetchError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let request = Datagram::Request(SegmentRequest {
            request_id,
            quality_id: quality.id,
            index,
        });

        let started = Instant::now();
        let deadline = started + self.timeout;
        self.send(&request).await?;

        let mut buf = vec![0u8; RECV_BUF];
        let mut assembly: Option<Reassembly> = None;

        loop {
            let wake = (Instant::now() + self.nack_interval).min(deadline);
            let received = tokio::time::timeout_at(wake, self.socket.recv(&mut buf)).await;

            let n = match received {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(io_error(e)),
                Err(_) => {
                    if Instant::now() >= deadline {
                        debug!(request_id, index, "udp fetch timed out");
                        return Err(FetchError::Timeout(self.timeout));
                    }
                    match &assembly {
                        None => self.send(&request).await?,
                        Some(a) => {
                            let ranges = coalesce_ranges(a.missing());
                            trace!(request_id, ranges = ranges.len(), "sending nack");
                            self.send(&Datagram::Nack(Nack { request_id, ranges })).await?;
                        }
                    }
                    continue;
                }
            };

            let datagram = match Datagram::decode(Bytes::copy_from_slice(&buf[..n])) {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "dropping malformed datagram");
                    continue;
                }
            };
            if datagram.request_id() != request_id {
                continue;
            }

            match datagram {
                Datagram::Chunk(chunk) => {
                    if assembly.is_none() {
                        match Reassembly::new(chunk.chunk_count, chunk.total_len) {
                            Ok(a) => assembly = Some(a),
                            Err(e) => {
                                debug!(request_id, error = %e, "dropping chunk");
                                continue;
                            }
                        }
                    }
                    let Some(a) = assembly.as_mut() else {
                        continue;
                    };
                    a.insert(chunk);
                    if a.is_complete() {
                        let elapsed = started.elapsed();
                        let body = assembly
                            .take()
                            .and_then(Reassembly::into_bytes)
                            .ok_or_else(|| {
                                FetchError::TransientIo("reassembled length mismatch".into())
                            })?;
                        return Ok(FetchOutcome {
                            bytes_len: body.len() as u64,
                            elapsed,
                        });
                    }
                }
                Datagram::Error {
                    code: ErrorCode::NotFound,
                    ..
                } => {
                    return Err(FetchError::NotFound {
                        quality_id: quality.id,
                        index,
                    });
                }
                Datagram::Error {
                    code: ErrorCode::Internal,
                    ..
                } => {
                    return Err(FetchError::TransientIo(format!(
                        "server failed to read segment {index} at quality {}",
                        quality.id
                    )));
                }
                Datagram::Request(_) | Datagram::Nack(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, count: u32, payload: &'static [u8], total: u64) -> Chunk {
        Chunk {
            request_id: 1,
            chunk_index: index,
            chunk_count: count,
            total_len: total,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn reassembles_out_of_order_and_ignores_duplicates() {
        let mut a = Reassembly::new(3, 7).unwrap();
        assert!(a.insert(chunk(2, 3, b"g", 7)));
        assert!(a.insert(chunk(0, 3, b"abc", 7)));
        assert!(!a.insert(chunk(0, 3, b"abc", 7)));
        assert_eq!(a.missing().collect::<Vec<_>>(), vec![1]);
        assert!(!a.is_complete());
        assert!(a.insert(chunk(1, 3, b"def", 7)));
        assert!(a.is_complete());
        assert_eq!(&a.into_bytes().unwrap()[..], b"abcdefg");
    }

    #[test]
    fn rejects_chunks_from_another_layout() {
        let mut a = Reassembly::new(2, 4).unwrap();
        assert!(!a.insert(chunk(0, 3, b"ab", 4)));
        assert!(!a.insert(chunk(0, 2, b"ab", 5)));
        assert!(!a.insert(chunk(5, 2, b"ab", 4)));
        assert_eq!(a.missing().count(), 2);
    }

    #[test]
    fn refuses_impossible_layouts() {
        assert_eq!(
            Reassembly::new(u32::MAX, 4).unwrap_err(),
            WireError::BadChunkLayout { count: u32::MAX, total_len: 4 }
        );
        assert!(Reassembly::new(1, wire::MAX_SEGMENT_LEN + 1).is_err());
        assert!(Reassembly::new(1, 0).is_ok());
    }

    #[tokio::test]
    async fn oversized_chunk_count_is_dropped() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fetcher = UdpFetcher::connect(
            server.local_addr().unwrap(),
            Duration::from_secs(2),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let Datagram::Request(req) = Datagram::decode(Bytes::copy_from_slice(&buf[..n])).unwrap()
            else {
                panic!("expected a request");
            };
            let bogus = Datagram::Chunk(Chunk {
                request_id: req.request_id,
                chunk_index: 0,
                chunk_count: u32::MAX,
                total_len: 4,
                payload: Bytes::from_static(b"junk"),
            });
            let real = Datagram::Chunk(Chunk {
                request_id: req.request_id,
                chunk_index: 0,
                chunk_count: 1,
                total_len: 4,
                payload: Bytes::from_static(b"abcd"),
            });
            server.send_to(&bogus.encode(), peer).await.unwrap();
            server.send_to(&real.encode(), peer).await.unwrap();
        });

        let level = QualityLevel {
            id: 0,
            name: "low".into(),
            nominal_bitrate_bps: 16,
            average_segment_size: 4,
        };
        let out = fetcher.fetch(&level, 0).await.unwrap();
        assert_eq!(out.bytes_len, 4);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fetcher = UdpFetcher::connect(
            silent.local_addr().unwrap(),
            Duration::from_millis(150),
            Duration::from_millis(40),
        )
        .await
        .unwrap();
        let level = QualityLevel {
            id: 0,
            name: "low".into(),
            nominal_bitrate_bps: 1_000_000,
            average_segment_size: 250_000,
        };
        let err = fetcher.fetch(&level, 0).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout(Duration::from_millis(150)));
    }
}
