//! UDP segment server (the UDP transport's far end).
//!
//! Answers each request with the whole segment split into numbered chunks,
//! and re-sends the chunks a client NACKs. Recent responses are cached per
//! `(client, request_id)` so a NACK never touches storage again. A repeated
//! request for a cached response is answered from the cache too.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vidbench_common::wire::{
    self, Chunk, Datagram, ErrorCode, NackRange, SegmentRequest, DEFAULT_CHUNK_SIZE,
};

use crate::storage::SegmentStore;

const RECV_BUF: usize = 64 * 1024;
/// Responses kept for NACK recovery.
pub const DEFAULT_CACHE_ENTRIES: usize = 64;
/// Chunks sent back to back before yielding to the runtime.
const BURST: u32 = 64;

type CacheKey = (SocketAddr, u32);

/// Bounded, insertion-ordered response cache.
struct ResponseCache {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, Bytes>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, body: Bytes) {
        if self.entries.insert(key, body).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

pub struct UdpSegmentServer {
    socket: UdpSocket,
    store: Arc<dyn SegmentStore>,
    chunk_size: usize,
    cache: ResponseCache,
}

impl UdpSegmentServer {
    pub async fn bind(addr: SocketAddr, store: Arc<dyn SegmentStore>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache: ResponseCache::new(DEFAULT_CACHE_ENTRIES),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> io::Result<()> {
        info!(addr = %self.local_addr()?, chunk_size = self.chunk_size, "udp segment server listening");
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    // ICMP port-unreachable from a departed client surfaces here.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => return Err(e),
                },
            };

            let datagram = match Datagram::decode(Bytes::copy_from_slice(&buf[..n])) {
                Ok(d) => d,
                Err(e) => {
                    debug!(%peer, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            let result = match datagram {
                Datagram::Request(req) => self.on_request(peer, req).await,
                Datagram::Nack(nack) => self.on_nack(peer, nack.request_id, &nack.ranges).await,
                Datagram::Chunk(_) | Datagram::Error { .. } => Ok(()),
            };
            if let Err(e) = result {
                warn!(%peer, error = %e, "send failed");
            }
        }
    }

    async fn on_request(&mut self, peer: SocketAddr, req: SegmentRequest) -> io::Result<()> {
        let key = (peer, req.request_id);
        let body = match self.cache.get(&key) {
            Some(body) => body,
            None => {
                let store = self.store.clone();
                let read = tokio::task::spawn_blocking(move || store.read(req.quality_id, req.index))
                    .await
                    .map_err(io::Error::other)?;
                match read {
                    Ok(body) => {
                        self.cache.insert(key, body.clone());
                        body
                    }
                    Err(e) => {
                        let code = if e.is_not_found() {
                            debug!(%peer, quality_id = req.quality_id, index = req.index, "segment not found");
                            ErrorCode::NotFound
                        } else {
                            warn!(%peer, error = %e, "segment read failed");
                            ErrorCode::Internal
                        };
                        let reply = Datagram::Error {
                            request_id: req.request_id,
                            code,
                        };
                        self.socket.send_to(&reply.encode(), peer).await?;
                        return Ok(());
                    }
                }
            }
        };

        let count = wire::chunk_count(body.len(), self.chunk_size);
        trace!(%peer, request_id = req.request_id, len = body.len(), chunks = count, "sending segment");
        self.send_chunks(peer, req.request_id, &body, 0..count).await
    }

    async fn on_nack(&self, peer: SocketAddr, request_id: u32, ranges: &[NackRange]) -> io::Result<()> {
        let Some(body) = self.cache.get(&(peer, request_id)) else {
            debug!(%peer, request_id, "nack for unknown request");
            return Ok(());
        };
        let count = wire::chunk_count(body.len(), self.chunk_size);
        for range in ranges {
            let end = range.start.saturating_add(range.count).min(count);
            self.send_chunks(peer, request_id, &body, range.start..end).await?;
        }
        Ok(())
    }

    async fn send_chunks(
        &self,
        peer: SocketAddr,
        request_id: u32,
        body: &Bytes,
        indices: std::ops::Range<u32>,
    ) -> io::Result<()> {
        let chunk_count = wire::chunk_count(body.len(), self.chunk_size);
        for (sent, chunk_index) in indices.enumerate() {
            let start = (chunk_index as usize * self.chunk_size).min(body.len());
            let end = (start + self.chunk_size).min(body.len());
            let datagram = Datagram::Chunk(Chunk {
                request_id,
                chunk_index,
                chunk_count,
                total_len: body.len() as u64,
                payload: body.slice(start..end),
            });
            self.socket.send_to(&datagram.encode(), peer).await?;
            if (sent as u32 + 1) % BURST == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SyntheticStore;
    use std::time::Duration;
    use vidbench_common::manifest::Manifest;
    use vidbench_common::wire::Nack;

    #[test]
    fn cache_evicts_oldest() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut cache = ResponseCache::new(2);
        cache.insert((peer, 1), Bytes::from_static(b"a"));
        cache.insert((peer, 2), Bytes::from_static(b"b"));
        cache.insert((peer, 3), Bytes::from_static(b"c"));
        assert!(cache.get(&(peer, 1)).is_none());
        assert_eq!(cache.get(&(peer, 3)).unwrap(), Bytes::from_static(b"c"));
    }

    async fn server() -> (SocketAddr, CancellationToken) {
        let manifest = Arc::new(
            Manifest::from_ladder(Duration::from_secs(1), 2, &[(40_000, "low")]).unwrap(),
        );
        let srv = UdpSegmentServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(SyntheticStore::new(manifest)),
        )
        .await
        .unwrap()
        .with_chunk_size(1000);
        let addr = srv.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(srv.run(shutdown.clone()));
        (addr, shutdown)
    }

    async fn recv(socket: &UdpSocket) -> Datagram {
        let mut buf = vec![0u8; RECV_BUF];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Datagram::decode(Bytes::copy_from_slice(&buf[..n])).unwrap()
    }

    #[tokio::test]
    async fn request_then_nack() {
        let (addr, shutdown) = server().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        let req = Datagram::Request(SegmentRequest { request_id: 9, quality_id: 0, index: 1 });
        client.send(&req.encode()).await.unwrap();
        // 5000 bytes in 1000-byte chunks
        let mut seen = Vec::new();
        for _ in 0..5 {
            match recv(&client).await {
                Datagram::Chunk(c) => {
                    assert_eq!((c.request_id, c.chunk_count, c.total_len), (9, 5, 5000));
                    seen.push(c.chunk_index);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let nack = Datagram::Nack(Nack {
            request_id: 9,
            ranges: vec![NackRange { start: 3, count: 5 }],
        });
        client.send(&nack.encode()).await.unwrap();
        for expected in [3, 4] {
            match recv(&client).await {
                Datagram::Chunk(c) => assert_eq!(c.chunk_index, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_segment_gets_error_datagram() {
        let (addr, shutdown) = server().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        let req = Datagram::Request(SegmentRequest { request_id: 4, quality_id: 0, index: 2 });
        client.send(&req.encode()).await.unwrap();
        assert_eq!(
            recv(&client).await,
            Datagram::Error { request_id: 4, code: ErrorCode::NotFound }
        );
        shutdown.cancel();
    }
}
