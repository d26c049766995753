//! Segment servers for the vidbench harness.
//!
//! - **Storage** — [`SegmentStore`](storage::SegmentStore) over a directory or synthetic payloads
//! - **HTTP** — axum router serving the manifest and segment bodies (TCP transport)
//! - **UDP** — request/chunk/NACK datagram server (UDP transport)

pub mod http;
pub mod storage;
pub mod udp;

pub use storage::{DirStore, SegmentRef, SegmentStore, StorageError, SyntheticStore};
pub use udp::UdpSegmentServer;
