//! Segment storage behind both servers.
//!
//! [`DirStore`] serves encoded segments from disk, laid out as
//! `{root}/{quality_id}/seg_{index:05}.m4s`. [`SyntheticStore`] produces
//! deterministic payloads sized from a manifest, so a scenario can run
//! without any video content.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use vidbench_common::manifest::Manifest;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("quality level {0} does not exist")]
    UnknownQuality(u32),
    #[error("segment {index} at quality {quality_id} does not exist")]
    NotFound { quality_id: u32, index: u32 },
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::UnknownQuality(_) | StorageError::NotFound { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    pub quality_id: u32,
    pub index: u32,
    pub len: u64,
}

pub trait SegmentStore: Send + Sync {
    /// Segments of one quality level, ordered by index.
    fn list_segments(&self, quality_id: u32) -> Result<Vec<SegmentRef>, StorageError>;

    fn read(&self, quality_id: u32, index: u32) -> Result<Bytes, StorageError>;
}

impl<T: SegmentStore + ?Sized> SegmentStore for Arc<T> {
    fn list_segments(&self, quality_id: u32) -> Result<Vec<SegmentRef>, StorageError> {
        (**self).list_segments(quality_id)
    }

    fn read(&self, quality_id: u32, index: u32) -> Result<Bytes, StorageError> {
        (**self).read(quality_id, index)
    }
}

// ─── Directory ──────────────────────────────────────────────────────────────

pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, quality_id: u32, index: u32) -> PathBuf {
        self.root
            .join(quality_id.to_string())
            .join(format!("seg_{index:05}.m4s"))
    }
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_prefix("seg_")?.strip_suffix(".m4s")?.parse().ok()
}

impl SegmentStore for DirStore {
    fn list_segments(&self, quality_id: u32) -> Result<Vec<SegmentRef>, StorageError> {
        let dir = self.root.join(quality_id.to_string());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::UnknownQuality(quality_id));
            }
            Err(e) => return Err(e.into()),
        };

        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(index) = entry.file_name().to_str().and_then(parse_segment_name) else {
                continue;
            };
            let meta = entry.metadata()?;
            if meta.is_file() {
                segments.push(SegmentRef {
                    quality_id,
                    index,
                    len: meta.len(),
                });
            }
        }
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    fn read(&self, quality_id: u32, index: u32) -> Result<Bytes, StorageError> {
        match std::fs::read(self.segment_path(quality_id, index)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { quality_id, index })
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Synthetic ──────────────────────────────────────────────────────────────

/// Payloads of `average_segment_size` bytes for every level and index of
/// the manifest.
pub struct SyntheticStore {
    manifest: Arc<Manifest>,
}

impl SyntheticStore {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self { manifest }
    }
}

/// Same (quality, index) always yields the same bytes.
fn synthetic_payload(quality_id: u32, index: u32, len: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(len as usize);
    let mut state = ((quality_id as u64) << 32) | index as u64 | 1;
    while (buf.len() as u64) < len {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let remaining = (len - buf.len() as u64).min(8) as usize;
        buf.put_slice(&state.to_le_bytes()[..remaining]);
    }
    buf.freeze()
}

impl SegmentStore for SyntheticStore {
    fn list_segments(&self, quality_id: u32) -> Result<Vec<SegmentRef>, StorageError> {
        let level = self
            .manifest
            .level(quality_id)
            .ok_or(StorageError::UnknownQuality(quality_id))?;
        Ok((0..self.manifest.segment_count())
            .map(|index| SegmentRef {
                quality_id,
                index,
                len: level.average_segment_size,
            })
            .collect())
    }

    fn read(&self, quality_id: u32, index: u32) -> Result<Bytes, StorageError> {
        let level = self
            .manifest
            .level(quality_id)
            .ok_or(StorageError::UnknownQuality(quality_id))?;
        if !self.manifest.contains_segment(index) {
            return Err(StorageError::NotFound { quality_id, index });
        }
        Ok(synthetic_payload(quality_id, index, level.average_segment_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manifest() -> Arc<Manifest> {
        Arc::new(
            Manifest::from_ladder(Duration::from_secs(2), 3, &[(400_000, "low"), (800_000, "high")])
                .unwrap(),
        )
    }

    #[test]
    fn synthetic_sizes_follow_manifest() {
        let store = SyntheticStore::new(manifest());
        let segs = store.list_segments(1).unwrap();
        assert_eq!(segs.len(), 3);
        assert!(segs.iter().all(|s| s.len == 200_000));
        assert_eq!(store.read(0, 2).unwrap().len(), 100_000);
        assert_eq!(store.read(0, 2).unwrap(), store.read(0, 2).unwrap());
        assert_ne!(store.read(0, 1).unwrap(), store.read(0, 2).unwrap());
    }

    #[test]
    fn synthetic_out_of_range_is_not_found() {
        let store = SyntheticStore::new(manifest());
        assert!(matches!(
            store.read(0, 3),
            Err(StorageError::NotFound { quality_id: 0, index: 3 })
        ));
        assert!(matches!(store.read(9, 0), Err(StorageError::UnknownQuality(9))));
        assert!(store.list_segments(9).unwrap_err().is_not_found());
    }

    #[test]
    fn dir_store_lists_in_index_order() {
        let root = std::env::temp_dir().join(format!("vidbench-store-{}", std::process::id()));
        let store = DirStore::new(&root);
        std::fs::create_dir_all(root.join("0")).unwrap();
        for (index, body) in [(2u32, &b"cc"[..]), (0, &b"a"[..]), (1, &b"bbb"[..])] {
            std::fs::write(store.segment_path(0, index), body).unwrap();
        }
        std::fs::write(root.join("0").join("init.mp4"), b"ignored").unwrap();

        let segs = store.list_segments(0).unwrap();
        let listed: Vec<(u32, u64)> = segs.iter().map(|s| (s.index, s.len)).collect();
        assert_eq!(listed, vec![(0, 1), (1, 3), (2, 2)]);
        assert_eq!(&store.read(0, 1).unwrap()[..], b"bbb");
        assert!(store.read(0, 7).unwrap_err().is_not_found());
        assert!(matches!(store.list_segments(4), Err(StorageError::UnknownQuality(4))));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn segment_names() {
        assert_eq!(parse_segment_name("seg_00042.m4s"), Some(42));
        assert_eq!(parse_segment_name("seg_x.m4s"), None);
        assert_eq!(parse_segment_name("init.mp4"), None);
    }
}
