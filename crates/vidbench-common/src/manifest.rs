//! Manifest model — the quality ladder and segment layout of one piece of content.
//!
//! A [`Manifest`] is loaded once per scenario and is read-only afterwards.
//! Every quality level carries the same number of segments and segment `N`
//! is the same slice of media time at every level.
//!
//! Manifests are described in TOML or JSON:
//!
//! ```toml
//! segment_duration_secs = 2.0
//! segment_count = 30
//!
//! [[levels]]
//! name = "low"
//! bitrate_bps = 1_000_000
//!
//! [[levels]]
//! name = "high"
//! bitrate_bps = 6_000_000
//! average_segment_size = 1_500_000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest has no quality levels")]
    NoLevels,
    #[error("segment duration must be positive, got {0}")]
    InvalidDuration(f64),
    #[error("segment count must be positive")]
    NoSegments,
    #[error("quality level {index} has zero bitrate")]
    ZeroBitrate { index: usize },
    #[error("two quality levels share bitrate {0} bps")]
    DuplicateBitrate(u64),
    #[error("quality level ids must increase with bitrate (id {id} follows {previous})")]
    NonMonotonicIds { previous: u32, id: u32 },
    #[error("invalid manifest TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
}

/// One available encoding of the content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualityLevel {
    /// Ordinal, increasing with `nominal_bitrate_bps`.
    pub id: u32,
    /// Human readable label ("360p", "low", ...).
    pub name: String,
    /// Nominal encoding bitrate in bits/sec.
    pub nominal_bitrate_bps: u64,
    /// Average size of one segment at this level, in bytes.
    pub average_segment_size: u64,
}

/// Immutable description of the quality ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    segment_duration: Duration,
    levels: Vec<QualityLevel>,
    segment_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManifestInput {
    pub segment_duration_secs: f64,
    pub segment_count: u32,
    pub levels: Vec<LevelInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LevelInput {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub bitrate_bps: u64,
    pub average_segment_size: Option<u64>,
}

impl ManifestInput {
    /// Validate the document and produce an ordered [`Manifest`].
    ///
    /// Levels are sorted by bitrate. Missing ids are assigned by position,
    /// missing segment sizes are derived from bitrate × segment duration.
    pub fn resolve(self) -> Result<Manifest, ManifestError> {
        if !(self.segment_duration_secs > 0.0) || !self.segment_duration_secs.is_finite() {
            return Err(ManifestError::InvalidDuration(self.segment_duration_secs));
        }
        if self.segment_count == 0 {
            return Err(ManifestError::NoSegments);
        }
        if self.levels.is_empty() {
            return Err(ManifestError::NoLevels);
        }
        if let Some(index) = self.levels.iter().position(|l| l.bitrate_bps == 0) {
            return Err(ManifestError::ZeroBitrate { index });
        }

        let mut inputs = self.levels;
        inputs.sort_by_key(|l| l.bitrate_bps);

        let duration = Duration::from_secs_f64(self.segment_duration_secs);
        let mut levels: Vec<QualityLevel> = Vec::with_capacity(inputs.len());
        for (pos, input) in inputs.into_iter().enumerate() {
            let id = input.id.unwrap_or(pos as u32);
            if let Some(prev) = levels.last() {
                if prev.nominal_bitrate_bps == input.bitrate_bps {
                    return Err(ManifestError::DuplicateBitrate(input.bitrate_bps));
                }
                if id <= prev.id {
                    return Err(ManifestError::NonMonotonicIds {
                        previous: prev.id,
                        id,
                    });
                }
            }
            let average_segment_size = input.average_segment_size.unwrap_or_else(|| {
                (input.bitrate_bps as f64 * self.segment_duration_secs / 8.0).round() as u64
            });
            levels.push(QualityLevel {
                id,
                name: input.name.unwrap_or_else(|| format!("q{id}")),
                nominal_bitrate_bps: input.bitrate_bps,
                average_segment_size,
            });
        }

        Ok(Manifest {
            segment_duration: duration,
            levels,
            segment_count: self.segment_count,
        })
    }
}

impl Manifest {
    /// Build a manifest from `(bitrate_bps, name)` pairs; segment sizes are
    /// derived from the bitrate.
    pub fn from_ladder(
        segment_duration: Duration,
        segment_count: u32,
        ladder: &[(u64, &str)],
    ) -> Result<Self, ManifestError> {
        ManifestInput {
            segment_duration_secs: segment_duration.as_secs_f64(),
            segment_count,
            levels: ladder
                .iter()
                .map(|(bps, name)| LevelInput {
                    id: None,
                    name: Some((*name).to_string()),
                    bitrate_bps: *bps,
                    average_segment_size: None,
                })
                .collect(),
        }
        .resolve()
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ManifestError> {
        let parsed: ManifestInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_json_str(input: &str) -> Result<Self, ManifestError> {
        let parsed: ManifestInput = serde_json::from_str(input)?;
        parsed.resolve()
    }

    /// Load a manifest file; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn segment_duration(&self) -> Duration {
        self.segment_duration
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// All levels, ordered by id (and therefore by bitrate).
    pub fn levels(&self) -> &[QualityLevel] {
        &self.levels
    }

    pub fn lowest(&self) -> &QualityLevel {
        &self.levels[0]
    }

    pub fn highest(&self) -> &QualityLevel {
        &self.levels[self.levels.len() - 1]
    }

    pub fn level(&self, id: u32) -> Option<&QualityLevel> {
        self.levels.iter().find(|l| l.id == id)
    }

    /// Position of a level in the ladder (0 = lowest).
    pub fn rank(&self, id: u32) -> Option<usize> {
        self.levels.iter().position(|l| l.id == id)
    }

    /// Whether `index` names a segment of this content.
    pub fn contains_segment(&self, index: u32) -> bool {
        index < self.segment_count
    }

    /// Total media duration of the content.
    pub fn media_duration(&self) -> Duration {
        self.segment_duration * self.segment_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_manifest_sorts_levels() {
        let toml = r#"
            segment_duration_secs = 2.0
            segment_count = 10

            [[levels]]
            name = "high"
            bitrate_bps = 6000000

            [[levels]]
            name = "low"
            bitrate_bps = 1000000
            average_segment_size = 240000
        "#;
        let m = Manifest::from_toml_str(toml).unwrap();
        assert_eq!(m.levels().len(), 2);
        assert_eq!(m.lowest().name, "low");
        assert_eq!(m.lowest().id, 0);
        assert_eq!(m.lowest().average_segment_size, 240_000);
        assert_eq!(m.highest().id, 1);
        // 6 Mbit/s × 2 s / 8
        assert_eq!(m.highest().average_segment_size, 1_500_000);
        assert_eq!(m.segment_duration(), Duration::from_secs(2));
        assert_eq!(m.media_duration(), Duration::from_secs(20));
    }

    #[test]
    fn parse_json_manifest() {
        let json = r#"{
            "segment_duration_secs": 4.0,
            "segment_count": 3,
            "levels": [{"id": 10, "bitrate_bps": 500000}, {"id": 20, "bitrate_bps": 900000}]
        }"#;
        let m = Manifest::from_json_str(json).unwrap();
        assert_eq!(m.rank(20), Some(1));
        assert!(m.level(15).is_none());
        assert!(m.contains_segment(2));
        assert!(!m.contains_segment(3));
    }

    #[test]
    fn rejects_ids_that_disagree_with_bitrate_order() {
        let input = ManifestInput {
            segment_duration_secs: 2.0,
            segment_count: 5,
            levels: vec![
                LevelInput {
                    id: Some(2),
                    bitrate_bps: 1_000,
                    ..Default::default()
                },
                LevelInput {
                    id: Some(1),
                    bitrate_bps: 2_000,
                    ..Default::default()
                },
            ],
        };
        assert!(matches!(
            input.resolve(),
            Err(ManifestError::NonMonotonicIds { previous: 2, id: 1 })
        ));
    }

    #[test]
    fn rejects_empty_and_degenerate_documents() {
        assert!(matches!(
            Manifest::from_toml_str("segment_duration_secs = 2.0\nsegment_count = 1"),
            Err(ManifestError::NoLevels)
        ));
        assert!(matches!(
            Manifest::from_ladder(Duration::ZERO, 1, &[(1, "a")]),
            Err(ManifestError::InvalidDuration(_))
        ));
        assert!(matches!(
            Manifest::from_ladder(Duration::from_secs(1), 0, &[(1, "a")]),
            Err(ManifestError::NoSegments)
        ));
        assert!(matches!(
            Manifest::from_ladder(Duration::from_secs(1), 1, &[(5, "a"), (5, "b")]),
            Err(ManifestError::DuplicateBitrate(5))
        ));
    }
}
