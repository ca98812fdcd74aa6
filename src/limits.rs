//! Runtime-tunable limits.
//!
//! Limits can be changed while the process runs (HTTP `POST /config`,
//! `findme config set`) and are persisted to `app_config.json` under the
//! storage root so they survive a restart. Every change is validated as a
//! whole: one out-of-range value rejects the entire update.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;

use crate::error::SyncError;
use crate::layout::write_atomic;

pub const MAX_TEXT_LENGTH_RANGE: RangeInclusive<usize> = 1_000..=100_000;
pub const MAX_CHUNK_COUNT_RANGE: RangeInclusive<usize> = 50..=500;
pub const MAX_FILE_SIZE_MB_RANGE: RangeInclusive<u64> = 10..=500;

/// The fixed set of selectable embedding models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmbeddingModel {
    #[default]
    #[serde(rename = "text-embedding-v2")]
    TextEmbeddingV2,
    #[serde(rename = "text-embedding-v3")]
    TextEmbeddingV3,
}

impl EmbeddingModel {
    pub const ALL: [EmbeddingModel; 2] = [EmbeddingModel::TextEmbeddingV2, EmbeddingModel::TextEmbeddingV3];

    pub fn id(&self) -> &'static str {
        match self {
            EmbeddingModel::TextEmbeddingV2 => "text-embedding-v2",
            EmbeddingModel::TextEmbeddingV3 => "text-embedding-v3",
        }
    }

    /// Per-input budget; chunks longer than this many characters are cut.
    pub fn max_tokens(&self) -> usize {
        match self {
            EmbeddingModel::TextEmbeddingV2 => 2048,
            EmbeddingModel::TextEmbeddingV3 => 8192,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EmbeddingModel::TextEmbeddingV2 => "general text embedding, multilingual",
            EmbeddingModel::TextEmbeddingV3 => "general text embedding, 50+ languages, longer inputs",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.id() == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Characters kept per file before the truncation marker.
    #[serde(alias = "MAX_TEXT_LENGTH")]
    pub max_text_length: usize,
    /// Chunks kept per file.
    #[serde(alias = "MAX_CHUNK_COUNT")]
    pub max_chunk_count: usize,
    /// Files above this size are skipped.
    #[serde(alias = "MAX_FILE_SIZE_MB")]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub embedding_model: EmbeddingModel,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_text_length: 20_000,
            max_chunk_count: 200,
            max_file_size_mb: 100,
            embedding_model: EmbeddingModel::default(),
        }
    }
}

/// A partial change to [`Limits`]; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsUpdate {
    #[serde(default, alias = "MAX_TEXT_LENGTH")]
    pub max_text_length: Option<usize>,
    #[serde(default, alias = "MAX_CHUNK_COUNT")]
    pub max_chunk_count: Option<usize>,
    #[serde(default, alias = "MAX_FILE_SIZE_MB")]
    pub max_file_size_mb: Option<u64>,
    #[serde(default, alias = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,
}

impl LimitsUpdate {
    pub fn is_empty(&self) -> bool {
        self.max_text_length.is_none()
            && self.max_chunk_count.is_none()
            && self.max_file_size_mb.is_none()
            && self.embedding_model.is_none()
    }
}

fn check_range<T>(name: &str, value: T, range: &RangeInclusive<T>, errors: &mut Vec<String>)
where
    T: PartialOrd + std::fmt::Display,
{
    if !range.contains(&value) {
        errors.push(format!(
            "{} must be between {} and {} (got {})",
            name,
            range.start(),
            range.end(),
            value
        ));
    }
}

impl Limits {
    /// Validate `update` against the allowed ranges and return the merged limits.
    ///
    /// Nothing is applied when any field is invalid; the error lists every
    /// violation.
    pub fn apply(&self, update: &LimitsUpdate) -> Result<Limits, SyncError> {
        let mut errors = Vec::new();
        let mut next = self.clone();

        if let Some(v) = update.max_text_length {
            check_range("max_text_length", v, &MAX_TEXT_LENGTH_RANGE, &mut errors);
            next.max_text_length = v;
        }
        if let Some(v) = update.max_chunk_count {
            check_range("max_chunk_count", v, &MAX_CHUNK_COUNT_RANGE, &mut errors);
            next.max_chunk_count = v;
        }
        if let Some(v) = update.max_file_size_mb {
            check_range("max_file_size_mb", v, &MAX_FILE_SIZE_MB_RANGE, &mut errors);
            next.max_file_size_mb = v;
        }
        if let Some(id) = &update.embedding_model {
            match EmbeddingModel::parse(id) {
                Some(model) => next.embedding_model = model,
                None => errors.push(format!(
                    "embedding_model must be one of {} (got {})",
                    EmbeddingModel::ALL.map(|m| m.id()).join(", "),
                    id
                )),
            }
        }

        if errors.is_empty() {
            Ok(next)
        } else {
            Err(SyncError::Validation(errors.join("; ")))
        }
    }

    /// Whether every value lies inside its allowed range.
    pub fn is_valid(&self) -> bool {
        MAX_TEXT_LENGTH_RANGE.contains(&self.max_text_length)
            && MAX_CHUNK_COUNT_RANGE.contains(&self.max_chunk_count)
            && MAX_FILE_SIZE_MB_RANGE.contains(&self.max_file_size_mb)
    }

    /// Read persisted limits, falling back to defaults when the file is
    /// missing, unreadable or out of range.
    pub fn load(path: &Path) -> Limits {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Limits::default(),
        };
        match serde_json::from_str::<Limits>(&content) {
            Ok(limits) if limits.is_valid() => limits,
            Ok(_) => {
                tracing::warn!(path = %path.display(), "persisted limits out of range, using defaults");
                Limits::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot parse persisted limits, using defaults");
                Limits::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        let json = serde_json::to_vec_pretty(self).map_err(anyhow::Error::from)?;
        write_atomic(path, &json)?;
        Ok(())
    }
}

/// Allowed range of one numeric limit, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct RangeView {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelView {
    pub id: &'static str,
    pub max_tokens: usize,
    pub description: &'static str,
}

/// Current limits together with what may be set.
#[derive(Debug, Clone, Serialize)]
pub struct LimitsView {
    pub limits: Limits,
    pub max_text_length_range: RangeView,
    pub max_chunk_count_range: RangeView,
    pub max_file_size_mb_range: RangeView,
    pub models: Vec<ModelView>,
}

impl From<&Limits> for LimitsView {
    fn from(limits: &Limits) -> Self {
        Self {
            limits: limits.clone(),
            max_text_length_range: RangeView {
                min: *MAX_TEXT_LENGTH_RANGE.start() as u64,
                max: *MAX_TEXT_LENGTH_RANGE.end() as u64,
            },
            max_chunk_count_range: RangeView {
                min: *MAX_CHUNK_COUNT_RANGE.start() as u64,
                max: *MAX_CHUNK_COUNT_RANGE.end() as u64,
            },
            max_file_size_mb_range: RangeView {
                min: *MAX_FILE_SIZE_MB_RANGE.start(),
                max: *MAX_FILE_SIZE_MB_RANGE.end(),
            },
            models: EmbeddingModel::ALL
                .iter()
                .map(|m| ModelView {
                    id: m.id(),
                    max_tokens: m.max_tokens(),
                    description: m.description(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_valid_update() {
        let update = LimitsUpdate {
            max_text_length: Some(50_000),
            embedding_model: Some("text-embedding-v3".into()),
            ..Default::default()
        };
        let next = Limits::default().apply(&update).unwrap();
        assert_eq!(next.max_text_length, 50_000);
        assert_eq!(next.max_chunk_count, 200);
        assert_eq!(next.embedding_model, EmbeddingModel::TextEmbeddingV3);
        assert_eq!(next.embedding_model.max_tokens(), 8192);
    }

    #[test]
    fn test_apply_rejects_whole_update_on_any_violation() {
        let current = Limits::default();
        let update = LimitsUpdate {
            max_text_length: Some(30_000),
            max_chunk_count: Some(10),
            ..Default::default()
        };
        let err = current.apply(&update).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(err.to_string().contains("max_chunk_count"));
        assert_eq!(current, Limits::default());
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let update = LimitsUpdate {
            max_text_length: Some(1_000),
            max_chunk_count: Some(500),
            max_file_size_mb: Some(10),
            ..Default::default()
        };
        assert!(Limits::default().apply(&update).is_ok());
        let update = LimitsUpdate {
            max_file_size_mb: Some(501),
            ..Default::default()
        };
        assert!(Limits::default().apply(&update).is_err());
    }

    #[test]
    fn test_unknown_model_rejected() {
        let update = LimitsUpdate {
            embedding_model: Some("text-embedding-v9".into()),
            ..Default::default()
        };
        assert!(Limits::default().apply(&update).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app_config.json");
        assert_eq!(Limits::load(&path), Limits::default());

        let limits = Limits {
            max_text_length: 42_000,
            ..Limits::default()
        };
        limits.save(&path).unwrap();
        assert_eq!(Limits::load(&path), limits);
    }

    #[test]
    fn test_load_accepts_upper_case_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app_config.json");
        std::fs::write(
            &path,
            r#"{"MAX_TEXT_LENGTH": 30000, "MAX_CHUNK_COUNT": 100, "MAX_FILE_SIZE_MB": 50}"#,
        )
        .unwrap();
        let limits = Limits::load(&path);
        assert_eq!(limits.max_text_length, 30_000);
        assert_eq!(limits.max_chunk_count, 100);
        assert_eq!(limits.embedding_model, EmbeddingModel::TextEmbeddingV2);
    }

    #[test]
    fn test_load_out_of_range_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app_config.json");
        std::fs::write(
            &path,
            r#"{"max_text_length": 5, "max_chunk_count": 100, "max_file_size_mb": 50}"#,
        )
        .unwrap();
        assert_eq!(Limits::load(&path), Limits::default());
    }
}
