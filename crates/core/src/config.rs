use crate::error::IngestError;
use crate::models::FileType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token budgets for the chunker. Defaults match the production ingestion settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_min_tokens: usize,
    pub target_max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_min_tokens: 800,
            target_max_tokens: 1_200,
            overlap_tokens: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.target_max_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "target_max_tokens must be positive".to_string(),
            ));
        }
        if self.overlap_tokens >= self.target_max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_tokens {} must be smaller than target_max_tokens {}",
                self.overlap_tokens, self.target_max_tokens
            )));
        }
        if self.target_min_tokens > self.target_max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "target_min_tokens {} exceeds target_max_tokens {}",
                self.target_min_tokens, self.target_max_tokens
            )));
        }
        Ok(())
    }

    /// Window advance used when hard-slicing an oversized token run.
    pub fn step(&self) -> usize {
        self.target_max_tokens
            .saturating_sub(self.overlap_tokens)
            .max(1)
    }
}

/// Weights of the linear context-shift score. They are expected to sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShiftWeights {
    pub embedding: f64,
    pub entity: f64,
    pub intent: f64,
    pub filter: f64,
    pub result: f64,
}

impl Default for ShiftWeights {
    fn default() -> Self {
        Self {
            embedding: 0.35,
            entity: 0.20,
            intent: 0.20,
            filter: 0.15,
            result: 0.10,
        }
    }
}

pub const DEFAULT_TOPIC_CHANGE_PHRASES: &[&str] = &[
    "different topic",
    "new topic",
    "change the subject",
    "changing the subject",
    "something else",
    "unrelated question",
    "switching gears",
    "moving on",
    "딴 얘기",
    "주제 바꿔",
    "그건 됐고",
    "전혀 다른",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShiftConfig {
    pub weights: ShiftWeights,
    pub threshold: f64,
    /// Smoothing factor for the topic-center moving average.
    pub center_alpha: f32,
    pub max_entities: usize,
    pub topic_change_phrases: Vec<String>,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            weights: ShiftWeights::default(),
            threshold: 0.5,
            center_alpha: 0.3,
            max_entities: 20,
            topic_change_phrases: DEFAULT_TOPIC_CHANGE_PHRASES
                .iter()
                .map(|phrase| (*phrase).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Prior turns included as history when the topic continues.
    pub history_turns: usize,
    pub max_excluded_chunk_ids: usize,
    /// Upper bound on chunk ids remembered per thread.
    pub max_surfaced_chunk_ids: usize,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_turns: 3,
            max_excluded_chunk_ids: 100,
            max_surfaced_chunk_ids: 200,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestionOptions {
    pub chunking: ChunkingConfig,
    /// Concurrent embedding calls per page.
    pub embed_concurrency: usize,
    pub file_types: Vec<FileType>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embed_concurrency: 2,
            file_types: FileType::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub ingestion: IngestionOptions,
    pub shift: ShiftConfig,
    pub orchestrator: OrchestratorConfig,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let w = ShiftWeights::default();
        let total = w.embedding + w.entity + w.intent + w.filter + w.result;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn chunking_rejects_overlap_not_below_max() {
        let config = ChunkingConfig {
            target_min_tokens: 10,
            target_max_tokens: 20,
            overlap_tokens: 20,
        };
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(ChunkingConfig::default().validate().is_ok());
    }

    #[test]
    fn engine_config_fills_missing_sections_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"orchestrator": {"history_turns": 5, "retry_delay": 50}}"#)
                .expect("partial config should parse");
        assert_eq!(config.orchestrator.history_turns, 5);
        assert_eq!(config.orchestrator.retry_delay, Duration::from_millis(50));
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.shift.threshold, 0.5);
        assert_eq!(config.ingestion.embed_concurrency, 2);
    }
}
