use crate::traits::EmbeddingService;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Dimensionality of `text-embedding-3-small` / `ada-002`, and of the index vector field.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1_536;

/// Hashes character trigrams into a fixed-size, L2-normalized vector. Deterministic and
/// offline; useful for tests and for running without an embedding service.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        Ok(self.embed_text(text))
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbeddings {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddings {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "input": text,
                "dimensions": self.dimensions,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::unavailable("embeddings", response.status()));
        }

        let parsed: Value = response.json().await?;
        parse_embedding(&parsed)
    }
}

fn parse_embedding(payload: &Value) -> Result<Vec<f32>, SearchError> {
    let values = payload
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::SchemaMismatch {
            expected: "embedding response".to_string(),
            details: "missing data[0].embedding".to_string(),
        })?;

    values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|value| value as f32)
                .ok_or_else(|| SearchError::SchemaMismatch {
                    expected: "embedding response".to_string(),
                    details: format!("non-numeric component {value}"),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Annual leave carry-over rules");
        let second = embedder.embed_text("Annual leave carry-over rules");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn embedder_outputs_expected_length() -> Result<(), SearchError> {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("휴가 정책").await?;
        assert_eq!(vector.len(), 32);
        assert_eq!(embedder.dimensions(), 32);
        Ok(())
    }

    #[test]
    fn embedding_payload_is_parsed_or_rejected() {
        let ok = json!({"data": [{"embedding": [0.5, -0.25]}]});
        assert_eq!(parse_embedding(&ok).ok(), Some(vec![0.5, -0.25]));

        let bad = json!({"data": [{"embedding": ["x"]}]});
        assert!(matches!(
            parse_embedding(&bad),
            Err(SearchError::SchemaMismatch { .. })
        ));
        assert!(parse_embedding(&json!({})).is_err());
    }
}
