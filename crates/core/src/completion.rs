use crate::models::{ChatMessage, ResponseShape};
use crate::traits::CompletionService;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Asks for a JSON object and parses it into `T`.
///
/// A reply that cannot be parsed fails with [`SearchError::SchemaMismatch`]; a reply wrapped
/// in a markdown code fence is unwrapped first.
pub async fn complete_typed<T, C>(
    service: &C,
    messages: &[ChatMessage],
    name: &'static str,
) -> Result<T, SearchError>
where
    T: DeserializeOwned,
    C: CompletionService + ?Sized,
{
    let raw = service
        .complete(messages, ResponseShape::Json { name })
        .await?;
    parse_typed(&raw, name)
}

pub fn parse_typed<T: DeserializeOwned>(raw: &str, name: &str) -> Result<T, SearchError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|error| SearchError::SchemaMismatch {
        expected: name.to_string(),
        details: error.to_string(),
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest
        .split_once('\n')
        .map(|(_, body)| body)
        .unwrap_or(rest);
    body.trim_end().trim_end_matches("```").trim()
}

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        shape: ResponseShape,
    ) -> Result<String, SearchError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0,
        });
        if let ResponseShape::Json { .. } = shape {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::unavailable("completion", response.status()));
        }

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SearchError::SchemaMismatch {
                expected: "chat completion".to_string(),
                details: "missing choices[0].message.content".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanDraft;

    struct Canned(&'static str);

    #[async_trait]
    impl CompletionService for Canned {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            shape: ResponseShape,
        ) -> Result<String, SearchError> {
            assert!(matches!(shape, ResponseShape::Json { name: "PlanDraft" }));
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn typed_completion_parses_fenced_json() -> Result<(), SearchError> {
        let service = Canned("```json\n{\"useVector\": true, \"keyword\": \"badge\"}\n```");
        let draft: PlanDraft = complete_typed(&service, &[], "PlanDraft").await?;
        assert_eq!(draft.use_vector, Some(true));
        assert_eq!(draft.keyword.as_deref(), Some("badge"));
        Ok(())
    }

    #[tokio::test]
    async fn prose_reply_is_a_schema_mismatch() {
        let service = Canned("Sure! Here is your plan.");
        let result: Result<PlanDraft, _> = complete_typed(&service, &[], "PlanDraft").await;
        assert!(matches!(result, Err(SearchError::SchemaMismatch { .. })));
    }
}
