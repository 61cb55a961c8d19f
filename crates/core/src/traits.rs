use crate::models::{ChatMessage, Chunk, ResponseShape, TurnRecord};
use crate::store::{BackendDocument, BackendQuery};
use crate::SearchError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Returns the raw assistant text. With [`ResponseShape::Json`] the service is asked for a
    /// single JSON object; parsing is left to [`crate::completion::complete_typed`].
    async fn complete(
        &self,
        messages: &[ChatMessage],
        shape: ResponseShape,
    ) -> Result<String, SearchError>;
}

#[async_trait]
pub trait HybridSearchBackend: Send + Sync {
    async fn search(&self, query: &BackendQuery) -> Result<Vec<BackendDocument>, SearchError>;
}

#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), SearchError>;
}

/// Conversation history keyed by thread id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Most recent turns, oldest first.
    async fn recent_turns(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<TurnRecord>, SearchError>;

    async fn append_turn(&self, thread_id: &str, turn: TurnRecord) -> Result<(), SearchError>;
}

#[async_trait]
impl<T: HybridSearchBackend + ?Sized> HybridSearchBackend for Arc<T> {
    async fn search(&self, query: &BackendQuery) -> Result<Vec<BackendDocument>, SearchError> {
        (**self).search(query).await
    }
}

#[async_trait]
impl<T: IngestionSink + ?Sized> IngestionSink for Arc<T> {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), SearchError> {
        (**self).upsert_chunks(chunks).await
    }
}

#[async_trait]
impl<T: EmbeddingService + ?Sized> EmbeddingService for Arc<T> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        (**self).embed(text).await
    }
}
