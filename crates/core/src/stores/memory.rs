use crate::models::TurnRecord;
use crate::traits::HistoryStore;
use crate::SearchError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local history keyed by thread id.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    threads: RwLock<HashMap<String, Vec<TurnRecord>>>,
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn recent_turns(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<TurnRecord>, SearchError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|turns| turns[turns.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }

    async fn append_turn(&self, thread_id: &str, turn: TurnRecord) -> Result<(), SearchError> {
        self.threads
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_turns_are_bounded_and_ordered() -> Result<(), SearchError> {
        let store = InMemoryHistoryStore::default();
        for index in 0..5 {
            store
                .append_turn("t1", TurnRecord::new(format!("q{index}"), format!("a{index}")))
                .await?;
        }
        store.append_turn("t2", TurnRecord::new("other", "thread")).await?;

        let recent = store.recent_turns("t1", 3).await?;
        let questions: Vec<&str> = recent.iter().map(|turn| turn.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
        assert!(store.recent_turns("missing", 3).await?.is_empty());
        Ok(())
    }
}
