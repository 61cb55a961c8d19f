use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("backend error during ingestion: {0}")]
    Backend(#[from] SearchError),

    #[error("ingestion cancelled")]
    Cancelled,
}

/// Failures at the collaborator boundary: search backend, embedding and completion services.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{backend} unavailable: {details}")]
    BackendUnavailable { backend: String, details: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("response did not match expected {expected}: {details}")]
    SchemaMismatch { expected: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl SearchError {
    pub fn unavailable(backend: impl Into<String>, details: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            details: details.to_string(),
        }
    }

    /// Whether the orchestrator may retry the whole turn after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidQuery(_) | Self::Cancelled)
    }
}

/// Failure of a whole conversation turn, as reported to callers.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("backend unavailable after {attempts} attempt(s): {source}")]
    BackendUnavailable {
        attempts: u32,
        #[source]
        source: SearchError,
    },

    #[error("query rejected by backend: {0}")]
    InvalidQuery(String),

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Final classification of a backend failure once retries have stopped.
    pub fn after_attempts(error: SearchError, attempts: u32) -> Self {
        match error {
            SearchError::Cancelled => Self::Cancelled,
            SearchError::InvalidQuery(details) => Self::InvalidQuery(details),
            source => Self::BackendUnavailable { attempts, source },
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_mismatch_is_retryable_but_cancellation_is_not() {
        let mismatch = SearchError::SchemaMismatch {
            expected: "PlanDraft".to_string(),
            details: "eof".to_string(),
        };
        assert!(mismatch.is_retryable());
        assert!(SearchError::unavailable("search", "503").is_retryable());
        assert!(!SearchError::Cancelled.is_retryable());
        assert!(!SearchError::InvalidQuery("bad filter".to_string()).is_retryable());
    }

    #[test]
    fn final_failure_keeps_query_rejections_distinct() {
        assert!(matches!(
            TurnError::after_attempts(SearchError::InvalidQuery("bad filter".to_string()), 1),
            TurnError::InvalidQuery(_)
        ));
        assert!(matches!(
            TurnError::after_attempts(SearchError::Cancelled, 2),
            TurnError::Cancelled
        ));
        assert!(matches!(
            TurnError::after_attempts(SearchError::unavailable("search", "503"), 3),
            TurnError::BackendUnavailable { attempts: 3, .. }
        ));
    }
}
