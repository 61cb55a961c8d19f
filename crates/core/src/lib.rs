pub mod chunking;
pub mod completion;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod retrieval;
pub mod shift;
pub mod store;
pub mod stores;
pub mod tokenizer;
pub mod traits;

pub use chunking::{chunk_paragraphs, make_chunk_id, normalize_whitespace, split_sentences};
pub use completion::{complete_typed, OpenAiChat};
pub use config::{
    ChunkingConfig, EngineConfig, IngestionOptions, OrchestratorConfig, ShiftConfig, ShiftWeights,
};
pub use embeddings::{CharacterNgramEmbedder, OpenAiEmbeddings, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, SearchError, TurnError};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_files, DocumentIngestor, IngestionReport, SkippedFile};
pub use models::{
    ChatMessage, Chunk, Citation, DocumentFingerprint, FileType, GroundedAnswer, PlanDraft,
    RetrievalHit, SearchPlan, TurnOutcome, TurnRecord,
};
pub use orchestrator::ConversationOrchestrator;
pub use planner::{build_filter, normalize};
pub use retrieval::RetrievalExecutor;
pub use shift::{ContextShiftDetector, ConversationState, ShiftAssessment, ShiftDecider};
pub use stores::{AzureSearchStore, InMemoryHistoryStore};
pub use tokenizer::{TiktokenCodec, TokenCodec, WordCodec};
pub use traits::{
    CompletionService, EmbeddingService, HistoryStore, HybridSearchBackend, IngestionSink,
};
