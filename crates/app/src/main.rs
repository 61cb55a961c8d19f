use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use doc_chat_core::{
    AzureSearchStore, CharacterNgramEmbedder, ChunkingConfig, ContextShiftDetector,
    ConversationOrchestrator, DocumentIngestor, EmbeddingService, EngineConfig,
    InMemoryHistoryStore, LopdfExtractor, OpenAiChat, OpenAiEmbeddings, RetrievalExecutor,
    TiktokenCodec, TurnOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Azure AI Search service endpoint
    #[arg(long, env = "AZURE_SEARCH_ENDPOINT")]
    search_endpoint: String,

    /// Azure AI Search admin key
    #[arg(long, env = "AZURE_SEARCH_KEY", hide_env_values = true)]
    search_key: String,

    /// Index holding the document chunks
    #[arg(long, env = "AZURE_SEARCH_INDEX", default_value = "document-v1")]
    search_index: String,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "")]
    openai_api_key: String,

    #[arg(long, env = "OPENAI_CHAT_MODEL", default_value = "gpt-4o-mini")]
    chat_model: String,

    #[arg(long, env = "OPENAI_EMBED_MODEL", default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Use the deterministic local embedder instead of the embedding API.
    #[arg(long, default_value_t = false)]
    offline_embedder: bool,

    #[arg(long, default_value_t = doc_chat_core::DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Prior turns sent with a question that continues the topic.
    #[arg(long, default_value_t = 3)]
    history_turns: usize,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, default_value_t = 800)]
    chunk_min_tokens: usize,

    #[arg(long, default_value_t = 1200)]
    chunk_max_tokens: usize,

    #[arg(long, default_value_t = 200)]
    chunk_overlap_tokens: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Create the search index if it does not exist.
    CreateIndex,
    /// Ingest a folder of documents into the index.
    Ingest {
        /// Folder searched recursively for pdf, pptx and docx files.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Ask a single question.
    Ask {
        #[arg(long, default_value = "default")]
        thread: String,
        #[arg(long)]
        question: String,
    },
    /// Interactive conversation on one thread.
    Chat {
        #[arg(long, default_value = "default")]
        thread: String,
    },
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.ingestion.chunking = ChunkingConfig {
            target_min_tokens: self.chunk_min_tokens,
            target_max_tokens: self.chunk_max_tokens,
            overlap_tokens: self.chunk_overlap_tokens,
        };
        config.orchestrator.history_turns = self.history_turns;
        config.orchestrator.max_attempts = self.max_attempts;
        config
    }

    fn embedder(&self) -> Arc<dyn EmbeddingService> {
        if self.offline_embedder {
            Arc::new(CharacterNgramEmbedder {
                dimensions: self.embedding_dimensions,
            })
        } else {
            Arc::new(OpenAiEmbeddings::new(
                &self.openai_base_url,
                &self.openai_api_key,
                &self.embed_model,
                self.embedding_dimensions,
            ))
        }
    }
}

type Orchestrator = ConversationOrchestrator<
    Arc<AzureSearchStore>,
    Arc<dyn EmbeddingService>,
    OpenAiChat,
    InMemoryHistoryStore,
>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config();

    let store = Arc::new(
        AzureSearchStore::new(&cli.search_endpoint, &cli.search_index, &cli.search_key)?
            .with_vector_dimensions(cli.embedding_dimensions),
    );

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index = %cli.search_index,
        "doc-chat boot"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    match &cli.command {
        Command::CreateIndex => {
            store.ensure_index().await.context("creating search index")?;
            println!("index {} is ready", cli.search_index);
        }
        Command::Ingest { folder } => {
            store.ensure_index().await.context("creating search index")?;
            let ingestor = DocumentIngestor::new(
                cli.embedder(),
                store.clone(),
                Arc::new(TiktokenCodec::cl100k()?),
                Arc::new(LopdfExtractor),
                config.ingestion.clone(),
            )?;

            let report = ingestor
                .ingest_folder(folder, &shutdown)
                .await
                .with_context(|| format!("ingesting {}", folder.display()))?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }
            println!(
                "{} chunks from {} document(s) ingested at {} ({} skipped)",
                report.total_chunks(),
                report.documents.len(),
                Utc::now().to_rfc3339(),
                report.skipped_files.len()
            );
        }
        Command::Ask { thread, question } => {
            let orchestrator = build_orchestrator(&cli, store.clone(), &config);
            let outcome = orchestrator.ask(thread, question, &shutdown).await?;
            print_outcome(&outcome, false);
        }
        Command::Chat { thread } => {
            let orchestrator = build_orchestrator(&cli, store.clone(), &config);
            chat(&orchestrator, thread, &shutdown).await?;
        }
    }

    Ok(())
}

fn build_orchestrator(cli: &Cli, store: Arc<AzureSearchStore>, config: &EngineConfig) -> Orchestrator {
    ConversationOrchestrator::new(
        RetrievalExecutor::new(store, cli.embedder()),
        OpenAiChat::new(&cli.openai_base_url, &cli.openai_api_key, &cli.chat_model),
        InMemoryHistoryStore::default(),
        ContextShiftDetector::from_config(&config.shift),
        config.orchestrator.clone(),
    )
}

async fn chat(
    orchestrator: &Orchestrator,
    thread: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(question) = line else { break };
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match orchestrator.ask(thread, question, shutdown).await {
            Ok(outcome) => print_outcome(&outcome, true),
            Err(error) => {
                warn!(%error, "turn failed");
                println!("could not answer: {error}");
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &TurnOutcome, show_signals: bool) {
    if show_signals {
        if let Some(shift) = outcome.shift() {
            let signals = &shift.signals;
            println!(
                "shift: score={:.3} shifted={} emb_sim={:.3} entity_jaccard={:.3} intent_new={} filter_changed={:.2} result_overlap={:.3}",
                shift.verdict.score,
                shift.verdict.shifted,
                signals.embedding_similarity,
                signals.entity_jaccard,
                signals.intent_is_new,
                signals.filter_changed_ratio,
                signals.result_overlap
            );
        }
    }

    match outcome {
        TurnOutcome::Answered(answer) => {
            println!("{}", answer.answer);
            for citation in &answer.citations {
                println!("  [{} p.{}]", citation.file, citation.page);
            }
            if answer.dropped_citations > 0 {
                println!("  ({} unsupported citation(s) removed)", answer.dropped_citations);
            }
        }
        TurnOutcome::NoEvidence { .. } => {
            println!("No grounded answer is possible: no matching passages were found.");
        }
        TurnOutcome::Unanswered { hits, .. } => {
            println!(
                "Could not answer from the {} retrieved passage(s).",
                hits.len()
            );
        }
    }
}
