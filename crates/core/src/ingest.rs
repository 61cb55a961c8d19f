use crate::chunking::{chunk_paragraphs, make_chunk_id};
use crate::config::{ChunkingConfig, IngestionOptions};
use crate::extractor::{clean_page_text, extract_page_texts, split_paragraphs, PageText, PdfExtractor};
use crate::models::{Chunk, DocumentFingerprint, FileType};
use crate::tokenizer::TokenCodec;
use crate::traits::{EmbeddingService, IngestionSink};
use crate::{IngestError, SearchError};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Hex characters of the file-name digest used as the document id.
const DOC_ID_LEN: usize = 16;

/// Files under `folder` whose extension is in `allowed`, recursively and sorted.
pub fn discover_files(folder: &Path, allowed: &[FileType]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_allowed =
            FileType::from_path(entry.path()).is_some_and(|kind| allowed.contains(&kind));
        if is_allowed {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stable id derived from the file name only, so re-ingesting a moved file overwrites it.
pub fn document_id(file_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(DOC_ID_LEN);
    digest
}

pub fn build_document_fingerprint(path: &Path) -> Result<DocumentFingerprint, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;
    let file_type = FileType::from_path(path).ok_or_else(|| {
        IngestError::InvalidArgument(format!("unsupported file type: {}", path.display()))
    })?;

    Ok(DocumentFingerprint {
        doc_id: document_id(name),
        file_name: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        file_type,
        checksum: digest_file(path)?,
        ingested_at: Utc::now(),
    })
}

/// Chunks every page of a document. Sequence numbers restart at zero on each page and are
/// fixed here, before any embedding is dispatched. Vectors are left empty.
pub fn build_chunks(
    fingerprint: &DocumentFingerprint,
    pages: &[PageText],
    codec: &dyn TokenCodec,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    let mut chunks = Vec::new();

    for page in pages {
        let paragraphs = split_paragraphs(&clean_page_text(&page.text));
        let contents = chunk_paragraphs(&paragraphs, codec, config)?;

        for (seq, content) in contents.filter(|text| !text.is_empty()).enumerate() {
            let seq = u32::try_from(seq).map_err(|_| {
                IngestError::InvalidArgument(format!("too many chunks on page {}", page.number))
            })?;
            chunks.push(Chunk {
                chunk_id: make_chunk_id(&fingerprint.doc_id, page.number, seq),
                doc_id: fingerprint.doc_id.clone(),
                source_file_type: fingerprint.file_type,
                source_file_path: fingerprint.source_path.clone(),
                source_file_name: fingerprint.file_name.clone(),
                page: page.number,
                content,
                content_vector: Vec::new(),
            });
        }
    }

    Ok(chunks)
}

#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub path: PathBuf,
    pub doc_id: String,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub documents: Vec<IngestedDocument>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn total_chunks(&self) -> usize {
        self.documents.iter().map(|document| document.chunks).sum()
    }
}

/// Extract, chunk, embed and upsert documents into an [`IngestionSink`].
pub struct DocumentIngestor<E, S> {
    embedder: E,
    sink: S,
    codec: Arc<dyn TokenCodec>,
    extractor: Arc<dyn PdfExtractor>,
    options: IngestionOptions,
}

impl<E, S> DocumentIngestor<E, S>
where
    E: EmbeddingService,
    S: IngestionSink,
{
    pub fn new(
        embedder: E,
        sink: S,
        codec: Arc<dyn TokenCodec>,
        extractor: Arc<dyn PdfExtractor>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        options.chunking.validate()?;
        Ok(Self {
            embedder,
            sink,
            codec,
            extractor,
            options,
        })
    }

    /// Ingests one document as a single upsert batch.
    pub async fn ingest_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestedDocument, IngestError> {
        let fingerprint = build_document_fingerprint(path)?;
        let pages = extract_page_texts(self.extractor.as_ref(), path, fingerprint.file_type)?;
        let chunks = build_chunks(
            &fingerprint,
            &pages,
            self.codec.as_ref(),
            self.options.chunking,
        )?;

        if chunks.is_empty() {
            warn!(path = %path.display(), "document produced no chunks");
            return Ok(IngestedDocument {
                path: path.to_path_buf(),
                doc_id: fingerprint.doc_id,
                chunks: 0,
            });
        }

        let embedded = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            embedded = self.embed_chunks(chunks) => embedded?,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            written = self.sink.upsert_chunks(&embedded) => written?,
        }

        info!(
            path = %path.display(),
            doc_id = %fingerprint.doc_id,
            pages = pages.len(),
            chunks = embedded.len(),
            "ingested document"
        );

        Ok(IngestedDocument {
            path: path.to_path_buf(),
            doc_id: fingerprint.doc_id,
            chunks: embedded.len(),
        })
    }

    /// Embeds with at most `embed_concurrency` calls in flight; results come back in
    /// chunk-id order regardless of completion order.
    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, SearchError> {
        let embedder = &self.embedder;
        let mut embedded: Vec<Chunk> = stream::iter(chunks)
            .map(|mut chunk| async move {
                chunk.content_vector = embedder.embed(&chunk.content).await?;
                Ok::<_, SearchError>(chunk)
            })
            .buffer_unordered(self.options.embed_concurrency.max(1))
            .try_collect()
            .await?;

        embedded.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));
        Ok(embedded)
    }

    /// Best-effort folder run: files that fail are reported, not fatal. Cancellation is.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_files(folder, &self.options.file_types);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        for path in files {
            match self.ingest_file(&path, cancel).await {
                Ok(document) => report.documents.push(document),
                Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping file");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            documents = report.documents.len(),
            skipped = report.skipped_files.len(),
            chunks = report.total_chunks(),
            "ingestion finished"
        );
        Ok(report)
    }
}
