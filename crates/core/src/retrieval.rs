use crate::chunking::page_from_chunk_id;
use crate::models::{RetrievalHit, SearchPlan};
use crate::planner::build_filter;
use crate::store::{BackendDocument, BackendQuery, VectorQuery};
use crate::traits::{EmbeddingService, HybridSearchBackend};
use crate::SearchError;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

pub const CONTENT_FIELD: &str = "content";
pub const VECTOR_FIELD: &str = "content_vector";

/// Over-fetch so that discarded and duplicate candidates still leave `top_k` hits.
pub fn candidate_count(top_k: usize) -> usize {
    top_k.saturating_mul(2).clamp(10, 50)
}

fn year_pattern() -> Option<&'static Regex> {
    static YEAR: OnceLock<Option<Regex>> = OnceLock::new();
    YEAR.get_or_init(|| Regex::new(r"(?:^|\D)(20\d{2})(?:\D|$)").ok()).as_ref()
}

/// First standalone `20xx` token in a file name.
pub fn extract_year(file_name: &str) -> Option<u16> {
    year_pattern()?
        .captures(file_name)
        .and_then(|captures| captures.get(1))
        .and_then(|year| year.as_str().parse().ok())
}

pub struct RetrievalExecutor<B, E> {
    backend: B,
    embedder: E,
}

impl<B, E> RetrievalExecutor<B, E>
where
    B: HybridSearchBackend,
    E: EmbeddingService,
{
    pub fn new(backend: B, embedder: E) -> Self {
        Self { backend, embedder }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn retrieve(&self, plan: &SearchPlan) -> Result<Vec<RetrievalHit>, SearchError> {
        let vector = match (&plan.vector_source_text, plan.use_vector) {
            (Some(text), true) => {
                let embedding = self.embedder.embed(text).await?;
                if embedding.len() != self.embedder.dimensions() {
                    return Err(SearchError::InvalidQuery(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        self.embedder.dimensions()
                    )));
                }
                Some(embedding)
            }
            _ => None,
        };

        let query = build_query(plan, vector);
        let documents = self.backend.search(&query).await?;
        let candidates = documents.len();
        let hits: Vec<RetrievalHit> = documents.into_iter().filter_map(parse_hit).collect();

        if hits.len() < candidates {
            debug!(
                discarded = candidates - hits.len(),
                "dropped hits missing required fields"
            );
        }

        Ok(rank_hits(hits, plan.top_k))
    }
}

pub fn build_query(plan: &SearchPlan, vector: Option<Vec<f32>>) -> BackendQuery {
    let candidates = candidate_count(plan.top_k);
    let keyword = plan.keyword.clone().filter(|_| plan.use_keyword);

    BackendQuery {
        search_fields: if keyword.is_some() {
            vec![CONTENT_FIELD.to_string()]
        } else {
            Vec::new()
        },
        keyword,
        vector: vector.map(|vector| VectorQuery {
            vector,
            k: candidates,
            field: VECTOR_FIELD.to_string(),
        }),
        filter: build_filter(plan),
        top: candidates,
        select: plan.select_fields.clone(),
    }
}

/// Hits without a chunk id, content or file name are unusable and dropped.
fn parse_hit(document: BackendDocument) -> Option<RetrievalHit> {
    let chunk_id = document.str_field("chunk_id")?.to_string();
    let content = document.str_field("content")?.to_string();
    let source_file_name = document.str_field("source_file_name")?.to_string();

    Some(RetrievalHit {
        page: document
            .u32_field("page")
            .or_else(|| page_from_chunk_id(&chunk_id)),
        year: extract_year(&source_file_name),
        score: document.score,
        chunk_id,
        content,
        source_file_name,
    })
}

/// Deduplicates by chunk id keeping the best score, orders by score and then by year with
/// undated files after dated ones, and truncates.
pub fn rank_hits(hits: Vec<RetrievalHit>, top_k: usize) -> Vec<RetrievalHit> {
    let mut by_id: HashMap<String, RetrievalHit> = HashMap::new();
    for hit in hits {
        match by_id.get(&hit.chunk_id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                by_id.insert(hit.chunk_id.clone(), hit);
            }
        }
    }

    let mut ranked: Vec<RetrievalHit> = by_id.into_values().collect();
    ranked.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| compare_recency(left.year, right.year))
            .then_with(|| left.chunk_id.cmp(&right.chunk_id))
    });
    ranked.truncate(top_k);
    ranked
}

fn compare_recency(left: Option<u16>, right: Option<u16>) -> Ordering {
    // Newer first; `None` sorts below every year.
    right.cmp(&left)
}
