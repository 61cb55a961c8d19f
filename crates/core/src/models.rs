use crate::shift::ShiftAssessment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnError, OneOrMany};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Source document formats accepted by the index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Pptx,
    Docx,
}

impl FileType {
    pub const ALL: [FileType; 3] = [FileType::Pdf, FileType::Pptx, FileType::Docx];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Pptx => "pptx",
            FileType::Docx => "docx",
        }
    }

    /// Case-insensitive lookup against the allow-list; surrounding whitespace and a leading
    /// dot are ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim().trim_start_matches('.');
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub doc_id: String,
    pub file_name: String,
    pub source_path: String,
    pub file_type: FileType,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

/// One indexed unit of document text. Field names match the search index schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub source_file_type: FileType,
    pub source_file_path: String,
    pub source_file_name: String,
    pub page: u32,
    pub content: String,
    pub content_vector: Vec<f32>,
}

/// A search plan as proposed by the language model, before validation.
///
/// Every field is optional and parsed leniently: a value of the wrong JSON type is treated
/// as absent rather than failing the whole draft.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanDraft {
    #[serde(alias = "use_vector", alias = "UseVector")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub use_vector: Option<bool>,

    #[serde(alias = "use_keyword", alias = "UseKeyword")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub use_keyword: Option<bool>,

    #[serde(alias = "top_k", alias = "TopK")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub top_k: Option<i64>,

    #[serde(alias = "Keyword")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub keyword: Option<String>,

    #[serde(
        alias = "vector_source_text",
        alias = "vectorFromText",
        alias = "VectorFromText"
    )]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub vector_source_text: Option<String>,

    #[serde(alias = "doc_id", alias = "DocId")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub doc_id: Option<String>,

    #[serde(alias = "source_path_equals", alias = "SourcePathEquals")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub source_path_equals: Option<String>,

    #[serde(alias = "file_types", alias = "FileTypes")]
    #[serde_as(deserialize_as = "DefaultOnError<Option<OneOrMany<_>>>")]
    pub file_types: Option<Vec<String>>,

    #[serde(alias = "page_from", alias = "PageFrom")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub page_from: Option<i64>,

    #[serde(alias = "page_to", alias = "PageTo")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub page_to: Option<i64>,

    #[serde(alias = "select_fields", alias = "select", alias = "Select")]
    #[serde_as(deserialize_as = "DefaultOnError<Option<OneOrMany<_>>>")]
    pub select_fields: Option<Vec<String>>,

    #[serde(alias = "excluded_chunk_ids", alias = "ExcludedChunkIds")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub excluded_chunk_ids: Option<Vec<String>>,
}

/// Normalized, bounded retrieval intent. Only [`crate::planner::normalize`] builds these
/// from untrusted input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchPlan {
    pub use_vector: bool,
    pub use_keyword: bool,
    pub top_k: usize,
    pub keyword: Option<String>,
    pub vector_source_text: Option<String>,
    pub doc_id: Option<String>,
    pub source_path_equals: Option<String>,
    pub file_types: Vec<FileType>,
    pub page_from: Option<u32>,
    pub page_to: Option<u32>,
    pub select_fields: Vec<String>,
    pub excluded_chunk_ids: Vec<String>,
}

impl From<&SearchPlan> for PlanDraft {
    fn from(plan: &SearchPlan) -> Self {
        Self {
            use_vector: Some(plan.use_vector),
            use_keyword: Some(plan.use_keyword),
            top_k: i64::try_from(plan.top_k).ok(),
            keyword: plan.keyword.clone(),
            vector_source_text: plan.vector_source_text.clone(),
            doc_id: plan.doc_id.clone(),
            source_path_equals: plan.source_path_equals.clone(),
            file_types: Some(
                plan.file_types
                    .iter()
                    .map(|kind| kind.as_str().to_string())
                    .collect(),
            ),
            page_from: plan.page_from.map(i64::from),
            page_to: plan.page_to.map(i64::from),
            select_fields: Some(plan.select_fields.clone()),
            excluded_chunk_ids: Some(plan.excluded_chunk_ids.clone()),
        }
    }
}

/// One ranked passage returned by the retrieval executor.
///
/// `score` is whatever the backend reports and is only comparable within one result list.
/// `year` is `None` for undated file names and never defaulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub content: String,
    pub source_file_name: String,
    pub page: Option<u32>,
    pub year: Option<u16>,
    pub score: f64,
}

/// A `(file, page)` reference proposed by the model in a grounded answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Citation {
    #[serde(alias = "source_file_name", alias = "sourceFileName", alias = "File")]
    pub file: String,
    #[serde(alias = "Page")]
    pub page: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// What the caller expects back from the completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Text,
    /// A single JSON object; the name is used in error reports.
    Json { name: &'static str },
}

/// One completed question/answer exchange in a thread's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            answer: answer.into(),
            created_at: Utc::now(),
        }
    }
}

/// Answer whose citations all point at hits that were shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub hits: Vec<RetrievalHit>,
    pub plan: SearchPlan,
    /// `None` on the first turn of a thread.
    pub shift: Option<ShiftAssessment>,
    /// Model-proposed citations that matched no retrieved hit.
    pub dropped_citations: usize,
}

/// Result of one conversation turn. Backend failures are reported separately as
/// [`crate::TurnError`], so "no evidence" and "system degraded" never look alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered(GroundedAnswer),
    NoEvidence {
        plan: SearchPlan,
        shift: Option<ShiftAssessment>,
    },
    /// Passages were retrieved but the model returned a blank answer.
    Unanswered {
        plan: SearchPlan,
        hits: Vec<RetrievalHit>,
        shift: Option<ShiftAssessment>,
    },
}

impl TurnOutcome {
    pub fn shift(&self) -> Option<&ShiftAssessment> {
        match self {
            TurnOutcome::Answered(answer) => answer.shift.as_ref(),
            TurnOutcome::NoEvidence { shift, .. } | TurnOutcome::Unanswered { shift, .. } => {
                shift.as_ref()
            }
        }
    }

    pub fn shifted(&self) -> bool {
        self.shift().is_some_and(|shift| shift.verdict.shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_parse_is_case_insensitive() {
        assert_eq!(FileType::parse(" PDF "), Some(FileType::Pdf));
        assert_eq!(FileType::parse(".docx"), Some(FileType::Docx));
        assert_eq!(FileType::parse("xlsx"), None);
        assert_eq!(
            FileType::from_path(Path::new("/share/deck.PPTX")),
            Some(FileType::Pptx)
        );
    }

    #[test]
    fn plan_draft_accepts_pascal_case_and_ignores_bad_types() {
        let raw = r#"{"UseVector": true, "TopK": "lots", "Keyword": "vacation",
                      "FileTypes": "pdf", "pageFrom": 3, "select": ["content"]}"#;
        let draft: PlanDraft = serde_json::from_str(raw).expect("draft should parse");

        assert_eq!(draft.use_vector, Some(true));
        assert_eq!(draft.top_k, None);
        assert_eq!(draft.keyword.as_deref(), Some("vacation"));
        assert_eq!(draft.file_types, Some(vec!["pdf".to_string()]));
        assert_eq!(draft.page_from, Some(3));
        assert_eq!(draft.select_fields, Some(vec!["content".to_string()]));
    }

    #[test]
    fn citation_accepts_source_file_name_alias() {
        let citation: Citation =
            serde_json::from_str(r#"{"sourceFileName": "policy_2023.pdf", "page": 4}"#)
                .expect("citation should parse");
        assert_eq!(citation.file, "policy_2023.pdf");
        assert_eq!(citation.page, 4);
    }
}
