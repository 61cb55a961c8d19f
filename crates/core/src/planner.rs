//! Turns a model-drafted plan into a bounded [`SearchPlan`] and renders its filter expression.
//!
//! Normalization never fails: out-of-range values are clamped and unknown values dropped.

use crate::models::{FileType, PlanDraft, SearchPlan};

pub const DEFAULT_TOP_K: usize = 10;
pub const MAX_TOP_K: usize = 50;
pub const MAX_EXCLUDED_CHUNK_IDS: usize = 100;

/// Fields present in the search index, in schema order.
pub const INDEX_FIELDS: [&str; 7] = [
    "chunk_id",
    "doc_id",
    "source_file_type",
    "source_file_path",
    "source_file_name",
    "page",
    "content",
];

/// Fields every hit must carry to be usable.
pub const REQUIRED_FIELDS: [&str; 3] = ["chunk_id", "content", "source_file_name"];

pub const DEFAULT_SELECT_FIELDS: [&str; 5] =
    ["chunk_id", "doc_id", "page", "content", "source_file_name"];

pub fn normalize(draft: &PlanDraft, prior_exclusions: &[String]) -> SearchPlan {
    let keyword = non_blank(draft.keyword.as_deref());
    let vector_source_text =
        non_blank(draft.vector_source_text.as_deref()).or_else(|| keyword.clone());

    let mut use_vector = draft.use_vector.unwrap_or(false);
    let mut use_keyword = draft.use_keyword.unwrap_or(true);
    if use_vector && vector_source_text.is_none() {
        use_vector = false;
    }
    if !use_vector && !use_keyword {
        // Filter-only browse: keyword mode without a keyword runs as match-all.
        use_keyword = true;
    }

    let (page_from, page_to) = match (
        positive_page(draft.page_from),
        positive_page(draft.page_to),
    ) {
        (Some(from), Some(to)) if from > to => (Some(to), Some(from)),
        pages => pages,
    };

    SearchPlan {
        use_vector,
        use_keyword,
        top_k: clamp_top_k(draft.top_k),
        keyword,
        vector_source_text,
        doc_id: non_blank(draft.doc_id.as_deref()),
        source_path_equals: non_blank(draft.source_path_equals.as_deref()),
        file_types: allowed_file_types(draft.file_types.as_deref().unwrap_or_default()),
        page_from,
        page_to,
        select_fields: select_fields(draft.select_fields.as_deref().unwrap_or_default()),
        excluded_chunk_ids: most_recent(prior_exclusions, MAX_EXCLUDED_CHUNK_IDS),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn clamp_top_k(raw: Option<i64>) -> usize {
    match raw {
        Some(value) if value > 0 => usize::try_from(value).unwrap_or(MAX_TOP_K).min(MAX_TOP_K),
        _ => DEFAULT_TOP_K,
    }
}

fn positive_page(raw: Option<i64>) -> Option<u32> {
    raw.filter(|page| *page > 0)
        .map(|page| u32::try_from(page).unwrap_or(u32::MAX))
}

fn allowed_file_types(raw: &[String]) -> Vec<FileType> {
    let mut kinds = Vec::new();
    for kind in raw.iter().filter_map(|value| FileType::parse(value)) {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}

fn select_fields(raw: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for field in raw {
        let field = field.trim().to_ascii_lowercase();
        if INDEX_FIELDS.contains(&field.as_str()) && !fields.contains(&field) {
            fields.push(field);
        }
    }

    if fields.is_empty() {
        return DEFAULT_SELECT_FIELDS.iter().map(|f| (*f).to_string()).collect();
    }

    for required in REQUIRED_FIELDS {
        if !fields.iter().any(|field| field == required) {
            fields.push(required.to_string());
        }
    }
    fields
}

fn most_recent(ids: &[String], cap: usize) -> Vec<String> {
    ids[ids.len().saturating_sub(cap)..].to_vec()
}

/// Escapes a value for use inside a single-quoted filter literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote(value: &str) -> String {
    format!("'{}'", escape_literal(value))
}

/// Renders the plan's predicates as one conjunctive filter expression, in the order
/// doc-id, path, file types, page range, chunk-id exclusion. `None` means no filter.
pub fn build_filter(plan: &SearchPlan) -> Option<String> {
    let mut predicates = Vec::new();

    if let Some(doc_id) = &plan.doc_id {
        predicates.push(format!("doc_id eq {}", quote(doc_id)));
    }

    if let Some(path) = &plan.source_path_equals {
        predicates.push(format!("source_file_path eq {}", quote(path)));
    }

    if !plan.file_types.is_empty() {
        let joined = plan
            .file_types
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(",");
        predicates.push(format!("search.in(source_file_type, {}, ',')", quote(&joined)));
    }

    match (plan.page_from, plan.page_to) {
        (Some(from), Some(to)) => predicates.push(format!("page ge {from} and page le {to}")),
        (Some(from), None) => predicates.push(format!("page ge {from}")),
        (None, Some(to)) => predicates.push(format!("page le {to}")),
        (None, None) => {}
    }

    // Ids containing the list delimiter cannot be expressed in search.in and are skipped.
    let excluded = plan
        .excluded_chunk_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && !id.contains(','))
        .collect::<Vec<_>>();
    if !excluded.is_empty() {
        predicates.push(format!(
            "not search.in(chunk_id, {}, ',')",
            quote(&excluded.join(","))
        ));
    }

    if predicates.is_empty() {
        None
    } else {
        Some(predicates.join(" and "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> PlanDraft {
        PlanDraft::default()
    }

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("doc_0001_{i:03}")).collect()
    }

    #[test]
    fn top_k_is_clamped_and_defaulted() {
        let cases = [(None, 10), (Some(0), 10), (Some(-4), 10), (Some(7), 7), (Some(500), 50)];
        for (raw, expected) in cases {
            let plan = normalize(&PlanDraft { top_k: raw, ..draft() }, &[]);
            assert_eq!(plan.top_k, expected, "top_k {raw:?}");
        }
    }

    #[test]
    fn file_types_are_allow_listed_and_deduplicated() {
        let plan = normalize(
            &PlanDraft {
                file_types: Some(vec![
                    "PDF".into(),
                    "exe".into(),
                    " docx ".into(),
                    "pdf".into(),
                    "xlsx".into(),
                ]),
                ..draft()
            },
            &[],
        );
        assert_eq!(plan.file_types, vec![FileType::Pdf, FileType::Docx]);

        let none_allowed = normalize(
            &PlanDraft {
                file_types: Some(vec!["exe".into()]),
                ..draft()
            },
            &[],
        );
        assert!(none_allowed.file_types.is_empty());
        assert_eq!(build_filter(&none_allowed), None);
    }

    #[test]
    fn vector_text_falls_back_to_keyword_or_disables_vector() {
        let with_keyword = normalize(
            &PlanDraft {
                use_vector: Some(true),
                keyword: Some(" vacation policy ".into()),
                vector_source_text: Some("   ".into()),
                ..draft()
            },
            &[],
        );
        assert!(with_keyword.use_vector);
        assert_eq!(with_keyword.vector_source_text.as_deref(), Some("vacation policy"));

        let nothing_to_embed = normalize(
            &PlanDraft {
                use_vector: Some(true),
                use_keyword: Some(false),
                ..draft()
            },
            &[],
        );
        assert!(!nothing_to_embed.use_vector);
        assert!(nothing_to_embed.use_keyword);
        assert_eq!(nothing_to_embed.keyword, None);
    }

    #[test]
    fn pages_are_positive_and_ordered() {
        let swapped = normalize(
            &PlanDraft {
                page_from: Some(12),
                page_to: Some(5),
                ..draft()
            },
            &[],
        );
        assert_eq!((swapped.page_from, swapped.page_to), (Some(5), Some(12)));

        let dropped = normalize(
            &PlanDraft {
                page_from: Some(0),
                page_to: Some(-2),
                ..draft()
            },
            &[],
        );
        assert_eq!((dropped.page_from, dropped.page_to), (None, None));
    }

    #[test]
    fn select_fields_default_and_keep_required() {
        let defaulted = normalize(&draft(), &[]);
        assert_eq!(defaulted.select_fields, DEFAULT_SELECT_FIELDS.to_vec());

        let partial = normalize(
            &PlanDraft {
                select_fields: Some(vec!["page".into(), "content_vector".into()]),
                ..draft()
            },
            &[],
        );
        assert_eq!(
            partial.select_fields,
            vec!["page", "chunk_id", "content", "source_file_name"]
        );
    }

    #[test]
    fn exclusions_keep_the_most_recent_hundred() {
        let plan = normalize(&draft(), &ids(130));
        assert_eq!(plan.excluded_chunk_ids.len(), MAX_EXCLUDED_CHUNK_IDS);
        assert_eq!(plan.excluded_chunk_ids[0], "doc_0001_030");
        assert_eq!(plan.excluded_chunk_ids[99], "doc_0001_129");
    }

    #[test]
    fn normalize_is_idempotent() {
        let drafts = vec![
            draft(),
            PlanDraft {
                use_vector: Some(true),
                use_keyword: Some(false),
                top_k: Some(90),
                keyword: Some("  badge access ".into()),
                file_types: Some(vec!["PPTX".into(), "txt".into()]),
                page_from: Some(9),
                page_to: Some(3),
                select_fields: Some(vec!["doc_id".into(), "DOC_ID".into()]),
                ..draft()
            },
            PlanDraft {
                use_vector: Some(true),
                use_keyword: Some(false),
                vector_source_text: Some("sick leave".into()),
                doc_id: Some("o'brien".into()),
                source_path_equals: Some(" ".into()),
                page_to: Some(4),
                ..draft()
            },
            PlanDraft {
                use_vector: Some(false),
                use_keyword: Some(false),
                top_k: Some(-1),
                ..draft()
            },
        ];

        for raw in drafts {
            let once = normalize(&raw, &ids(150));
            let twice = normalize(&PlanDraft::from(&once), &once.excluded_chunk_ids);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn filter_is_ordered_conjunction_with_escaped_literals() {
        let plan = normalize(
            &PlanDraft {
                doc_id: Some("a'b".into()),
                source_path_equals: Some("/hr/o'neil.pdf".into()),
                file_types: Some(vec!["pdf".into(), "docx".into()]),
                page_from: Some(3),
                page_to: Some(5),
                ..draft()
            },
            &["x_0001_000".to_string(), "bad,id".to_string(), "y'_0002_001".to_string()],
        );

        assert_eq!(
            build_filter(&plan).as_deref(),
            Some(
                "doc_id eq 'a''b' and source_file_path eq '/hr/o''neil.pdf' \
                 and search.in(source_file_type, 'pdf,docx', ',') \
                 and page ge 3 and page le 5 \
                 and not search.in(chunk_id, 'x_0001_000,y''_0002_001', ',')"
            )
        );
    }

    #[test]
    fn open_ended_page_ranges_render_single_bound() {
        let plan = normalize(
            &PlanDraft {
                page_to: Some(8),
                ..draft()
            },
            &[],
        );
        assert_eq!(build_filter(&plan).as_deref(), Some("page le 8"));
        assert_eq!(build_filter(&normalize(&draft(), &[])), None);
    }
}
