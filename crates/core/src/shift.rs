//! Context-shift detection between conversation turns.
//!
//! Signals are computed from the thread's [`ConversationState`] and the current turn, scored
//! by a [`ShiftDecider`], and folded back into the state by [`ContextShiftDetector::commit`].
//! Everything here is local and deterministic.

use crate::config::{ShiftConfig, ShiftWeights};
use crate::models::SearchPlan;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::OnceLock;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "about", "as", "at", "be", "but", "by", "can", "do", "does", "for",
    "from", "how", "in", "is", "it", "me", "my", "of", "on", "or", "please", "so", "thanks",
    "thank", "that", "the", "then", "this", "to", "us", "was", "what", "when", "where", "which",
    "who", "why", "with", "you", "your", "이게", "그게", "그리고", "그러면", "어떻게", "에는",
    "에서", "으로", "하는", "하다", "처럼", "등", "또", "및",
];

fn entity_pattern() -> Option<&'static Regex> {
    static ENTITY: OnceLock<Option<Regex>> = OnceLock::new();
    ENTITY
        .get_or_init(|| Regex::new(r"[A-Za-z가-힣0-9_]{2,}").ok())
        .as_ref()
}

/// Lowercased, stop-word filtered terms in first-seen order, capped at `max`.
pub fn extract_entities(text: &str, max: usize) -> Vec<String> {
    let Some(pattern) = entity_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    pattern
        .find_iter(text)
        .map(|term| term.as_str().trim().to_lowercase())
        .filter(|term| !STOP_WORDS.contains(&term.as_str()))
        .filter(|term| seen.insert(term.clone()))
        .take(max)
        .collect()
}

/// Jaccard index with both-empty defined as 1.0 and one-empty as 0.0.
pub fn jaccard<T: Eq + Hash>(left: &HashSet<T>, right: &HashSet<T>) -> f64 {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let shared = left.intersection(right).count();
            let union = left.len() + right.len() - shared;
            shared as f64 / union as f64
        }
    }
}

/// Cosine similarity; 0.0 for mismatched dimensions or a zero vector.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let (mut dot, mut left_norm, mut right_norm) = (0f64, 0f64, 0f64);
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Fraction of the compared filter fields (doc id, path, file types, page from, page to)
/// that differ between two plans.
pub fn filter_changed_ratio(previous: Option<&SearchPlan>, current: Option<&SearchPlan>) -> f64 {
    const COMPARED_FIELDS: f64 = 5.0;

    let (previous, current) = match (previous, current) {
        (None, None) => return 0.0,
        (Some(previous), Some(current)) => (previous, current),
        _ => return 1.0,
    };

    let file_types = |plan: &SearchPlan| plan.file_types.iter().copied().collect::<HashSet<_>>();
    let changed = [
        previous.doc_id != current.doc_id,
        previous.source_path_equals != current.source_path_equals,
        file_types(previous) != file_types(current),
        previous.page_from != current.page_from,
        previous.page_to != current.page_to,
    ]
    .into_iter()
    .filter(|changed| *changed)
    .count();

    changed as f64 / COMPARED_FIELDS
}

/// Decides whether a question explicitly announces a new topic.
pub trait TopicChangeDetector: Send + Sync {
    fn is_new_topic(&self, question: &str) -> bool;
}

/// Case-insensitive substring match against a fixed phrase list.
#[derive(Debug, Clone)]
pub struct PhraseTopicDetector {
    phrases: Vec<String>,
}

impl PhraseTopicDetector {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|phrase| phrase.as_ref().trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
        }
    }
}

impl TopicChangeDetector for PhraseTopicDetector {
    fn is_new_topic(&self, question: &str) -> bool {
        let lowered = question.to_lowercase();
        self.phrases.iter().any(|phrase| lowered.contains(phrase))
    }
}

/// What one turn contributes to shift detection.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSignals {
    pub embedding: Vec<f32>,
    pub entities: Vec<String>,
    pub plan: Option<SearchPlan>,
    pub result_ids: Vec<String>,
    pub intent_is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftSignals {
    pub embedding_similarity: f64,
    pub entity_jaccard: f64,
    pub filter_changed_ratio: f64,
    pub result_overlap: f64,
    pub intent_is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftVerdict {
    pub score: f64,
    pub shifted: bool,
}

/// Signals and verdict for one evaluated turn, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftAssessment {
    pub signals: ShiftSignals,
    pub verdict: ShiftVerdict,
}

/// Maps signals to a shift decision. Callers only depend on this trait.
pub trait ShiftDecider: Send + Sync {
    fn decide(&self, signals: &ShiftSignals) -> ShiftVerdict;
}

/// Linear score over the five signals compared against a threshold.
#[derive(Debug, Clone, Copy)]
pub struct WeightedShiftDecider {
    pub weights: ShiftWeights,
    pub threshold: f64,
}

impl Default for WeightedShiftDecider {
    fn default() -> Self {
        Self {
            weights: ShiftWeights::default(),
            threshold: 0.5,
        }
    }
}

impl WeightedShiftDecider {
    const TOLERANCE: f64 = 1e-9;

    pub fn score(&self, signals: &ShiftSignals) -> f64 {
        let w = &self.weights;
        let intent = if signals.intent_is_new { 1.0 } else { 0.0 };
        w.embedding * (1.0 - signals.embedding_similarity)
            + w.entity * (1.0 - signals.entity_jaccard)
            + w.intent * intent
            + w.filter * signals.filter_changed_ratio
            + w.result * (1.0 - signals.result_overlap)
    }
}

impl ShiftDecider for WeightedShiftDecider {
    fn decide(&self, signals: &ShiftSignals) -> ShiftVerdict {
        let score = self.score(signals);
        ShiftVerdict {
            score,
            shifted: score + Self::TOLERANCE >= self.threshold,
        }
    }
}

/// Rolling per-thread memory used as the "previous turn" side of every comparison.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub topic_center: Option<Vec<f32>>,
    pub last_entities: Vec<String>,
    pub last_plan: Option<SearchPlan>,
    pub last_result_ids: Vec<String>,
}

impl ConversationState {
    pub fn has_history(&self) -> bool {
        self.topic_center.is_some() || self.last_plan.is_some()
    }
}

pub fn compute_signals(state: &ConversationState, current: &TurnSignals) -> ShiftSignals {
    let embedding_similarity = match &state.topic_center {
        Some(center) => cosine_similarity(&current.embedding, center),
        None => 1.0,
    };

    let entity_set = |entities: &[String]| {
        entities
            .iter()
            .map(|entity| entity.trim().to_lowercase())
            .filter(|entity| !entity.is_empty())
            .collect::<HashSet<_>>()
    };
    let id_set = |ids: &[String]| ids.iter().cloned().collect::<HashSet<_>>();

    ShiftSignals {
        embedding_similarity,
        entity_jaccard: jaccard(
            &entity_set(&state.last_entities),
            &entity_set(&current.entities),
        ),
        filter_changed_ratio: filter_changed_ratio(
            state.last_plan.as_ref(),
            current.plan.as_ref(),
        ),
        result_overlap: jaccard(
            &id_set(&state.last_result_ids),
            &id_set(&current.result_ids),
        ),
        intent_is_new: current.intent_is_new,
    }
}

pub struct ContextShiftDetector {
    decider: Box<dyn ShiftDecider>,
    topic_detector: Box<dyn TopicChangeDetector>,
    center_alpha: f32,
    max_entities: usize,
}

impl ContextShiftDetector {
    pub fn new(
        decider: Box<dyn ShiftDecider>,
        topic_detector: Box<dyn TopicChangeDetector>,
        center_alpha: f32,
        max_entities: usize,
    ) -> Self {
        Self {
            decider,
            topic_detector,
            center_alpha: center_alpha.clamp(0.0, 1.0),
            max_entities,
        }
    }

    pub fn from_config(config: &ShiftConfig) -> Self {
        Self::new(
            Box::new(WeightedShiftDecider {
                weights: config.weights,
                threshold: config.threshold,
            }),
            Box::new(PhraseTopicDetector::new(&config.topic_change_phrases)),
            config.center_alpha,
            config.max_entities,
        )
    }

    /// Extracts the question-derived signals for the current turn.
    pub fn observe(
        &self,
        question: &str,
        embedding: Vec<f32>,
        plan: Option<SearchPlan>,
        result_ids: Vec<String>,
    ) -> TurnSignals {
        TurnSignals {
            embedding,
            entities: extract_entities(question, self.max_entities),
            plan,
            result_ids,
            intent_is_new: self.topic_detector.is_new_topic(question),
        }
    }

    pub fn evaluate(
        &self,
        state: &ConversationState,
        current: &TurnSignals,
    ) -> (ShiftSignals, ShiftVerdict) {
        let signals = compute_signals(state, current);
        let verdict = self.decider.decide(&signals);
        (signals, verdict)
    }

    /// Folds the turn into the state. A shift replaces the topic center; otherwise the center
    /// moves toward the current embedding by `center_alpha`. The remaining fields always
    /// become the current turn's values.
    pub fn commit(&self, state: &mut ConversationState, current: TurnSignals, shifted: bool) {
        let alpha = self.center_alpha;
        state.topic_center = match state.topic_center.take() {
            Some(center) if !shifted && center.len() == current.embedding.len() => Some(
                center
                    .iter()
                    .zip(&current.embedding)
                    .map(|(old, new)| alpha * new + (1.0 - alpha) * old)
                    .collect(),
            ),
            _ => Some(current.embedding),
        };
        state.last_entities = current.entities;
        state.last_plan = current.plan;
        state.last_result_ids = current.result_ids;
    }
}

impl Default for ContextShiftDetector {
    fn default() -> Self {
        Self::from_config(&ShiftConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileType, PlanDraft};
    use crate::planner::normalize;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn turn(embedding: Vec<f32>, entities: &[&str], ids: &[&str]) -> TurnSignals {
        TurnSignals {
            embedding,
            entities: entities.iter().map(|e| e.to_string()).collect(),
            plan: Some(normalize(&PlanDraft::default(), &[])),
            result_ids: ids.iter().map(|id| id.to_string()).collect(),
            intent_is_new: false,
        }
    }

    #[test]
    fn jaccard_boundary_values() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
        assert_eq!(jaccard(&set(&[]), &set(&["a"])), 0.0);
        assert_eq!(jaccard(&set(&["a"]), &set(&[])), 0.0);
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["b", "a"])), 1.0);
        assert!((jaccard(&set(&["a", "b"]), &set(&["b", "c"])) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn entities_are_normalized_filtered_and_capped() {
        let entities = extract_entities("What about the Vacation policy, vacation DAYS and 연차 및 휴가?", 20);
        assert_eq!(entities, vec!["vacation", "policy", "days", "연차", "휴가"]);

        let many = (0..30).map(|i| format!("term{i}")).collect::<Vec<_>>().join(" ");
        assert_eq!(extract_entities(&many, 20).len(), 20);
    }

    #[test]
    fn topic_phrases_match_case_insensitively() {
        let detector = PhraseTopicDetector::new(crate::config::DEFAULT_TOPIC_CHANGE_PHRASES);
        assert!(detector.is_new_topic("Completely DIFFERENT TOPIC: security badge access"));
        assert!(detector.is_new_topic("그건 됐고 출장비는?"));
        assert!(!detector.is_new_topic("thanks, and what about sick leave"));
    }

    #[test]
    fn filter_ratio_counts_changed_fields() {
        let base = normalize(&PlanDraft::default(), &[]);
        let narrowed = normalize(
            &PlanDraft {
                doc_id: Some("d1".into()),
                file_types: Some(vec!["pdf".into()]),
                ..PlanDraft::default()
            },
            &[],
        );
        assert_eq!(filter_changed_ratio(None, None), 0.0);
        assert_eq!(filter_changed_ratio(Some(&base), None), 1.0);
        assert_eq!(filter_changed_ratio(Some(&base), Some(&base)), 0.0);
        assert!((filter_changed_ratio(Some(&base), Some(&narrowed)) - 0.4).abs() < 1e-12);

        let mut reordered = narrowed.clone();
        reordered.file_types = vec![FileType::Docx, FileType::Pdf];
        let mut both = narrowed.clone();
        both.file_types = vec![FileType::Pdf, FileType::Docx];
        assert_eq!(filter_changed_ratio(Some(&reordered), Some(&both)), 0.0);
    }

    #[test]
    fn first_turn_is_not_a_shift() {
        let detector = ContextShiftDetector::default();
        let state = ConversationState::default();
        let current = turn(vec![1.0, 0.0], &["vacation", "policy"], &["d_0001_000"]);

        let (signals, verdict) = detector.evaluate(&state, &current);

        assert_eq!(signals.embedding_similarity, 1.0);
        assert!(verdict.score < 0.5);
        assert!(!verdict.shifted);
    }

    #[test]
    fn weighted_score_uses_fixed_weights() {
        let decider = WeightedShiftDecider::default();
        let signals = ShiftSignals {
            embedding_similarity: 1.0,
            entity_jaccard: 0.0,
            filter_changed_ratio: 0.0,
            result_overlap: 0.0,
            intent_is_new: true,
        };
        let verdict = decider.decide(&signals);
        assert!((verdict.score - 0.5).abs() < 1e-9);
        assert!(verdict.shifted);

        let calm = ShiftSignals {
            intent_is_new: false,
            ..signals
        };
        assert!(!decider.decide(&calm).shifted);
    }

    #[test]
    fn decider_is_swappable() {
        struct AlwaysShift;
        impl ShiftDecider for AlwaysShift {
            fn decide(&self, _signals: &ShiftSignals) -> ShiftVerdict {
                ShiftVerdict {
                    score: 1.0,
                    shifted: true,
                }
            }
        }

        let detector = ContextShiftDetector::new(
            Box::new(AlwaysShift),
            Box::new(PhraseTopicDetector::new(Vec::<String>::new())),
            0.3,
            20,
        );
        let current = turn(vec![1.0], &[], &[]);
        let (_, verdict) = detector.evaluate(&ConversationState::default(), &current);
        assert!(verdict.shifted);
    }

    #[test]
    fn commit_blends_when_continuing_and_replaces_on_shift() {
        let detector = ContextShiftDetector::default();
        let mut state = ConversationState::default();

        detector.commit(&mut state, turn(vec![1.0, 0.0], &["a"], &["x"]), false);
        assert_eq!(state.topic_center, Some(vec![1.0, 0.0]));

        detector.commit(&mut state, turn(vec![0.0, 1.0], &["b"], &["y"]), false);
        let center = state.topic_center.clone().unwrap_or_default();
        assert!((center[0] - 0.7).abs() < 1e-6);
        assert!((center[1] - 0.3).abs() < 1e-6);
        assert_eq!(state.last_entities, vec!["b".to_string()]);
        assert_eq!(state.last_result_ids, vec!["y".to_string()]);

        detector.commit(&mut state, turn(vec![0.0, 1.0], &["c"], &["z"]), true);
        assert_eq!(state.topic_center, Some(vec![0.0, 1.0]));
        assert_eq!(state.last_entities, vec!["c".to_string()]);
    }
}
