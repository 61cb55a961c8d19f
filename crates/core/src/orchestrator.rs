use crate::completion::complete_typed;
use crate::config::OrchestratorConfig;
use crate::models::{
    ChatMessage, Citation, GroundedAnswer, PlanDraft, RetrievalHit, TurnOutcome, TurnRecord,
};
use crate::planner::normalize;
use crate::retrieval::RetrievalExecutor;
use crate::shift::{ContextShiftDetector, ConversationState, ShiftAssessment, TurnSignals};
use crate::traits::{CompletionService, EmbeddingService, HistoryStore, HybridSearchBackend};
use crate::{SearchError, TurnError};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PLAN_SYSTEM_PROMPT: &str = r#"You translate a user question into a search plan for a document index.
Index fields: doc_id, source_file_type (pdf|pptx|docx), source_file_path, source_file_name, page, content, content_vector.
Rules:
- Page phrases such as "pages 3-5" or "page 7" become pageFrom/pageTo.
- A request for both exact terms and meaning sets useKeyword and useVector to true.
- topK defaults to 10 and never exceeds 50.
- vectorSourceText defaults to the keyword.
- Only restrict fileTypes, docId or sourcePathEquals when the user asks for it.
Reply with a single-line JSON object using the keys useVector, useKeyword, topK, keyword, vectorSourceText, docId, sourcePathEquals, fileTypes, pageFrom, pageTo, select."#;

pub const ANSWER_SYSTEM_PROMPT: &str = r#"You answer questions using only the passages inside <REF></REF>.
Rules:
- Do not use knowledge that is not in the references.
- When file names carry a year, prefer the most recent one.
- Name the source file and page of every fact you use.
- If the references are not enough, say that you don't know.
Reply with a JSON object: {"answer": string, "citations": [{"file": string, "page": int}]}."#;

/// What the model returns for a grounded answer, before citation cross-validation.
#[derive(Debug, Clone, Deserialize)]
struct AnswerDraft {
    #[serde(alias = "Answer")]
    answer: String,
    #[serde(default, alias = "Citations")]
    citations: Vec<Citation>,
}

#[derive(Debug, Default)]
struct ThreadContext {
    state: ConversationState,
    /// Chunk ids shown in this topic, oldest first.
    surfaced_ids: Vec<String>,
    /// Answered turns since the last shift; caps the history window.
    turns_in_topic: usize,
}

/// A computed turn waiting to be committed.
struct PreparedTurn {
    outcome: TurnOutcome,
    signals: TurnSignals,
    shifted: bool,
}

/// Runs conversation turns: plan, retrieve, detect shift, answer, commit.
///
/// Turns on one thread are serialized by a per-thread lock; different threads run
/// independently. Backend failures retry the whole turn up to `max_attempts` times.
pub struct ConversationOrchestrator<B, E, C, H> {
    retrieval: RetrievalExecutor<B, E>,
    completion: C,
    history: H,
    detector: ContextShiftDetector,
    config: OrchestratorConfig,
    threads: Mutex<HashMap<String, Arc<AsyncMutex<ThreadContext>>>>,
}

impl<B, E, C, H> ConversationOrchestrator<B, E, C, H>
where
    B: HybridSearchBackend,
    E: EmbeddingService,
    C: CompletionService,
    H: HistoryStore,
{
    pub fn new(
        retrieval: RetrievalExecutor<B, E>,
        completion: C,
        history: H,
        detector: ContextShiftDetector,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            retrieval,
            completion,
            history,
            detector,
            config,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of a thread's shift state, if the thread has been seen.
    pub async fn conversation_state(&self, thread_id: &str) -> Option<ConversationState> {
        let thread = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned()?;
        let context = thread.lock().await;
        Some(context.state.clone())
    }

    /// Drops a thread's shift state and surfaced ids so idle threads do not accumulate.
    /// Turns already stored in the [`HistoryStore`] are untouched.
    pub fn forget_thread(&self, thread_id: &str) -> bool {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id)
            .is_some()
    }

    fn thread(&self, thread_id: &str) -> Arc<AsyncMutex<ThreadContext>> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn ask(
        &self,
        thread_id: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let thread = self.thread(thread_id);
        let mut context = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            context = thread.lock() => context,
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let prepared = loop {
            attempt += 1;
            match self.prepare_turn(thread_id, question, &context, cancel).await {
                Ok(prepared) => break prepared,
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    warn!(thread_id, attempt, max_attempts, %error, "turn failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(error) => return Err(TurnError::after_attempts(error, attempt)),
            }
        };

        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let PreparedTurn {
            outcome,
            signals,
            shifted,
        } = prepared;

        if let TurnOutcome::Answered(answer) = &outcome {
            self.history
                .append_turn(thread_id, TurnRecord::new(question, &answer.answer))
                .await
                .map_err(|error| TurnError::after_attempts(error, attempt))?;
        }

        self.commit(&mut context, signals, shifted, matches!(outcome, TurnOutcome::Answered(_)));
        Ok(outcome)
    }

    async fn prepare_turn(
        &self,
        thread_id: &str,
        question: &str,
        context: &ThreadContext,
        cancel: &CancellationToken,
    ) -> Result<PreparedTurn, SearchError> {
        let embedding = cancellable(cancel, self.retrieval.embedder().embed(question)).await?;

        let messages = [
            ChatMessage::system(PLAN_SYSTEM_PROMPT),
            ChatMessage::user(question),
        ];
        let draft: PlanDraft = cancellable(
            cancel,
            complete_typed(&self.completion, &messages, "PlanDraft"),
        )
        .await?;
        let excluded = recent(&context.surfaced_ids, self.config.max_excluded_chunk_ids);
        let plan = normalize(&draft, excluded);

        let hits = cancellable(cancel, self.retrieval.retrieve(&plan)).await?;
        let result_ids = hits.iter().map(|hit| hit.chunk_id.clone()).collect();

        let signals = self
            .detector
            .observe(question, embedding, Some(plan.clone()), result_ids);
        let shift = context.state.has_history().then(|| {
            let (shift_signals, verdict) = self.detector.evaluate(&context.state, &signals);
            info!(
                thread_id,
                emb_sim = shift_signals.embedding_similarity,
                entity_jaccard = shift_signals.entity_jaccard,
                intent_new = shift_signals.intent_is_new,
                filter_changed = shift_signals.filter_changed_ratio,
                result_overlap = shift_signals.result_overlap,
                score = verdict.score,
                shifted = verdict.shifted,
                "context shift signals"
            );
            ShiftAssessment {
                signals: shift_signals,
                verdict,
            }
        });
        let shifted = shift.is_some_and(|shift| shift.verdict.shifted);

        if hits.is_empty() {
            info!(thread_id, "no usable hits, skipping answer generation");
            return Ok(PreparedTurn {
                outcome: TurnOutcome::NoEvidence { plan, shift },
                signals,
                shifted,
            });
        }

        let window = if shifted {
            0
        } else {
            self.config.history_turns.min(context.turns_in_topic)
        };
        let history = if window == 0 {
            Vec::new()
        } else {
            cancellable(cancel, self.history.recent_turns(thread_id, window)).await?
        };

        let messages = answer_messages(question, &history, &hits);
        let draft: AnswerDraft = cancellable(
            cancel,
            complete_typed(&self.completion, &messages, "GroundedAnswer"),
        )
        .await?;

        if draft.answer.trim().is_empty() {
            warn!(thread_id, "model returned a blank answer");
            return Ok(PreparedTurn {
                outcome: TurnOutcome::Unanswered { plan, hits, shift },
                signals,
                shifted,
            });
        }
        let (citations, dropped_citations) = validate_citations(draft.citations, &hits);

        Ok(PreparedTurn {
            outcome: TurnOutcome::Answered(GroundedAnswer {
                answer: draft.answer,
                citations,
                hits,
                plan,
                shift,
                dropped_citations,
            }),
            signals,
            shifted,
        })
    }

    fn commit(&self, context: &mut ThreadContext, signals: TurnSignals, shifted: bool, answered: bool) {
        if shifted {
            context.surfaced_ids.clear();
            context.turns_in_topic = 0;
        }

        for id in &signals.result_ids {
            if !context.surfaced_ids.contains(id) {
                context.surfaced_ids.push(id.clone());
            }
        }
        let overflow = context
            .surfaced_ids
            .len()
            .saturating_sub(self.config.max_surfaced_chunk_ids);
        context.surfaced_ids.drain(..overflow);

        if answered {
            context.turns_in_topic += 1;
        }
        self.detector.commit(&mut context.state, signals, shifted);
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, SearchError>
where
    F: Future<Output = Result<T, SearchError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SearchError::Cancelled),
        result = call => result,
    }
}

fn recent(ids: &[String], cap: usize) -> &[String] {
    &ids[ids.len().saturating_sub(cap)..]
}

fn answer_messages(question: &str, history: &[TurnRecord], hits: &[RetrievalHit]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(ANSWER_SYSTEM_PROMPT)];
    for turn in history {
        messages.push(ChatMessage::user(&turn.question));
        messages.push(ChatMessage::assistant(&turn.answer));
    }

    let references = hits
        .iter()
        .map(|hit| match hit.page {
            Some(page) => format!("[{} p.{page}]\n{}", hit.source_file_name, hit.content),
            None => format!("[{}]\n{}", hit.source_file_name, hit.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    messages.push(ChatMessage::user(format!(
        "<REF>\n{references}\n</REF>\n\nQuestion: {question}"
    )));
    messages
}

/// Keeps citations whose `(file, page)` pair belongs to a hit, de-duplicated in order, and
/// returns how many were dropped. File names are compared trimmed; page 0 never matches.
fn validate_citations(proposed: Vec<Citation>, hits: &[RetrievalHit]) -> (Vec<Citation>, usize) {
    let known: HashSet<(&str, u32)> = hits
        .iter()
        .filter_map(|hit| hit.page.map(|page| (hit.source_file_name.trim(), page)))
        .collect();

    let mut kept: Vec<Citation> = Vec::new();
    let mut dropped = 0;
    for mut citation in proposed {
        citation.file = citation.file.trim().to_string();
        if citation.page == 0 || !known.contains(&(citation.file.as_str(), citation.page)) {
            warn!(file = %citation.file, page = citation.page, "dropping citation with no matching hit");
            dropped += 1;
        } else if !kept.contains(&citation) {
            kept.push(citation);
        }
    }
    (kept, dropped)
}
