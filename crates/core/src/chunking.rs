use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::tokenizer::TokenCodec;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

fn sentence_boundary() -> Option<&'static Regex> {
    static BOUNDARY: OnceLock<Option<Regex>> = OnceLock::new();
    BOUNDARY
        .get_or_init(|| Regex::new(r"[.?!。！？]+\s+|\n{2,}").ok())
        .as_ref()
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a paragraph after terminal punctuation (Latin and CJK) followed by whitespace, and
/// at blank lines. Punctuation stays with its sentence; empty pieces are dropped.
pub fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let Some(boundary_pattern) = sentence_boundary() else {
        let whole = paragraph.trim();
        return if whole.is_empty() { Vec::new() } else { vec![whole] };
    };

    for boundary in boundary_pattern.find_iter(paragraph) {
        let end = boundary.start() + boundary.as_str().trim_end().len();
        let sentence = paragraph[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = boundary.end();
    }

    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

pub fn make_chunk_id(doc_id: &str, page: u32, seq: u32) -> String {
    format!("{doc_id}_{page:04}_{seq:03}")
}

/// Recovers the page number from an id built by [`make_chunk_id`].
pub fn page_from_chunk_id(chunk_id: &str) -> Option<u32> {
    let mut parts = chunk_id.rsplitn(3, '_');
    let _seq = parts.next()?;
    let page = parts.next()?;
    parts.next()?;
    page.parse().ok()
}

/// Lazily turns paragraphs into token-bounded, overlapping chunks.
///
/// Sentences are accumulated into a token buffer. The buffer is emitted once it reaches
/// `target_min_tokens`, or before a sentence that would push it past `target_max_tokens`;
/// each emission re-seeds the buffer with its last `overlap_tokens` tokens. Sentences longer
/// than `target_max_tokens` are cut into windows of that size advancing by
/// `target_max_tokens - overlap_tokens`.
///
/// After any hard slice the buffer is seeded from the tail of the last slice, so the next
/// sentence carries that slice's overlap. A buffer holding nothing but a seed is never
/// emitted.
///
/// The stream owns its buffer state and cannot be restarted.
pub struct ChunkStream<'a, I> {
    paragraphs: I,
    codec: &'a dyn TokenCodec,
    config: ChunkingConfig,
    pending_sentences: VecDeque<Vec<u32>>,
    ready: VecDeque<Vec<u32>>,
    buffer: Vec<u32>,
    fresh_tokens: usize,
    exhausted: bool,
}

/// Validates the configuration and returns the lazy chunk stream.
pub fn chunk_paragraphs<'a, I, S>(
    paragraphs: I,
    codec: &'a dyn TokenCodec,
    config: ChunkingConfig,
) -> Result<ChunkStream<'a, I::IntoIter>, IngestError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    config.validate()?;
    Ok(ChunkStream {
        paragraphs: paragraphs.into_iter(),
        codec,
        config,
        pending_sentences: VecDeque::new(),
        ready: VecDeque::new(),
        buffer: Vec::new(),
        fresh_tokens: 0,
        exhausted: false,
    })
}

impl<'a, I, S> ChunkStream<'a, I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    fn load_paragraph(&mut self, paragraph: &str) {
        for sentence in split_sentences(paragraph) {
            // Leading space keeps word boundaries once sentence tokens are concatenated.
            let tokens = self.codec.encode(&format!(" {sentence}"));
            if !tokens.is_empty() {
                self.pending_sentences.push_back(tokens);
            }
        }
    }

    fn push_sentence(&mut self, tokens: Vec<u32>) {
        let max = self.config.target_max_tokens;

        if tokens.len() > max {
            self.emit_buffer();
            self.buffer.clear();
            self.emit_slices(&tokens);
            return;
        }

        if self.buffer.len() + tokens.len() > max {
            self.emit_buffer();
            self.seed_from_buffer();
            if self.buffer.len() + tokens.len() > max {
                let mut combined = std::mem::take(&mut self.buffer);
                combined.extend_from_slice(&tokens);
                self.emit_slices(&combined);
                return;
            }
        }

        self.fresh_tokens += tokens.len();
        self.buffer.extend(tokens);

        if self.buffer.len() >= self.config.target_min_tokens {
            self.emit_buffer();
            self.seed_from_buffer();
        }
    }

    fn emit_buffer(&mut self) {
        if self.fresh_tokens > 0 {
            self.ready.push_back(self.buffer.clone());
        }
        self.fresh_tokens = 0;
    }

    fn seed_from_buffer(&mut self) {
        let keep = self.config.overlap_tokens.min(self.buffer.len());
        self.buffer.drain(..self.buffer.len() - keep);
    }

    /// Decodes a window and checks the trimmed text against the budget. Trimming and lossy
    /// decoding can change how the text re-encodes; an over-budget tail is moved into the
    /// next chunk.
    fn render(&mut self, tokens: Vec<u32>) -> String {
        let max = self.config.target_max_tokens;
        let mut end = tokens.len();

        loop {
            let text = self.codec.decode(&tokens[..end]).trim().to_string();
            if end <= 1 || self.codec.count(&text) <= max {
                if end < tokens.len() {
                    self.ready.push_front(tokens[end..].to_vec());
                }
                return text;
            }
            end -= 1;
        }
    }

    fn emit_slices(&mut self, tokens: &[u32]) {
        let max = self.config.target_max_tokens;
        let step = self.config.step();
        let mut start = 0;

        loop {
            let end = (start + max).min(tokens.len());
            self.ready.push_back(tokens[start..end].to_vec());
            if end == tokens.len() {
                let keep = self.config.overlap_tokens.min(end - start);
                self.buffer = tokens[end - keep..end].to_vec();
                self.fresh_tokens = 0;
                return;
            }
            start += step;
        }
    }
}

impl<'a, I, S> Iterator for ChunkStream<'a, I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(tokens) = self.ready.pop_front() {
                return Some(self.render(tokens));
            }

            if let Some(sentence) = self.pending_sentences.pop_front() {
                self.push_sentence(sentence);
                continue;
            }

            if self.exhausted {
                return None;
            }

            match self.paragraphs.next() {
                Some(paragraph) => {
                    let paragraph = paragraph.as_ref().trim();
                    if !paragraph.is_empty() {
                        self.load_paragraph(paragraph);
                    }
                }
                None => {
                    self.exhausted = true;
                    self.emit_buffer();
                    self.buffer.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{TiktokenCodec, WordCodec};

    fn config(min: usize, max: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_min_tokens: min,
            target_max_tokens: max,
            overlap_tokens: overlap,
        }
    }

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    /// Paragraphs built from unique words so overlaps can be located unambiguously.
    fn numbered_paragraphs(sentence_lengths: &[&[usize]]) -> (Vec<String>, Vec<String>) {
        let mut counter = 0;
        let mut all_words = Vec::new();
        let mut paragraphs = Vec::new();
        for sentences in sentence_lengths {
            let mut paragraph = Vec::new();
            for &len in *sentences {
                let mut sentence = Vec::new();
                for index in 0..len {
                    let mut word = format!("w{counter}");
                    if index + 1 == len {
                        word.push('.');
                    }
                    counter += 1;
                    all_words.push(word.clone());
                    sentence.push(word);
                }
                paragraph.push(sentence.join(" "));
            }
            paragraphs.push(paragraph.join(" "));
        }
        (paragraphs, all_words)
    }

    fn stitch(chunks: &[String], overlap: usize) -> Vec<String> {
        let mut stitched: Vec<String> = Vec::new();
        for chunk in chunks {
            let next = words(chunk);
            let shared = (0..=overlap.min(next.len()).min(stitched.len()))
                .rev()
                .find(|&k| stitched[stitched.len() - k..] == next[..k])
                .unwrap_or(0);
            stitched.extend(next.into_iter().skip(shared));
        }
        stitched
    }

    #[test]
    fn chunks_stay_within_budget_with_bpe_tokens() -> Result<(), IngestError> {
        let codec = TiktokenCodec::cl100k()?;
        let paragraphs = [
            "연차 휴가는 입사 1년 후 15일이 부여됩니다. Annual leave is granted after one year of service. \
             병가는 연간 10일까지 사용할 수 있으며 진단서가 필요합니다. Unused days carry over to the next year.",
            "출장비 정산은 출장 종료 후 7일 이내에 영수증과 함께 제출해야 하며 해외 출장의 경우 환율은 \
             결제일 기준으로 적용되고 숙박비 상한은 지역별 기준표를 따른다",
        ];
        let max = 20;
        let chunks: Vec<String> =
            chunk_paragraphs(paragraphs, &codec, config(12, max, 5))?.collect();

        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(codec.count(chunk) <= max, "{} tokens: {chunk:?}", codec.count(chunk));
            assert_eq!(chunk.trim(), chunk);
        }
        Ok(())
    }

    #[test]
    fn sentences_split_on_punctuation_and_blank_lines() {
        assert!(sentence_boundary().is_some());
        let sentences = split_sentences("Hello there. How are you?\n\nNew block 다음。끝");
        assert_eq!(
            sentences,
            vec!["Hello there.", "How are you?", "New block 다음。끝"]
        );
        assert_eq!(split_sentences("  "), Vec::<&str>::new());
    }

    #[test]
    fn every_chunk_respects_max_tokens() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let (paragraphs, _) = numbered_paragraphs(&[&[3, 4, 5], &[30], &[2, 11, 6, 1], &[12, 12]]);
        let chunks: Vec<String> =
            chunk_paragraphs(&paragraphs, &codec, config(8, 12, 3))?.collect();

        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(words(chunk).len() <= 12, "chunk too long: {chunk}");
        }
        Ok(())
    }

    #[test]
    fn stitching_chunks_reconstructs_input() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let (paragraphs, expected) =
            numbered_paragraphs(&[&[3, 4, 5], &[30], &[2, 11, 6, 1], &[12, 12], &[9]]);
        let chunks: Vec<String> =
            chunk_paragraphs(&paragraphs, &codec, config(8, 12, 3))?.collect();

        assert_eq!(stitch(&chunks, 3), expected);
        Ok(())
    }

    #[test]
    fn oversized_sentence_is_sliced_with_overlap() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let (paragraphs, all) = numbered_paragraphs(&[&[10]]);
        let chunks: Vec<String> =
            chunk_paragraphs(&paragraphs, &codec, config(4, 4, 1))?.collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(words(&chunks[0]), all[0..4]);
        assert_eq!(words(&chunks[1]), all[3..7]);
        assert_eq!(words(&chunks[2]), all[6..10]);
        Ok(())
    }

    #[test]
    fn sentence_after_a_slice_carries_the_slice_tail() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let (paragraphs, all) = numbered_paragraphs(&[&[7, 2]]);
        let chunks: Vec<String> =
            chunk_paragraphs(&paragraphs, &codec, config(5, 5, 2))?.collect();

        // 7-word sentence -> [0..5], [3..7]; the 2-word sentence joins the tail [5..7].
        assert_eq!(chunks.len(), 3);
        assert_eq!(words(&chunks[1]), all[3..7]);
        assert_eq!(words(&chunks[2]), all[5..9]);
        Ok(())
    }

    #[test]
    fn soft_flush_emits_at_min_and_never_repeats_a_bare_seed() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let (paragraphs, all) = numbered_paragraphs(&[&[3, 3]]);
        let chunks: Vec<String> =
            chunk_paragraphs(&paragraphs, &codec, config(3, 10, 1))?.collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(words(&chunks[0]), all[0..3]);
        assert_eq!(words(&chunks[1]), all[2..6]);
        Ok(())
    }

    #[test]
    fn blank_paragraphs_are_skipped() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let chunks: Vec<String> = chunk_paragraphs(
            ["", "   ", "Sick leave is paid. Ask HR."],
            &codec,
            config(50, 100, 10),
        )?
        .collect();
        assert_eq!(chunks, vec!["Sick leave is paid. Ask HR.".to_string()]);
        Ok(())
    }

    #[test]
    fn stream_is_lazy_over_unbounded_input() -> Result<(), IngestError> {
        let codec = WordCodec::default();
        let endless = std::iter::repeat("one two three four.");
        let first: Vec<String> = chunk_paragraphs(endless, &codec, config(8, 10, 2))?
            .take(2)
            .collect();
        assert_eq!(first.len(), 2);
        Ok(())
    }

    #[test]
    fn degenerate_overlap_is_rejected() {
        let codec = WordCodec::default();
        let result = chunk_paragraphs(["text"], &codec, config(5, 5, 5));
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn chunk_ids_encode_page_and_sequence() {
        let id = make_chunk_id("3f2a9c", 7, 12);
        assert_eq!(id, "3f2a9c_0007_012");
        assert_eq!(page_from_chunk_id(&id), Some(7));
        assert_eq!(page_from_chunk_id("no-page"), None);
        assert!(make_chunk_id("d", 1, 9) < make_chunk_id("d", 1, 10));
        assert!(make_chunk_id("d", 1, 999) < make_chunk_id("d", 2, 0));
    }

    #[test]
    fn whitespace_is_normalized() {
        assert_eq!(normalize_whitespace("A  \t lot\u{a0}of\n spacing"), "A lot of spacing");
    }
}
