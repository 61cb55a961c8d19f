use crate::error::IngestError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;

/// Token ids in, text out. Implementations must agree with the embedding model's tokenizer
/// so chunk budgets hold once the text reaches the embedder.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// `cl100k_base`, the tokenizer of the 1536-dimension OpenAI embedding models.
#[derive(Clone)]
pub struct TiktokenCodec {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCodec {
    pub fn cl100k() -> Result<Self, IngestError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|error| IngestError::Tokenizer(error.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    fn try_decode(&self, tokens: &[u32]) -> Option<String> {
        self.bpe
            .decode(tokens.iter().map(|&token| token as _).collect())
            .ok()
    }
}

impl TokenCodec for TiktokenCodec {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|token| token as u32)
            .collect()
    }

    /// Window edges can cut a multi-byte character across tokens. When the whole run does
    /// not decode, tokens are decoded in the smallest groups that form valid UTF-8 and
    /// groups that never complete are dropped.
    fn decode(&self, tokens: &[u32]) -> String {
        if let Some(text) = self.try_decode(tokens) {
            return text;
        }

        const MAX_GROUP: usize = 4;
        let mut output = String::new();
        let mut start = 0;
        while start < tokens.len() {
            let mut advanced = false;
            for len in 1..=MAX_GROUP.min(tokens.len() - start) {
                if let Some(text) = self.try_decode(&tokens[start..start + len]) {
                    output.push_str(&text);
                    start += len;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                start += 1;
            }
        }
        output
    }
}

/// Whitespace-delimited word codec with an interned vocabulary. Deterministic and offline;
/// pairs with [`crate::embeddings::CharacterNgramEmbedder`].
#[derive(Default)]
pub struct WordCodec {
    vocabulary: Mutex<Vocabulary>,
}

#[derive(Default)]
struct Vocabulary {
    ids: HashMap<String, u32>,
    words: Vec<String>,
}

impl TokenCodec for WordCodec {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut vocabulary = match self.vocabulary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        text.split_whitespace()
            .map(|word| {
                if let Some(id) = vocabulary.ids.get(word) {
                    return *id;
                }
                let id = vocabulary.words.len() as u32;
                vocabulary.words.push(word.to_string());
                vocabulary.ids.insert(word.to_string(), id);
                id
            })
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let vocabulary = match self.vocabulary.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens
            .iter()
            .filter_map(|id| vocabulary.words.get(*id as usize).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
