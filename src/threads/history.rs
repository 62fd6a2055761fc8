//! History size bounds applied before each pipeline invocation.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use super::model::{Message, Role};

/// Upper bound on the history handed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "limit", rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Keep at most this many messages.
    MaxMessages(usize),
    /// Keep the model token count at or below this.
    MaxTokens(usize),
}

/// gpt-4o's encoding.
static TOKENIZER: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::o200k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "Could not load o200k_base, falling back to a length estimate");
        None
    }
});

/// Model tokens in `text`.
pub fn count_text_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Model tokens across all message contents.
pub fn count_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| count_text_tokens(&m.content)).sum()
}

impl HistoryPolicy {
    /// Drop messages from the head until the bound holds. A leading system
    /// message and the newest message are always kept. Returns how many
    /// were removed.
    pub fn trim(&self, messages: &mut Vec<Message>) -> usize {
        let pinned = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
        let trimmable = messages.len().saturating_sub(pinned);

        let excess = match *self {
            Self::MaxMessages(max) => messages.len().saturating_sub(max.max(pinned + 1)),
            Self::MaxTokens(max) => {
                let mut total = count_tokens(messages);
                let mut drop = 0;
                while total > max && trimmable - drop > 1 {
                    total -= count_text_tokens(&messages[pinned + drop].content);
                    drop += 1;
                }
                drop
            }
        };
        let excess = excess.min(trimmable.saturating_sub(1));
        messages.drain(pinned..pinned + excess);
        excess
    }
}
