use thiserror::Error;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::models::{ChatMessage, MessageRole};

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("failed to load encoding {name}: {reason}")]
    Load { name: &'static str, reason: String },
    #[error("tokenizer unavailable: {0}")]
    Unavailable(String),
}

/// Token accounting used to fill `usage` on gateway responses.
///
/// Implementors supply the two primitive counters; the composite counts (per-message
/// overhead, Claude prompt rendering) are shared.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> u32;

    fn count_claude_text(&self, text: &str) -> Result<u32, TokenizerError>;

    fn count_message(&self, message: &ChatMessage, model: &str) -> u32 {
        let (per_message, per_name) = message_overhead(model);
        let mut total = per_message
            + i64::from(self.count_text(&message.content, model))
            + i64::from(self.count_text(message.role.as_str(), model));
        if let Some(name) = message.name.as_deref().filter(|name| !name.is_empty()) {
            total += per_name + i64::from(self.count_text(name, model));
        }
        u32::try_from(total.max(0)).unwrap_or(u32::MAX)
    }

    /// Prompt tokens for a message list, including the 3 tokens that prime the reply.
    fn count_messages(&self, messages: &[ChatMessage], model: &str) -> u32 {
        messages
            .iter()
            .map(|message| self.count_message(message, model))
            .fold(3u32, u32::saturating_add)
    }

    fn count_claude_prompt(
        &self,
        system: &str,
        turns: &[ChatMessage],
    ) -> Result<u32, TokenizerError> {
        self.count_claude_text(&claude_prompt(system, turns))
    }
}

/// Renders a conversation the way the Claude tokenizer expects to see it.
pub fn claude_prompt(system: &str, turns: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    if !system.is_empty() {
        prompt.push_str("\n\nSystem:");
        prompt.push_str(system);
    }
    for turn in turns {
        prompt.push_str("\n\n");
        prompt.push_str(turn.role.as_str());
        prompt.push(':');
        prompt.push_str(&turn.content);
    }
    if turns.last().is_some_and(|turn| turn.role == MessageRole::User) {
        prompt.push_str("\n\nAssistant:");
    }
    prompt
}

fn message_overhead(model: &str) -> (i64, i64) {
    if model == "gpt-3.5-turbo-0301" {
        (4, -1)
    } else {
        (3, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Cl100k,
    O200k,
}

fn encoding_for(model: &str) -> Encoding {
    const EXACT: &[(&str, Encoding)] = &[
        ("gpt-4o", Encoding::O200k),
        ("gpt-4", Encoding::Cl100k),
        ("gpt-3.5-turbo", Encoding::Cl100k),
        ("gpt-3.5", Encoding::Cl100k),
        ("gpt-35-turbo", Encoding::Cl100k),
    ];
    const PREFIXES: &[(&str, Encoding)] = &[
        ("o1-", Encoding::O200k),
        ("chatgpt-4o-", Encoding::O200k),
        ("gpt-4o-", Encoding::O200k),
        ("gpt-4-", Encoding::Cl100k),
        ("gpt-3.5-turbo-", Encoding::Cl100k),
        ("gpt-35-turbo-", Encoding::Cl100k),
    ];

    EXACT
        .iter()
        .find(|(name, _)| *name == model)
        .or_else(|| PREFIXES.iter().find(|(prefix, _)| model.starts_with(prefix)))
        .map(|(_, encoding)| *encoding)
        .unwrap_or(Encoding::Cl100k)
}

/// BPE counter backed by the bundled tiktoken encodings.
///
/// No Claude vocabulary ships with the gateway, so Claude text is counted with
/// `cl100k_base`, which tracks it closely for English prose.
pub struct TiktokenCounter {
    cl100k: CoreBPE,
    o200k: CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> Result<Self, TokenizerError> {
        let cl100k = cl100k_base().map_err(|error| TokenizerError::Load {
            name: "cl100k_base",
            reason: error.to_string(),
        })?;
        let o200k = o200k_base().map_err(|error| TokenizerError::Load {
            name: "o200k_base",
            reason: error.to_string(),
        })?;
        Ok(Self { cl100k, o200k })
    }

    fn bpe(&self, model: &str) -> &CoreBPE {
        match encoding_for(model) {
            Encoding::Cl100k => &self.cl100k,
            Encoding::O200k => &self.o200k,
        }
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str, model: &str) -> u32 {
        u32::try_from(self.bpe(model).encode_ordinary(text).len()).unwrap_or(u32::MAX)
    }

    fn count_claude_text(&self, text: &str) -> Result<u32, TokenizerError> {
        Ok(u32::try_from(self.cl100k.encode_ordinary(text).len()).unwrap_or(u32::MAX))
    }
}

/// Whitespace word count. Used by the offline mock backend and in tests where exact
/// BPE counts are irrelevant.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoughCounter;

impl TokenCounter for RoughCounter {
    fn count_text(&self, text: &str, _model: &str) -> u32 {
        rough_token_estimate(text)
    }

    fn count_claude_text(&self, text: &str) -> Result<u32, TokenizerError> {
        Ok(rough_token_estimate(text))
    }
}

fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}
