//! Prompt-driven extraction and summarization on top of a [`Completion`].

use async_trait::async_trait;

use super::{Completion, ExtractedClaim, Extractor, Summarizer};
use crate::error::CapabilityError;
use crate::text;

const EXTRACTION_PROMPT: &str = "\
You maintain a long-term memory of facts about a user.
Read the text below and list every durable fact it states: preferences,
biographical details, routines, plans and goals. Skip passing moods and
small talk. Each fact must make sense on its own, without the surrounding text.

Answer with a plain bulleted list, one fact per line and nothing else.
If there is nothing worth remembering, answer None.

Text:
";

const SUMMARY_PROMPT: &str = "\
Condense the notes below into a few short, flat bullet points.
Keep every distinct fact, drop repetition, keep the notes' language.

Notes:
";

/// Adapts a [`Completion`] into an [`Extractor`] by asking for a bulleted list
/// of facts and parsing the reply.
pub struct BulletListExtractor<C> {
    completion: C,
    confidence: f64,
}

impl<C: Completion> BulletListExtractor<C> {
    /// `confidence` is assigned to every parsed claim.
    pub fn new(completion: C, confidence: f64) -> Self {
        Self {
            completion,
            confidence,
        }
    }
}

#[async_trait]
impl<C: Completion> Extractor for BulletListExtractor<C> {
    async fn extract(&self, input: &str) -> Result<Vec<ExtractedClaim>, CapabilityError> {
        let reply = self
            .completion
            .complete(&format!("{EXTRACTION_PROMPT}{input}"))
            .await?;
        Ok(parse_bullets(&reply)
            .into_iter()
            .map(|claim| ExtractedClaim::new(claim, self.confidence))
            .collect())
    }
}

/// Bulleted (`-`, `*`, `•`) or numbered (`1.`, `1)`) lines of a reply.
/// Unmarked lines and a bare `None` yield nothing.
pub fn parse_bullets(reply: &str) -> Vec<String> {
    reply
        .lines()
        .filter_map(|line| strip_marker(line.trim()))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty() && !item.eq_ignore_ascii_case("none"))
        .collect()
}

fn strip_marker(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest);
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        return rest
            .strip_prefix(". ")
            .or_else(|| rest.strip_prefix(") "));
    }
    None
}

/// Renders members as one bullet each, truncated to `max_chars`.
#[derive(Debug, Clone)]
pub struct BulletSummarizer {
    pub max_chars: usize,
}

impl BulletSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for BulletSummarizer {
    fn default() -> Self {
        Self::new(4000)
    }
}

#[async_trait]
impl Summarizer for BulletSummarizer {
    async fn summarize(&self, contents: &[String]) -> Result<String, CapabilityError> {
        let body = contents
            .iter()
            .map(|c| format!("- {}", c.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text::truncate(&body, self.max_chars))
    }
}

/// Asks a [`Completion`] to condense members into bullet points.
pub struct CompletionSummarizer<C> {
    completion: C,
    max_chars: usize,
}

impl<C: Completion> CompletionSummarizer<C> {
    pub fn new(completion: C, max_chars: usize) -> Self {
        Self {
            completion,
            max_chars,
        }
    }
}

#[async_trait]
impl<C: Completion> Summarizer for CompletionSummarizer<C> {
    async fn summarize(&self, contents: &[String]) -> Result<String, CapabilityError> {
        let notes = contents
            .iter()
            .map(|c| format!("- {}", c.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = self
            .completion
            .complete(&format!("{SUMMARY_PROMPT}{notes}"))
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(CapabilityError::Unavailable("empty summary".into()));
        }
        Ok(text::truncate(reply, self.max_chars))
    }
}
