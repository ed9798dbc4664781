//! Lexical helpers shared by the term index, the Linker and the test stubs.

use std::collections::BTreeSet;

/// Tokens shorter than this are never indexed.
pub const MIN_TERM_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "old", "see",
    "two", "who", "did", "get", "him", "let", "say", "she", "too", "use", "with", "this", "that",
    "from", "they", "will", "would", "there", "their", "what", "about", "which", "when", "were",
    "been", "into", "than", "then", "them", "these", "those", "some", "also", "very", "just",
    "only", "over", "such", "more", "most", "other", "after", "before", "while", "where", "being",
    "does", "doing", "each", "both", "few", "own", "same", "should", "could", "because", "until",
    "again", "further", "once", "here", "why", "between", "through", "during", "above", "below",
    "under", "off", "nor", "isn", "aren", "wasn", "weren", "never", "however", "later", "next",
];

/// Word sequences that mark a claim as contradicting what it overlaps with.
const CONTRADICTION_MARKERS: &[&str] = &[
    "not",
    "never",
    "no longer",
    "isn't",
    "aren't",
    "wasn't",
    "weren't",
    "doesn't",
    "don't",
    "didn't",
    "however",
    "contrary",
    "incorrect",
    "false",
    "instead of",
];

/// Word sequences that mark a claim as following another in time.
const TEMPORAL_MARKERS: &[&str] = &[
    "then",
    "after",
    "afterwards",
    "later",
    "subsequently",
    "next",
    "since",
    "following",
    "eventually",
    "by the time",
];

/// Index terms of a piece of content: lowercased alphanumeric tokens of at least
/// [`MIN_TERM_LEN`] characters that are not stop words.
pub fn terms(content: &str) -> BTreeSet<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Share of the smaller term set that also appears in the other, in `[0, 1]`.
pub fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / smaller as f64
}

pub fn has_contradiction_marker(content: &str) -> bool {
    contains_marker(content, CONTRADICTION_MARKERS)
}

pub fn has_temporal_marker(content: &str) -> bool {
    contains_marker(content, TEMPORAL_MARKERS)
}

fn contains_marker(content: &str, markers: &[&str]) -> bool {
    let words = words(content);
    markers.iter().any(|marker| {
        let phrase: Vec<&str> = marker.split(' ').collect();
        words
            .windows(phrase.len())
            .any(|window| window.iter().map(String::as_str).eq(phrase.iter().copied()))
    })
}

/// Lowercased words, keeping inner apostrophes so contractions stay whole.
fn words(content: &str) -> Vec<String> {
    content
        .to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Truncate content to `max_chars`, appending "..." if truncated.
pub fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars).collect();
        format!("{head}...")
    }
}
