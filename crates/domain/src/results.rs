//! Typed results produced by the built-in executors.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub file_name: String,
    pub text: String,
    pub format: String,
    pub char_count: usize,
    pub word_count: usize,
}

impl ParsedDocument {
    pub fn new(file_name: impl Into<String>, format: impl Into<String>, text: String) -> Self {
        Self {
            file_name: file_name.into(),
            format: format.into(),
            char_count: text.chars().count(),
            word_count: word_count(&text),
            text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub char_count: usize,
    pub word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedText {
    pub chunks: Vec<TextChunk>,
    pub total_chars: usize,
    pub total_words: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedText {
    pub original: String,
    pub enhanced: String,
    /// Number of individual normalizations applied.
    pub changes: usize,
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
