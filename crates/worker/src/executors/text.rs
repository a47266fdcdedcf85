use async_trait::async_trait;
use draftwork_domain::{
    word_count, EnhancedText, ProcessedText, TaskOutput, TaskPayload, TaskType, TextChunk,
};
use draftwork_errors::{RuntimeError, RuntimeResult};
use tracing::debug;

use super::{expect_text, TaskExecutor};
use crate::progress::ProgressReporter;

pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Splits `text` into chunks of at most `chunk_size` characters, cutting on
/// whitespace where one is available. A single word longer than the limit
/// is split mid-word.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let limit = rest
            .char_indices()
            .nth(chunk_size)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());

        let cut = if limit == rest.len() || rest[limit..].starts_with(char::is_whitespace) {
            limit
        } else {
            match rest[..limit].rfind(char::is_whitespace) {
                Some(ws) if ws > 0 => ws,
                _ => limit,
            }
        };

        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }

    chunks
}

/// Splits text into chunks with per-chunk counts.
#[derive(Debug, Default)]
pub struct ProcessTextExecutor;

#[async_trait]
impl TaskExecutor for ProcessTextExecutor {
    fn name(&self) -> &str {
        "text-processor"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ProcessText
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let (text, options) = expect_text(self.task_type(), payload)?;
        let chunk_size = match options.get("chunk_size") {
            None | Some(serde_json::Value::Null) => DEFAULT_CHUNK_SIZE,
            Some(value) => value
                .as_u64()
                .filter(|size| *size > 0)
                .map(|size| size as usize)
                .ok_or_else(|| {
                    RuntimeError::execution(format!("chunk_size 必须是正整数: {value}"))
                })?,
        };

        let pieces = chunk_text(&text, chunk_size);
        let total = pieces.len();
        let mut chunks = Vec::with_capacity(total);

        for (index, piece) in pieces.into_iter().enumerate() {
            chunks.push(TextChunk {
                index,
                char_count: piece.chars().count(),
                word_count: word_count(&piece),
                text: piece,
            });
            progress.report_step(index + 1, total, Some("chunk"));
            // gives an abort a chance to land between chunks
            tokio::task::yield_now().await;
        }
        debug!("Split {} chars into {} chunks", text.len(), total);

        let processed = ProcessedText {
            total_chars: chunks.iter().map(|c| c.char_count).sum(),
            total_words: chunks.iter().map(|c| c.word_count).sum(),
            chunks,
        };
        Ok(serde_json::to_value(processed)?)
    }
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_tight_punctuation(c: char) -> bool {
    matches!(c, ',' | '.' | ';' | ':' | '!' | '?')
}

fn collapse_spaces(line: &str, changes: &mut usize) -> String {
    let mut out = String::with_capacity(line.len());
    let mut run = 0usize;
    let mut run_was_plain_space = true;

    for c in line.chars() {
        if c == ' ' || c == '\t' {
            run += 1;
            run_was_plain_space &= c == ' ';
            continue;
        }
        if run > 0 {
            if run > 1 || !run_was_plain_space {
                *changes += 1;
            }
            out.push(' ');
            run = 0;
            run_was_plain_space = true;
        }
        out.push(c);
    }
    out
}

fn remove_space_before_punctuation(text: &str, changes: &mut usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ' ' && chars.peek().copied().is_some_and(is_tight_punctuation) {
            *changes += 1;
            continue;
        }
        out.push(c);
    }
    out
}

fn capitalize_sentences(text: &str, changes: &mut usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_start = true;
    let mut after_terminal = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if after_terminal {
                at_start = true;
                after_terminal = false;
            }
            out.push(c);
            continue;
        }

        after_terminal = is_sentence_end(c);
        if at_start && c.is_alphanumeric() {
            if c.is_lowercase() {
                out.extend(c.to_uppercase());
                *changes += 1;
            } else {
                out.push(c);
            }
            at_start = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Whitespace and punctuation cleanup: trims lines, collapses space runs,
/// keeps at most one blank line between paragraphs, drops spaces before
/// punctuation and capitalizes sentence starts. Returns the text and the
/// number of edits made.
pub fn normalize_text(input: &str) -> (String, usize) {
    let mut changes = 0;
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;

    for raw in input.lines() {
        let trimmed = raw.trim();
        if trimmed.len() != raw.len() {
            changes += 1;
        }
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 || lines.is_empty() {
                changes += 1;
                continue;
            }
            lines.push(String::new());
            continue;
        }
        blank_run = 0;
        lines.push(collapse_spaces(trimmed, &mut changes));
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
        changes += 1;
    }

    let joined = lines.join("\n");
    let spaced = remove_space_before_punctuation(&joined, &mut changes);
    let capitalized = capitalize_sentences(&spaced, &mut changes);
    (capitalized, changes)
}

/// Rule-based cleanup of generated text. Does not rewrite content.
#[derive(Debug, Default)]
pub struct EnhanceTextExecutor;

#[async_trait]
impl TaskExecutor for EnhanceTextExecutor {
    fn name(&self) -> &str {
        "text-enhancer"
    }

    fn task_type(&self) -> TaskType {
        TaskType::EnhanceText
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let (text, _options) = expect_text(self.task_type(), payload)?;
        progress.report(10, Some("normalizing"));

        let (enhanced, changes) = normalize_text(&text);
        progress.report(90, Some("normalized"));

        Ok(serde_json::to_value(EnhancedText {
            original: text,
            enhanced,
            changes,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_text_respects_limit_and_words() {
        let chunks = chunk_text("alpha beta gamma delta", 11);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 11));
    }

    #[test]
    fn test_chunk_text_splits_long_words() {
        assert_eq!(chunk_text("abcdefgh", 3), vec!["abc", "def", "gh"]);
    }

    #[test]
    fn test_chunk_text_edge_cases() {
        assert!(chunk_text("   ", 10).is_empty());
        assert_eq!(chunk_text("short", 2000), vec!["short"]);
        // multi-byte characters count as one
        assert_eq!(chunk_text("ééé ééé", 3), vec!["ééé", "ééé"]);
    }

    #[test]
    fn test_normalize_text() {
        let (text, changes) = normalize_text("hello   world , this is fine.  next sentence!");
        assert_eq!(text, "Hello world, this is fine. Next sentence!");
        assert_eq!(changes, 5);
    }

    #[test]
    fn test_normalize_text_paragraphs() {
        let (text, _) = normalize_text("\n\nfirst line.  \n\n\n\nsecond\tparagraph?yes\n\n");
        assert_eq!(text, "First line.\n\nSecond paragraph?yes");
    }

    #[test]
    fn test_normalize_clean_text_is_untouched() {
        let (text, changes) = normalize_text("Already clean. Nothing to do.");
        assert_eq!(text, "Already clean. Nothing to do.");
        assert_eq!(changes, 0);
    }

    #[tokio::test]
    async fn test_process_text_executor() {
        let payload = TaskPayload::Text {
            text: "one two three four".to_string(),
            options: json!({"chunk_size": 8}),
        };
        let output = ProcessTextExecutor
            .execute(payload, &ProgressReporter::detached("t"))
            .await
            .unwrap();
        let processed: ProcessedText = serde_json::from_value(output).unwrap();
        let texts: Vec<&str> = processed.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one two", "three", "four"]);
        assert_eq!(processed.total_words, 4);
        assert_eq!(processed.chunks[1].index, 1);
    }

    #[tokio::test]
    async fn test_process_text_rejects_bad_chunk_size() {
        let payload = TaskPayload::Text {
            text: "x".to_string(),
            options: json!({"chunk_size": 0}),
        };
        let result = ProcessTextExecutor
            .execute(payload, &ProgressReporter::detached("t"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_enhance_text_executor() {
        let output = EnhanceTextExecutor
            .execute(TaskPayload::text("great  team player ."), &ProgressReporter::detached("t"))
            .await
            .unwrap();
        let enhanced: EnhancedText = serde_json::from_value(output).unwrap();
        assert_eq!(enhanced.enhanced, "Great team player.");
        assert_eq!(enhanced.original, "great  team player .");
        assert!(enhanced.changes >= 3);
    }
}
