use std::io::{Cursor, Read};
use std::process::Stdio;

use async_trait::async_trait;
use draftwork_domain::{ParsedDocument, TaskOutput, TaskPayload, TaskType};
use draftwork_errors::{RuntimeError, RuntimeResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::{expect_document, TaskExecutor};
use crate::progress::ProgressReporter;

fn to_output(document: ParsedDocument) -> RuntimeResult<TaskOutput> {
    Ok(serde_json::to_value(document)?)
}

fn normalize_newlines(text: &str) -> String {
    text.trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// Plain-text documents.
#[derive(Debug, Default)]
pub struct ParseTextExecutor;

#[async_trait]
impl TaskExecutor for ParseTextExecutor {
    fn name(&self) -> &str {
        "text-parser"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ParseText
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let input = expect_document(self.task_type(), payload)?;
        let text = match String::from_utf8(input.bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "{} is not valid UTF-8, invalid sequences replaced",
                    input.file_name
                );
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        progress.report(50, Some("decoded"));

        to_output(ParsedDocument::new(
            input.file_name,
            "text",
            normalize_newlines(&text),
        ))
    }
}

/// Word documents: text runs of `word/document.xml`.
#[derive(Debug, Default)]
pub struct ParseDocxExecutor;

#[async_trait]
impl TaskExecutor for ParseDocxExecutor {
    fn name(&self) -> &str {
        "docx-parser"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ParseDocx
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let input = expect_document(self.task_type(), payload)?;
        progress.report(10, Some("unzipping"));

        let bytes = input.bytes;
        let text = tokio::task::spawn_blocking(move || extract_docx_text(&bytes))
            .await
            .map_err(|e| RuntimeError::execution(format!("docx 解析任务异常退出: {e}")))??;
        progress.report(90, Some("extracted"));

        to_output(ParsedDocument::new(input.file_name, "docx", text))
    }
}

/// Reads the main document part and flattens it to text: `<w:t>` runs,
/// a newline per paragraph, tabs and breaks kept.
pub fn extract_docx_text(bytes: &[u8]) -> RuntimeResult<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RuntimeError::execution(format!("无效的 docx 文件: {e}")))?;
    let mut part = archive
        .by_name("word/document.xml")
        .map_err(|e| RuntimeError::execution(format!("docx 缺少 word/document.xml: {e}")))?;

    let mut xml = String::new();
    part.read_to_string(&mut xml)?;
    Ok(docx_xml_to_text(&xml))
}

fn docx_xml_to_text(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len() / 4);
    let mut rest = xml;
    let mut in_text_run = false;

    while let Some(open) = rest.find('<') {
        if in_text_run {
            out.push_str(&decode_xml_entities(&rest[..open]));
        }
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");
        let closing = tag.starts_with('/');
        let self_closing = tag.ends_with('/');

        match name {
            "w:t" if closing => in_text_run = false,
            "w:t" => in_text_run = !self_closing,
            "w:p" if closing => out.push('\n'),
            "w:tab" => out.push('\t'),
            "w:br" | "w:cr" => out.push('\n'),
            _ => {}
        }
    }

    out.trim_end().to_string()
}

fn decode_xml_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&after[..=semi]),
        }
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    out
}

/// PDFs through poppler's `pdftotext`, bytes fed on stdin.
#[derive(Debug)]
pub struct ParsePdfExecutor {
    binary: String,
}

impl Default for ParsePdfExecutor {
    fn default() -> Self {
        Self {
            binary: "pdftotext".to_string(),
        }
    }
}

impl ParsePdfExecutor {
    pub fn with_binary<S: Into<String>>(binary: S) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ParsePdfExecutor {
    fn name(&self) -> &str {
        "pdf-parser"
    }

    fn task_type(&self) -> TaskType {
        TaskType::ParsePdf
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let input = expect_document(self.task_type(), payload)?;
        info!("执行PDF解析: file={}, bytes={}", input.file_name, input.bytes.len());

        let mut child = Command::new(&self.binary)
            .args(["-layout", "-enc", "UTF-8", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // killed when an aborted task drops the child
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::execution(format!("启动 {} 失败: {e}", self.binary)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::execution("无法获取stdin"))?;
        let bytes = input.bytes;
        let writer = tokio::spawn(async move {
            stdin.write_all(&bytes).await?;
            stdin.shutdown().await
        });
        progress.report(20, Some("extracting"));

        let output = child.wait_with_output().await?;
        if let Ok(Err(e)) = writer.await {
            debug!("pdftotext closed stdin early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::execution(format!(
                "pdftotext 解析失败 ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        progress.report(90, Some("extracted"));

        let text = String::from_utf8_lossy(&output.stdout);
        to_output(ParsedDocument::new(
            input.file_name,
            "pdf",
            normalize_newlines(text.trim_end()),
        ))
    }
}
