//! Parser for the `<file_operations>` block of an LLM reply.
//!
//! The reply is scanned once by a small state machine. Only the first block is
//! considered. Any structural problem inside that block yields zero operations
//! and a parse issue; there is no partial recovery.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{FileOperation, OperationKind};

const BLOCK_OPEN: &str = "<file_operations>";
const BLOCK_CLOSE: &str = "</file_operations>";
const OP_OPEN: &str = "<operation";
const OP_CLOSE: &str = "</operation>";
const CONTENT_OPEN: &str = "<content>";
const CONTENT_CLOSE: &str = "</content>";
const CDATA_OPEN: &str = "<![CDATA[";
/// `CDATA_OPEN` as it appears in the lowercased scan copy.
const CDATA_OPEN_LOWER: &str = "<![cdata[";
const CDATA_CLOSE: &str = "]]>";

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid attribute regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedReply {
    pub operations: Vec<FileOperation>,
    /// Reply text with the operation block removed, trimmed.
    pub analysis: String,
    /// Set when a block was found but could not be parsed.
    pub issue: Option<String>,
    pub block_found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Scanning,
    InBlock,
    InOperation { kind: OperationKind, self_closing: bool },
    Done,
}

struct Scanner<'a> {
    reply: &'a str,
    /// ASCII-lowercased copy; same byte offsets as `reply`.
    lower: String,
    pos: usize,
    block_start: usize,
    block_end: usize,
    pending_path: String,
    operations: Vec<FileOperation>,
}

/// Parse an LLM reply. Never fails; problems surface as `issue`.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let mut scanner = Scanner {
        reply,
        lower: reply.to_ascii_lowercase(),
        pos: 0,
        block_start: 0,
        block_end: 0,
        pending_path: String::new(),
        operations: Vec::new(),
    };
    match scanner.run() {
        Ok(false) => ParsedReply {
            operations: Vec::new(),
            analysis: reply.trim().to_string(),
            issue: None,
            block_found: false,
        },
        Ok(true) => {
            let (start, end) = widen_to_fence(reply, scanner.block_start, scanner.block_end);
            let mut analysis = reply[..start].trim_end().to_string();
            let tail = reply[end..].trim();
            if !tail.is_empty() {
                if !analysis.is_empty() {
                    analysis.push_str("\n\n");
                }
                analysis.push_str(tail);
            }
            ParsedReply {
                operations: scanner.operations,
                analysis: analysis.trim().to_string(),
                issue: None,
                block_found: true,
            }
        }
        Err(issue) => ParsedReply {
            operations: Vec::new(),
            analysis: reply.trim().to_string(),
            issue: Some(issue),
            block_found: true,
        },
    }
}

impl Scanner<'_> {
    /// Returns whether a block was found and fully parsed.
    fn run(&mut self) -> Result<bool, String> {
        let mut state = State::Scanning;
        loop {
            state = match state {
                State::Scanning => match self.find(BLOCK_OPEN, self.pos) {
                    None => return Ok(false),
                    Some(idx) => {
                        self.block_start = idx;
                        self.pos = idx + BLOCK_OPEN.len();
                        State::InBlock
                    }
                },
                State::InBlock => self.step_block()?,
                State::InOperation { kind, self_closing } => {
                    self.step_operation(kind, self_closing)?
                }
                State::Done => return Ok(true),
            };
        }
    }

    fn find(&self, needle: &str, from: usize) -> Option<usize> {
        self.lower[from..].find(needle).map(|idx| idx + from)
    }

    /// Next `<operation` tag start that is a real tag (not `<operations>` etc.).
    fn find_op_open(&self, from: usize) -> Option<usize> {
        let mut cursor = from;
        while let Some(idx) = self.find(OP_OPEN, cursor) {
            let after = self.lower[idx + OP_OPEN.len()..].chars().next();
            if matches!(after, Some(c) if c.is_whitespace() || c == '>' || c == '/') {
                return Some(idx);
            }
            cursor = idx + OP_OPEN.len();
        }
        None
    }

    fn step_block(&mut self) -> Result<State, String> {
        let next_op = self.find_op_open(self.pos);
        let close = self.find(BLOCK_CLOSE, self.pos);
        match (next_op, close) {
            (Some(op), Some(close)) if op < close => self.open_operation(op),
            (Some(op), None) => self.open_operation(op),
            (_, Some(close)) => {
                self.block_end = close + BLOCK_CLOSE.len();
                self.pos = self.block_end;
                Ok(State::Done)
            }
            (None, None) => Err("unterminated <file_operations> block".to_string()),
        }
    }

    fn open_operation(&mut self, start: usize) -> Result<State, String> {
        let header_end = self
            .find(">", start)
            .ok_or_else(|| "unterminated <operation> tag".to_string())?;
        let header = &self.reply[start + OP_OPEN.len()..header_end];
        let self_closing = header.trim_end().ends_with('/');
        let header = header.trim_end().trim_end_matches('/');

        let mut kind_raw = None;
        let mut path = None;
        for caps in ATTR_RE.captures_iter(header) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match caps[1].to_ascii_lowercase().as_str() {
                "type" => kind_raw = Some(value),
                "path" => path = Some(value),
                _ => {}
            }
        }
        let kind_raw = kind_raw.ok_or_else(|| "operation is missing the type attribute".to_string())?;
        let kind = OperationKind::parse(&kind_raw)
            .ok_or_else(|| format!("unknown operation type '{kind_raw}'"))?;
        let path = path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "operation is missing the path attribute".to_string())?;

        self.pending_path = path;
        self.pos = header_end + 1;
        Ok(State::InOperation { kind, self_closing })
    }

    fn step_operation(&mut self, kind: OperationKind, self_closing: bool) -> Result<State, String> {
        let path = std::mem::take(&mut self.pending_path);
        if self_closing {
            if kind != OperationKind::Delete {
                return Err(format!("{kind} operation for '{path}' has no content"));
            }
            self.operations.push(FileOperation::delete(&path));
            return Ok(State::InBlock);
        }

        let op_close = self
            .find(OP_CLOSE, self.pos)
            .ok_or_else(|| format!("unterminated <operation> for '{path}'"))?;

        if kind == OperationKind::Delete {
            self.operations.push(FileOperation::delete(&path));
            self.pos = op_close + OP_CLOSE.len();
            return Ok(State::InBlock);
        }

        let content_open = self
            .find(CONTENT_OPEN, self.pos)
            .filter(|idx| *idx < op_close)
            .ok_or_else(|| format!("{kind} operation for '{path}' has no <content>"))?;
        let body_start = content_open + CONTENT_OPEN.len();
        // Search for the closing tag from the end of the operation so content
        // that itself mentions `</content>` stays intact inside CDATA.
        let content_close = self.lower[body_start..]
            .find(CDATA_OPEN_LOWER)
            .filter(|idx| body_start + idx < op_close)
            .and_then(|cdata| {
                let cdata_end = self.find(CDATA_CLOSE, body_start + cdata)?;
                self.find(CONTENT_CLOSE, cdata_end)
            })
            .or_else(|| self.find(CONTENT_CLOSE, body_start))
            .ok_or_else(|| format!("unterminated <content> for '{path}'"))?;
        let op_close = self
            .find(OP_CLOSE, content_close)
            .ok_or_else(|| format!("unterminated <operation> for '{path}'"))?;

        let content = clean_content(&self.reply[body_start..content_close]);
        self.operations.push(FileOperation {
            kind,
            path,
            content: Some(content),
        });
        self.pos = op_close + OP_CLOSE.len();
        Ok(State::InBlock)
    }
}

/// Unwrap one CDATA section, drop leading blank lines and trailing whitespace,
/// and end with exactly one newline.
pub fn clean_content(raw: &str) -> String {
    let mut text = raw;
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix(CDATA_OPEN)
        .and_then(|rest| rest.strip_suffix(CDATA_CLOSE))
    {
        text = inner;
    }

    let mut start = 0;
    for line in text.split_inclusive('\n') {
        if !line.trim().is_empty() {
            break;
        }
        start += line.len();
    }
    let body = text[start..].trim_end();
    if body.is_empty() {
        return String::new();
    }
    format!("{body}\n")
}

/// Extend a block span over a surrounding markdown code fence, if any.
fn widen_to_fence(reply: &str, start: usize, end: usize) -> (usize, usize) {
    let before = reply[..start].trim_end();
    let after = &reply[end..];
    let after_trimmed = after.trim_start();
    let Some(fence_start) = before.rfind("```") else {
        return (start, end);
    };
    let fence_line = &before[fence_start..];
    if fence_line.contains('\n') || !after_trimmed.starts_with("```") {
        return (start, end);
    }
    let after_fence = end + (after.len() - after_trimmed.len()) + 3;
    (fence_start, after_fence)
}
