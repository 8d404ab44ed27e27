//! CREATE vs MODIFY classification for a target file.
//!
//! File existence decides the kind. Keywords in the task text only move the
//! confidence: they can agree with the filesystem, say nothing, or disagree.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::OperationKind;

pub const CONFIDENCE_AGREE: f32 = 0.95;
pub const CONFIDENCE_NO_KEYWORDS: f32 = 0.75;
pub const CONFIDENCE_DISAGREE: f32 = 0.6;

static MODIFY_TOKENS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bfix",
        r"\bupdate",
        r"\boprav",
        r"\badd\s+to\b",
        r"\bmodify",
        r"\bchange",
        r"\brefactor",
        r"\buprav",
        r"\bedit",
        r"\brename",
        r"\bcomment",
    ])
});

static CREATE_TOKENS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bcreate",
        r"\bnew\b",
        r"\bvytvor",
        r"\bgenerate",
        r"\bscaffold",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid keyword regex"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub kind: OperationKind,
    pub confidence: f32,
    /// What the keywords alone suggested, if any matched.
    pub keyword_hint: Option<OperationKind>,
}

/// Keyword hit counts `(modify, create)` over the lower-cased text.
pub fn keyword_scores(task_text: &str) -> (usize, usize) {
    let text = task_text.to_lowercase();
    let count = |tokens: &[Regex]| -> usize {
        tokens
            .iter()
            .map(|token| token.find_iter(&text).count())
            .sum()
    };
    (count(&MODIFY_TOKENS), count(&CREATE_TOKENS))
}

/// Keyword verdict; ties (including one-each) go to CREATE.
pub fn keyword_hint(task_text: &str) -> Option<OperationKind> {
    match keyword_scores(task_text) {
        (0, 0) => None,
        (modify, create) if modify > create => Some(OperationKind::Modify),
        _ => Some(OperationKind::Create),
    }
}

/// Classify one target. `exists` must come from the filesystem.
pub fn detect(exists: bool, task_text: &str) -> Detection {
    let kind = if exists {
        OperationKind::Modify
    } else {
        OperationKind::Create
    };
    let hint = keyword_hint(task_text);
    let confidence = match hint {
        None => CONFIDENCE_NO_KEYWORDS,
        Some(hint) if hint == kind => CONFIDENCE_AGREE,
        Some(_) => CONFIDENCE_DISAGREE,
    };
    Detection {
        kind,
        confidence,
        keyword_hint: hint,
    }
}
