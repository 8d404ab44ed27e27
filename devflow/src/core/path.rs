//! Lexical containment of reply-supplied paths inside a project root.

use std::path::{Component, Path, PathBuf};

use crate::error::PipelineError;

/// Normalize a relative path from an LLM reply.
///
/// Rejects empty and absolute paths, drive/UNC prefixes, and any `..` that
/// climbs above the root. `.` components are dropped. The result is a clean
/// relative path that never resolves to the root itself.
pub fn normalize_relative(raw: &str) -> Result<PathBuf, PipelineError> {
    let cleaned = raw.trim().replace('\\', "/");
    if cleaned.is_empty() {
        return Err(PipelineError::PathEscape("empty path".to_string()));
    }
    let bytes = cleaned.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(PipelineError::PathEscape(format!(
            "drive-qualified path '{raw}'"
        )));
    }

    let mut out = PathBuf::new();
    for component in Path::new(&cleaned).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(PipelineError::PathEscape(format!(
                        "'{raw}' climbs above the project root"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PipelineError::PathEscape(format!(
                    "absolute path '{raw}'"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PipelineError::PathEscape(format!(
            "'{raw}' resolves to the project root"
        )));
    }
    Ok(out)
}

/// `/`-separated display form of a normalized relative path.
pub fn display_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
