//! Applying parsed file operations to a project tree, then verifying them.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::core::detector::detect;
use crate::core::path::{display_relative, normalize_relative};
use crate::core::types::{FileOperation, OperationKind, OperationResult};
use crate::error::PipelineError;
use crate::io::atomic::write_atomic;

pub struct ApplyRequest<'a> {
    pub root: &'a Path,
    /// Task description, used to re-run detection at apply time.
    pub task_text: &'a str,
    /// Where to copy files before they are overwritten or deleted.
    pub backup_dir: Option<&'a Path>,
}

/// A reply path resolved inside the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve `raw` against `root`, refusing anything that lands outside it.
///
/// The check is lexical first, then the nearest existing ancestor is
/// canonicalized so a symlink inside the project cannot redirect the write.
pub fn resolve_in_root(root: &Path, raw: &str) -> Result<ResolvedPath, PipelineError> {
    let relative = normalize_relative(raw)?;
    let canonical_root = root.canonicalize().map_err(|err| {
        PipelineError::PathEscape(format!(
            "cannot canonicalize project root {}: {err}",
            root.display()
        ))
    })?;
    let absolute = canonical_root.join(&relative);

    let anchor = absolute
        .ancestors()
        .find(|candidate| fs::symlink_metadata(candidate).is_ok())
        .unwrap_or(canonical_root.as_path());
    let anchor = anchor.canonicalize().map_err(|err| {
        PipelineError::PathEscape(format!("cannot resolve '{raw}': {err}"))
    })?;
    if !anchor.starts_with(&canonical_root) {
        return Err(PipelineError::PathEscape(format!(
            "'{raw}' resolves outside the project root"
        )));
    }
    Ok(ResolvedPath { absolute, relative })
}

/// Apply every operation in order. One failure never stops the rest.
#[instrument(skip_all, fields(ops = operations.len()))]
pub fn apply_operations(
    request: &ApplyRequest<'_>,
    operations: &[FileOperation],
) -> Vec<OperationResult> {
    operations
        .iter()
        .map(|op| {
            let result = apply_one(request, op);
            if result.success {
                info!(path = %op.path, kind = %result.effective_kind, bytes = result.bytes_written, "operation applied");
            } else {
                warn!(path = %op.path, error = ?result.error, "operation failed");
            }
            result
        })
        .collect()
}

fn apply_one(request: &ApplyRequest<'_>, op: &FileOperation) -> OperationResult {
    let resolved = match resolve_in_root(request.root, &op.path) {
        Ok(resolved) => resolved,
        Err(err) => return failure(op, op.kind, &err),
    };
    let target = &resolved.absolute;
    if target.is_dir() {
        let err = PipelineError::FileWrite {
            path: op.path.clone(),
            reason: "target is a directory".to_string(),
        };
        return failure(op, op.kind, &err);
    }
    let exists = target.is_file();

    let effective_kind = match op.kind {
        OperationKind::Delete => OperationKind::Delete,
        _ => detect(exists, request.task_text).kind,
    };
    let mut note = (effective_kind != op.kind).then(|| {
        format!(
            "declared {} but file {}; applied as {}",
            op.kind,
            if exists { "exists" } else { "is absent" },
            effective_kind
        )
    });

    if exists
        && effective_kind != OperationKind::Create
        && let Some(backup_root) = request.backup_dir
        && let Err(err) = backup(target, &backup_root.join(&resolved.relative))
    {
        let err = PipelineError::FileWrite {
            path: op.path.clone(),
            reason: format!("backup failed: {err:#}"),
        };
        return failure(op, effective_kind, &err);
    }

    let mut result = OperationResult {
        operation: op.clone(),
        effective_kind,
        success: true,
        error_kind: None,
        error: None,
        bytes_written: 0,
        changed: true,
        note: None,
        verified: false,
    };

    match effective_kind {
        OperationKind::Delete => {
            if !exists {
                result.changed = false;
                note = Some("already absent".to_string());
            } else if let Err(err) = fs::remove_file(target) {
                let err = PipelineError::FileWrite {
                    path: op.path.clone(),
                    reason: err.to_string(),
                };
                return failure(op, effective_kind, &err);
            }
        }
        OperationKind::Create | OperationKind::Modify => {
            let content = op.content.as_deref().unwrap_or_default().as_bytes();
            if exists && fs::read(target).is_ok_and(|current| current == content) {
                result.changed = false;
                note.get_or_insert_with(|| "content unchanged".to_string());
            } else if let Err(err) = write_atomic(target, content) {
                let err = PipelineError::FileWrite {
                    path: op.path.clone(),
                    reason: format!("{err:#}"),
                };
                return failure(op, effective_kind, &err);
            }
            result.bytes_written = content.len() as u64;
        }
    }
    result.note = note;
    result
}

fn failure(op: &FileOperation, kind: OperationKind, err: &PipelineError) -> OperationResult {
    OperationResult::failed(op.clone(), kind, err.kind(), err.to_string())
}

fn backup(source: &Path, dest: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create backup dir {}", parent.display()))?;
    }
    fs::copy(source, dest)
        .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
    debug!(dest = %dest.display(), "backup written");
    Ok(())
}

/// Re-check every successful result against the filesystem.
///
/// Writes must exist with exactly `bytes_written` bytes; deletes must be gone.
/// When several operations in one batch hit the same path only the last
/// successful one is checked against disk; the earlier ones are marked
/// superseded. Mismatches flip the result to failed. Returns true when every
/// result, including ones that failed earlier, is a verified success.
#[instrument(skip_all, fields(results = results.len()))]
pub fn verify_results(root: &Path, results: &mut [OperationResult]) -> bool {
    let keys: Vec<Option<PathBuf>> = results
        .iter()
        .map(|r| normalize_relative(&r.operation.path).ok())
        .collect();
    for idx in 0..results.len() {
        if !results[idx].success {
            continue;
        }
        let superseded = keys[idx].as_ref().is_some_and(|key| {
            results[idx + 1..]
                .iter()
                .zip(&keys[idx + 1..])
                .any(|(later, later_key)| later.success && later_key.as_ref() == Some(key))
        });
        let result = &mut results[idx];
        if superseded {
            debug!(path = %result.operation.path, "superseded by a later operation");
            result.note = Some(match result.note.take() {
                Some(note) => format!("{note}; superseded by a later operation on the same path"),
                None => "superseded by a later operation on the same path".to_string(),
            });
            result.verified = true;
            continue;
        }
        if let Err(err) = verify_one(root, result) {
            warn!(path = %result.operation.path, error = %err, "verification failed");
            result.success = false;
            result.error_kind = Some(err.kind().to_string());
            result.error = Some(err.to_string());
            continue;
        }
        result.verified = true;
    }
    results.iter().all(|r| r.success && r.verified)
}

fn verify_one(root: &Path, result: &OperationResult) -> Result<(), PipelineError> {
    let path = result.operation.path.clone();
    let resolved = resolve_in_root(root, &path)?;
    let mismatch = |reason: String| PipelineError::VerificationMismatch {
        path: path.clone(),
        reason,
    };
    match result.effective_kind {
        OperationKind::Delete => match fs::symlink_metadata(&resolved.absolute) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(mismatch(err.to_string())),
            Ok(_) => Err(mismatch("file still exists after delete".to_string())),
        },
        OperationKind::Create | OperationKind::Modify => {
            let meta = fs::metadata(&resolved.absolute)
                .map_err(|err| mismatch(format!("missing after write: {err}")))?;
            if meta.len() != result.bytes_written {
                return Err(mismatch(format!(
                    "size {} != bytes written {}",
                    meta.len(),
                    result.bytes_written
                )));
            }
            Ok(())
        }
    }
}

/// Relative paths of results that actually changed the tree, in order.
pub fn changed_paths(results: &[OperationResult]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for result in results.iter().filter(|r| r.success && r.changed) {
        let Ok(relative) = normalize_relative(&result.operation.path) else {
            continue;
        };
        let display = display_relative(&relative);
        if !paths.contains(&display) {
            paths.push(display);
        }
    }
    paths
}
