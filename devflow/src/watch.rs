//! `devflow watch`: rerun the pipeline whenever the task file content changes.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use notify::{Event as NotifyEvent, PollWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::core::outcome::RunOutcome;
use crate::io::llm::LlmClient;
use crate::io::task_file::read_task_bytes;
use crate::io::watch_state::{WatchState, load_watch_state, write_watch_state};
use crate::pipeline::{PipelineRequest, run_pipeline};

/// Hex SHA-256 of the task bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Run the pipeline once if the task content differs from the last
/// processed content. A missing task file is not a change.
///
/// The hash is recorded whatever the outcome, so a halted run is
/// not retried until the file changes again.
pub fn process_if_changed<L: LlmClient + ?Sized>(
    request: &PipelineRequest<'_>,
    llm: &L,
) -> Result<Option<RunOutcome>> {
    if !request.task_path.is_file() {
        debug!(path = %request.task_path.display(), "task file absent");
        return Ok(None);
    }
    let state_path = &request.paths.state_path;
    let state = load_watch_state(state_path)?;
    let hash = content_hash(&read_task_bytes(request.task_path)?);
    if state.last_hash.as_deref() == Some(hash.as_str()) {
        return Ok(None);
    }

    info!(hash = %&hash[..12], "task content changed");
    let outcome = run_pipeline(request, llm)?;
    write_watch_state(
        state_path,
        &WatchState {
            last_hash: Some(hash),
            last_run_id: Some(outcome.run_id.clone()),
            updated_at: Some(Utc::now()),
        },
    )?;
    Ok(Some(outcome))
}

/// Poll the task file forever, one run at a time.
pub fn watch_task<L: LlmClient + ?Sized>(
    request: &PipelineRequest<'_>,
    llm: &L,
    interval: Duration,
) -> Result<()> {
    let watch_dir = request
        .task_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(&request.paths.root)
        .to_path_buf();
    let task_name = request
        .task_path
        .file_name()
        .context("task path has no file name")?
        .to_os_string();

    let (tx, rx) = mpsc::channel::<NotifyEvent>();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default().with_poll_interval(interval),
    )?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!(path = %request.task_path.display(), "watching task file");

    report(process_if_changed(request, llm));
    loop {
        let event = rx
            .recv()
            .context("watcher channel closed")?;
        let touches_task = event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(task_name.as_os_str()));
        if !touches_task {
            continue;
        }
        // Drain the burst a single save produces.
        while rx.recv_timeout(interval).is_ok() {}
        report(process_if_changed(request, llm));
    }
}

fn report(result: Result<Option<RunOutcome>>) {
    match result {
        Ok(Some(outcome)) => {
            let counts = outcome.counts();
            info!(
                run_id = %outcome.run_id,
                status = ?outcome.status(),
                created = counts.created,
                modified = counts.modified,
                deleted = counts.deleted,
                errors = counts.errors,
                "watch run finished"
            );
        }
        Ok(None) => debug!("task unchanged"),
        Err(err) => warn!(error = %format!("{err:#}"), "watch run failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedLlm, TestWorkspace};

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    /// Verifies one run per distinct task content.
    #[test]
    fn runs_only_when_content_changes() {
        let ws = TestWorkspace::new("demo");
        ws.write_task("PROJECT: demo\nTASK: Explain the layout\n");
        let llm = ScriptedLlm::new(&["Looks fine.", "Still fine."]);

        let first = process_if_changed(&ws.request(), &llm).expect("first");
        assert!(first.is_some());
        let again = process_if_changed(&ws.request(), &llm).expect("unchanged");
        assert!(again.is_none());
        assert_eq!(llm.calls(), 1);

        ws.write_task("PROJECT: demo\nTASK: Explain the layout again\n");
        let changed = process_if_changed(&ws.request(), &llm).expect("changed");
        assert!(changed.is_some());
        assert_eq!(llm.calls(), 2);

        let state = load_watch_state(&ws.paths.state_path).expect("state");
        assert_eq!(
            state.last_run_id.as_deref(),
            changed.as_ref().map(|o| o.run_id.as_str())
        );
    }

    #[test]
    fn missing_task_file_is_not_a_change() {
        let ws = TestWorkspace::new("demo");
        let llm = ScriptedLlm::new(&[]);
        assert!(process_if_changed(&ws.request(), &llm).expect("absent").is_none());
        assert_eq!(llm.calls(), 0);
    }
}
