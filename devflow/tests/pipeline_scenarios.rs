//! End-to-end pipeline runs against temporary git-backed projects.
//!
//! Each test scripts the LLM reply, runs the full pipeline and inspects the
//! project tree, the git history and the written report.

use devflow::core::commit::CommitPlan;
use devflow::core::outcome::{GitOutcome, RunStatus};
use devflow::core::types::OperationKind;
use devflow::pipeline::run_pipeline;
use devflow::test_support::{ScriptedLlm, TestWorkspace};

const HELLO_CREATE: &str = r#"I'll add the module with a single function.

<file_operations>
  <operation type="create" path="src/hello.py">
    <content>
def hello():
    return 'hi'
</content>
  </operation>
</file_operations>
"#;

const HELLO_FIX: &str = r#"The return value had a typo.

<file_operations>
  <operation type="modify" path="src/hello.py">
    <content><![CDATA[def hello():
    return 'hi'
]]></content>
  </operation>
</file_operations>
"#;

/// Scenario A: a new file is detected as CREATE, written, verified and committed.
#[test]
fn scenario_a_create_and_commit() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: create src/hello.py returning 'hi'\nAUTO_COMMIT: yes\n");
    let llm = ScriptedLlm::new(&[HELLO_CREATE]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Completed);
    let prompt = llm.last_prompt().expect("prompt sent");
    assert!(prompt.contains("src/hello.py (CREATE"), "prompt: {prompt}");
    assert_eq!(
        ws.read_project_file("src/hello.py"),
        "def hello():\n    return 'hi'\n"
    );
    assert!(outcome.operations[0].verified);
    match &outcome.git {
        GitOutcome::Committed(record) => {
            assert_eq!(record.files, vec!["src/hello.py".to_string()]);
            assert!(!record.pushed);
        }
        other => panic!("expected commit, got {other:?}"),
    }
    assert_eq!(ws.commit_count(), 2);
    assert_eq!(ws.git(&["status", "--porcelain"]), "");

    let report = ws.report();
    assert!(report.contains("Created: 1 | Modified: 0 | Deleted: 0 | Errors: 0"));
    assert!(report.contains("I'll add the module with a single function."));
}

/// Scenario B: an existing file is detected as MODIFY and its content reaches the prompt.
#[test]
fn scenario_b_modify_existing_file() {
    let ws = TestWorkspace::new("demo");
    ws.write_project_file("src/hello.py", "def hello():\n    return 'hii'\n");
    ws.commit_all("add hello");
    ws.write_task("PROJECT: demo\nTASK: fix typo in src/hello.py\n");
    let llm = ScriptedLlm::new(&[HELLO_FIX]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    let prompt = llm.last_prompt().expect("prompt sent");
    assert!(prompt.contains("src/hello.py (MODIFY, confidence 0.95)"), "prompt: {prompt}");
    assert!(prompt.contains("return 'hii'"));

    assert_eq!(outcome.counts().modified, 1);
    assert_eq!(outcome.operations[0].effective_kind, OperationKind::Modify);
    assert!(outcome.operations[0].verified);
    assert_eq!(
        ws.read_project_file("src/hello.py"),
        "def hello():\n    return 'hi'\n"
    );
    // No AUTO_COMMIT in the task.
    assert!(matches!(outcome.git, GitOutcome::Skipped { .. }));
    assert_eq!(ws.commit_count(), 2);

    let backup = ws
        .paths
        .backup_dir(&outcome.run_id, "demo")
        .join("src/hello.py");
    assert_eq!(
        std::fs::read_to_string(backup).expect("backup"),
        "def hello():\n    return 'hii'\n"
    );
}

/// Scenario C: an analysis-only reply changes nothing and is reported verbatim.
#[test]
fn scenario_c_analysis_only_reply() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: Review the README\nAUTO_COMMIT: yes\n");
    let analysis = "The README is accurate.\nNo changes are needed.";
    let llm = ScriptedLlm::new(&[analysis]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Completed);
    assert!(outcome.operations.is_empty());
    assert!(outcome.parse_issue.is_none());
    assert!(matches!(outcome.git, GitOutcome::Skipped { .. }));
    assert_eq!(ws.commit_count(), 1);

    let report = ws.report();
    assert!(report.contains(analysis));
    assert!(report.contains("No file operations."));
    assert!(report.contains("Skipped: the reply contained no file operations."));
}

/// Scenario D: quotes in the task text never reach the commit message.
#[test]
fn scenario_d_commit_message_ignores_task_text() {
    let ws = TestWorkspace::new("demo");
    ws.write_task(
        "PROJECT: demo\nTASK: create notes.md saying \"hello\"; rm -rf / \"$(id)\"\nAUTO_COMMIT: yes\n",
    );
    let reply = "<file_operations><operation type=\"create\" path=\"notes.md\"><content>hello\n</content></operation></file_operations>";
    let llm = ScriptedLlm::new(&[reply]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    let message = ws.git(&["log", "-1", "--format=%B"]);
    assert_eq!(message, "devflow: apply 1 file operation(s) to demo");
    assert!(!message.contains('"'));
    match &outcome.git {
        GitOutcome::Committed(record) => assert!(!record.message.contains('"')),
        other => panic!("expected commit, got {other:?}"),
    }

    let plan = CommitPlan::new("demo", vec!["notes.md".to_string()], false, "origin");
    for line in plan.command_lines() {
        assert!(!line.contains('"'), "unexpected quote in {line}");
        assert!(!line.contains("rm -rf"));
    }
}

/// Verifies a path escape fails that operation, keeps its siblings and blocks the commit.
#[test]
fn path_escape_blocks_commit() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: create ok.txt\nAUTO_COMMIT: yes\n");
    let reply = r#"<file_operations>
<operation type="create" path="ok.txt"><content>fine
</content></operation>
<operation type="create" path="../../escaped.txt"><content>nope
</content></operation>
</file_operations>"#;
    let llm = ScriptedLlm::new(&[reply]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Halted);
    assert_eq!(
        outcome.halt.as_ref().map(|h| h.kind.as_str()),
        Some("PathEscape")
    );
    assert!(outcome.operations[0].success);
    assert!(!outcome.operations[1].success);
    assert!(!ws.root().join("escaped.txt").exists());
    assert!(!ws.project_root().join("../../escaped.txt").exists());
    assert!(matches!(outcome.git, GitOutcome::Skipped { .. }));
    assert_eq!(ws.commit_count(), 1);

    let report = ws.report();
    assert!(report.contains("Created: 1 | Modified: 0 | Deleted: 0 | Errors: 1"));
    assert!(report.contains("PathEscape `../../escaped.txt`"));
}

/// Verifies applying the same MODIFY twice leaves the same tree as applying it once.
#[test]
fn repeated_modify_is_idempotent() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: update README.md with a usage line\nAUTO_COMMIT: yes\n");
    let reply = "<file_operations><operation type=\"modify\" path=\"README.md\"><content># demo\n\nUsage: run it.\n</content></operation></file_operations>";
    let llm = ScriptedLlm::new(&[reply, reply]);

    let first = run_pipeline(&ws.request(), &llm).expect("first");
    let after_first = ws.read_project_file("README.md");
    let second = run_pipeline(&ws.request(), &llm).expect("second");

    assert_eq!(ws.read_project_file("README.md"), after_first);
    assert!(matches!(first.git, GitOutcome::Committed(_)));
    assert!(!second.operations[0].changed);
    assert_eq!(
        second.operations[0].note.as_deref(),
        Some("content unchanged")
    );
    assert!(matches!(second.git, GitOutcome::Skipped { .. }));
    assert_eq!(ws.commit_count(), 2);
}

/// Verifies every operation in one block is applied, in reply order, and committed together.
#[test]
fn all_operations_in_block_are_applied_in_order() {
    let ws = TestWorkspace::new("demo");
    ws.write_project_file("old.txt", "remove me\n");
    ws.commit_all("add old");
    ws.write_task("PROJECT: demo\nTASK: tidy the project\nAUTO_COMMIT: yes\n");
    let reply = r#"Three changes.

<file_operations>
  <operation type="create" path="docs/a.md"><content># A
</content></operation>
  <operation type="modify" path="README.md"><content># demo

Tidied.
</content></operation>
  <operation type="delete" path="old.txt" />
</file_operations>
"#;
    let llm = ScriptedLlm::new(&[reply]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    let paths: Vec<&str> = outcome
        .operations
        .iter()
        .map(|r| r.operation.path.as_str())
        .collect();
    assert_eq!(paths, vec!["docs/a.md", "README.md", "old.txt"]);
    assert!(outcome.operations.iter().all(|r| r.success && r.verified));
    let counts = outcome.counts();
    assert_eq!((counts.created, counts.modified, counts.deleted), (1, 1, 1));
    assert!(!ws.project_root().join("old.txt").exists());
    assert_eq!(
        ws.git(&["log", "-1", "--format=%B"]),
        "devflow: apply 3 file operation(s) to demo"
    );
    assert_eq!(ws.git(&["status", "--porcelain"]), "");
}

/// Verifies a malformed operation block yields no writes and a reported parse issue.
#[test]
fn malformed_block_applies_nothing() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: create a.txt\nAUTO_COMMIT: yes\n");
    let reply = "<file_operations><operation type=\"rename\" path=\"a.txt\"><content>x</content></operation></file_operations>";
    let llm = ScriptedLlm::new(&[reply]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert!(outcome.operations.is_empty());
    assert!(outcome.parse_issue.is_some());
    assert!(!ws.project_root().join("a.txt").exists());
    assert!(ws.report().contains("Reply parse issue:"));
}

/// Verifies a YAML task flows through the same pipeline.
#[test]
fn yaml_task_runs_end_to_end() {
    let ws = TestWorkspace::new("demo");
    let yaml = r#"type: feature
project: demo
priority: high
description: Create src/config.py with defaults
requirements:
  files:
    - path: src/config.py
      content: module holding default settings
git_commit:
  enabled: true
  push: false
"#;
    let task_path = ws.root().join("task.yaml");
    std::fs::write(&task_path, yaml).expect("write yaml task");
    let reply = "<file_operations><operation type=\"create\" path=\"src/config.py\"><content>DEFAULTS = {}\n</content></operation></file_operations>";
    let llm = ScriptedLlm::new(&[reply]);
    let mut request = ws.request();
    request.task_path = &task_path;

    let outcome = run_pipeline(&request, &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Completed);
    assert!(matches!(outcome.git, GitOutcome::Committed(_)));
    let prompt = llm.last_prompt().expect("prompt");
    assert!(prompt.contains("module holding default settings"));
}

/// Verifies each successful call lands in the day's usage ledger.
#[test]
fn usage_ledger_records_each_call() {
    use chrono::Utc;
    use devflow::io::usage::UsageLedger;

    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: Review the README\n");
    let llm = ScriptedLlm::new(&["Fine.", "Still fine."]);

    run_pipeline(&ws.request(), &llm).expect("first");
    run_pipeline(&ws.request(), &llm).expect("second");

    let summary = UsageLedger::new(&ws.paths.usage_dir)
        .daily_summary(Utc::now().date_naive())
        .expect("summary");
    assert_eq!(summary.calls, 2);
    assert_eq!(summary.input_tokens, 2_000);
    assert_eq!(summary.output_tokens, 400);
    assert!((summary.cost_usd - 0.012).abs() < 1e-9);
}

fn big_module(lines: usize) -> String {
    let mut content = String::from("# big module\n");
    for n in 0..lines {
        content.push_str(&format!("def handler_{n}(request):\n    return respnse_{n}(request)\n"));
    }
    content.push_str("MARKER_AT_END = True\n");
    content
}

/// Verifies a MODIFY target larger than the optional context still reaches
/// the model whole, with optional sections dropped instead.
#[test]
fn large_modify_target_content_reaches_prompt() {
    let mut ws = TestWorkspace::new("demo");
    let content = big_module(600);
    ws.write_project_file("src/big.py", &content);
    ws.write_project_file("README.md", &"readme line\n".repeat(400));
    ws.commit_all("add big module");
    ws.config.context.prompt_budget_chars = content.chars().count() + 2_000;
    ws.write_task("PROJECT: demo\nTASK: fix typo in src/big.py\n");
    let llm = ScriptedLlm::new(&["Nothing to change yet."]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Completed);
    let prompt = llm.last_prompt().expect("prompt sent");
    assert!(prompt.contains(&content));
    assert!(prompt.contains("MARKER_AT_END = True"));
    let context = outcome.context.expect("context summary");
    assert!(context.dropped_sections.contains(&"readme".to_string()));
}

/// Verifies a MODIFY target that cannot fit the budget halts before the
/// model is called and leaves the file alone.
#[test]
fn modify_target_over_budget_halts_before_llm_call() {
    let ws = TestWorkspace::new("demo");
    let content = big_module(600);
    assert!(content.chars().count() > ws.config.context.prompt_budget_chars);
    ws.write_project_file("src/big.py", &content);
    ws.commit_all("add big module");
    ws.write_task("PROJECT: demo\nTASK: fix typo in src/big.py\n");
    let llm = ScriptedLlm::new(&[]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Halted);
    assert_eq!(
        outcome.halt.as_ref().map(|h| h.kind.as_str()),
        Some("PromptOverBudget")
    );
    assert_eq!(llm.calls(), 0);
    assert_eq!(ws.read_project_file("src/big.py"), content);
    assert!(ws.report().contains("PromptOverBudget"));
}

/// Verifies work the user already staged stays out of the run's commit.
#[test]
fn commit_excludes_previously_staged_files() {
    let ws = TestWorkspace::new("demo");
    ws.write_project_file("secret_wip.txt", "half done\n");
    ws.git(&["add", "secret_wip.txt"]);
    ws.write_task("PROJECT: demo\nTASK: create src/hello.py returning 'hi'\nAUTO_COMMIT: yes\n");
    let llm = ScriptedLlm::new(&[HELLO_CREATE]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    match &outcome.git {
        GitOutcome::Committed(record) => assert_eq!(record.files, vec!["src/hello.py"]),
        other => panic!("expected commit, got {other:?}"),
    }
    assert_eq!(
        ws.git(&["show", "--name-only", "--format=", "HEAD"]),
        "src/hello.py"
    );
    assert_eq!(
        ws.git(&["diff", "--cached", "--name-only"]),
        "secret_wip.txt"
    );
}

/// Verifies a create followed by a modify of the same path in one block
/// verifies cleanly and commits the final content.
#[test]
fn same_path_twice_in_one_block_commits_final_content() {
    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: create a.txt\nAUTO_COMMIT: yes\n");
    let reply = r#"<file_operations>
<operation type="create" path="a.txt"><content>a</content></operation>
<operation type="modify" path="a.txt"><content>bbbbbb</content></operation>
</file_operations>"#;
    let llm = ScriptedLlm::new(&[reply]);

    let outcome = run_pipeline(&ws.request(), &llm).expect("pipeline");

    assert_eq!(outcome.status(), RunStatus::Completed, "halt: {:?}", outcome.halt);
    assert!(outcome.operations.iter().all(|r| r.success && r.verified));
    assert_eq!(ws.read_project_file("a.txt"), "bbbbbb");
    assert!(matches!(outcome.git, GitOutcome::Committed(_)));
}

/// Verifies a missing API key halts the run at the LLM stage with a report,
/// and that task problems are reported without needing a key.
#[test]
fn missing_api_key_is_reported_as_llm_failure() {
    use devflow::io::llm::DeferredAnthropicClient;

    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        return;
    }
    let ws = TestWorkspace::new("demo");
    let client = DeferredAnthropicClient::new(&ws.config.llm, &ws.paths.env_path);

    ws.write_task("TASK: no project here\n");
    let outcome = run_pipeline(&ws.request(), &client).expect("pipeline");
    assert_eq!(
        outcome.halt.as_ref().map(|h| h.kind.as_str()),
        Some("MalformedTask")
    );
    assert!(ws.report().contains("MalformedTask"));

    ws.write_task("PROJECT: demo\nTASK: create notes.md\n");
    let outcome = run_pipeline(&ws.request(), &client).expect("pipeline");
    assert_eq!(outcome.halt.as_ref().map(|h| h.kind.as_str()), Some("LlmCall"));
    assert!(ws.report().contains("ANTHROPIC_API_KEY"));
    assert!(ws.paths.runs_dir.join(&outcome.run_id).join("meta.json").is_file());
}

/// Verifies a completed run is remembered per project and shown to the
/// model on the next run.
#[test]
fn recent_changes_feed_the_next_prompt() {
    use devflow::io::project_history::load_history;

    let ws = TestWorkspace::new("demo");
    ws.write_task("PROJECT: demo\nTASK: create src/hello.py returning 'hi'\nAUTO_COMMIT: yes\n");
    let llm = ScriptedLlm::new(&[HELLO_CREATE, "Looks good."]);

    let first = run_pipeline(&ws.request(), &llm).expect("first");
    let sha = match &first.git {
        GitOutcome::Committed(record) => record.sha.clone().expect("sha"),
        other => panic!("expected commit, got {other:?}"),
    };
    let history = load_history(&ws.paths.history_path("demo")).expect("history");
    assert_eq!(history.recent_changes.len(), 1);
    assert_eq!(history.recent_changes[0].run_id, first.run_id);
    assert_eq!(history.recent_changes[0].files, vec!["src/hello.py"]);

    ws.write_task("PROJECT: demo\nTASK: review src/hello.py\n");
    run_pipeline(&ws.request(), &llm).expect("second");

    let prompt = llm.last_prompt().expect("prompt");
    assert!(prompt.contains("## Recent devflow changes"));
    assert!(prompt.contains("create src/hello.py returning 'hi' (src/hello.py)"));
    assert!(prompt.contains(&format!("[{sha}]")));
    let history = load_history(&ws.paths.history_path("demo")).expect("history");
    assert_eq!(history.recent_changes.len(), 1);
}
