//! Commit planning: message and argument vectors, built without task text.

use serde::Serialize;

/// Everything needed to stage, commit and optionally push one run's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitPlan {
    pub message: String,
    /// Paths relative to the project root, in operation order.
    pub files: Vec<String>,
    pub push: bool,
    pub remote: String,
}

impl CommitPlan {
    pub fn new(project: &str, files: Vec<String>, push: bool, remote: &str) -> Self {
        Self {
            message: commit_message(project, files.len()),
            files,
            push,
            remote: remote.to_string(),
        }
    }

    pub fn add_args(&self) -> Vec<String> {
        let mut args = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
        args.extend(self.files.iter().cloned());
        args
    }

    /// Commits only the plan's paths; anything else already in the index
    /// stays staged and out of this commit.
    pub fn commit_args(&self) -> Vec<String> {
        let mut args = vec![
            "commit".to_string(),
            "--only".to_string(),
            "-m".to_string(),
            self.message.clone(),
            "--".to_string(),
        ];
        args.extend(self.files.iter().cloned());
        args
    }

    pub fn staged_check_args(&self) -> Vec<String> {
        let mut args = vec![
            "diff".to_string(),
            "--cached".to_string(),
            "--name-only".to_string(),
            "--".to_string(),
        ];
        args.extend(self.files.iter().cloned());
        args
    }

    pub fn push_args(&self) -> Option<Vec<String>> {
        self.push
            .then(|| vec!["push".to_string(), self.remote.clone()])
    }

    /// Printable `git ...` lines with every argument quoted.
    pub fn command_lines(&self) -> Vec<String> {
        let mut lines = vec![render_command(&self.add_args()), render_command(&self.commit_args())];
        if let Some(push) = self.push_args() {
            lines.push(render_command(&push));
        }
        lines
    }
}

/// `devflow: apply <n> file operation(s) to <project>`.
///
/// Only the operation count and the project id go in; the id is filtered to
/// identifier characters even though the task parser already validated it.
pub fn commit_message(project: &str, op_count: usize) -> String {
    let project: String = project
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    format!("devflow: apply {op_count} file operation(s) to {project}")
}

fn render_command(args: &[String]) -> String {
    let mut line = String::from("git");
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// POSIX single-quote an argument.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
