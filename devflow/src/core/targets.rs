//! Discovery of file paths mentioned in free task text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9+.-]*://\S+").expect("valid url regex"));

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./\\-]+").expect("valid token regex"));

/// Extensions accepted for bare file names (tokens without a directory part).
const KNOWN_EXTENSIONS: &[&str] = &[
    "c", "cfg", "cpp", "css", "go", "h", "html", "ini", "java", "js", "json", "jsx", "md", "py",
    "rs", "sh", "sql", "toml", "ts", "tsx", "txt", "xml", "yaml", "yml",
];

/// Extract relative file paths mentioned in `text`, first occurrence order.
///
/// A token counts when it has a file extension and either contains a directory
/// separator or uses a known source/doc extension. URLs, absolute paths and
/// paths climbing with `..` are ignored.
pub fn extract_target_paths(text: &str) -> Vec<String> {
    let without_urls = URL_RE.replace_all(text, " ");
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for token in TOKEN_RE.find_iter(&without_urls) {
        let Some(path) = normalize_token(token.as_str()) else {
            continue;
        };
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    paths
}

fn normalize_token(raw: &str) -> Option<String> {
    let mut token = raw.replace('\\', "/");
    while token.ends_with(['.', '-', '/']) {
        token.pop();
    }
    let token = token.strip_prefix("./").unwrap_or(&token).to_string();
    if token.is_empty() || token.starts_with('/') {
        return None;
    }
    if token.split('/').any(|part| part == ".." || part.is_empty()) {
        return None;
    }
    let file_name = token.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() && !token.contains('/') {
        return None;
    }
    if ext.is_empty() || !ext.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    if !token.contains('/') && !KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_paths_with_directories_and_known_extensions() {
        let paths = extract_target_paths("Fix src/hello.py and update config.py.");
        assert_eq!(paths, vec!["src/hello.py", "config.py"]);
    }

    #[test]
    fn ignores_urls_versions_and_abbreviations() {
        let paths = extract_target_paths(
            "See https://example.com/docs/page.html, bump to 1.2.3, e.g. keep README.md",
        );
        assert_eq!(paths, vec!["README.md"]);
    }

    #[test]
    fn dedupes_and_drops_escaping_paths() {
        let paths = extract_target_paths("`lib/a.rs` then lib/a.rs again, not ../secret.txt or /etc/hosts.txt");
        assert_eq!(paths, vec!["lib/a.rs"]);
    }
}
