//! Char-boundary safe text helpers.

/// Return at most `max_chars` characters of `text` and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

/// Short single-string preview with an ellipsis marker when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let (head, cut) = truncate_chars(text, max_chars);
    if cut {
        format!("{head}...")
    } else {
        head.to_string()
    }
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}
