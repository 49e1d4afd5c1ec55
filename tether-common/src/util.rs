//! Shared utilities.

use std::borrow::Cow;

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(word))
}

/// Join words into one POSIX shell command line.
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| shell_quote(word.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shorten `text` to at most `max` characters for log lines.
pub fn truncate_for_log(text: &str, max: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max) {
        Some((idx, _)) => Cow::Owned(format!("{}...", &text[..idx])),
        None => Cow::Borrowed(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_only_when_needed() {
        assert_eq!(shell_join(["croslog", "--quiet"]), "croslog --quiet");
        assert_eq!(shell_join(["echo", "a b"]), "echo 'a b'");
        assert_eq!(shell_join(["echo", "it's"]), "echo 'it'\\''s'");
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        assert_eq!(truncate_for_log("ééé", 2), "éé...");
    }
}
