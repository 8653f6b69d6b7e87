//! String sanitation.
//!
//! `sanitize_string` decodes and normalizes its input, then strips script
//! blocks, dangerous embed tags, event-handler attributes, script-capable URI
//! schemes and a bounded set of SQL injection shapes. Rounds repeat until one
//! leaves the string unchanged, so `sanitize(sanitize(s)) == sanitize(s)`.
//! Input still changing after `MAX_ROUNDS` is layered beyond any legitimate
//! use and is dropped to the empty string, itself a fixpoint.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::validation::normalize::normalize;

/// Upper bound on decode/strip rounds before the input is dropped
pub const MAX_ROUNDS: usize = 32;

pub(crate) const EVENT_HANDLERS: &str = "load|error|click|dblclick|mouse[a-z]*|key[a-z]*|focus[a-z]*|blur|change|submit|reset|select|input|abort|unload|beforeunload|resize|scroll|drag[a-z]*|drop|wheel|pointer[a-z]*|touch[a-z]*|animation[a-z]*|transition[a-z]*|toggle|copy|cut|paste|contextmenu|message|hashchange|popstate|pageshow|pagehide|storage|show|begin|end|start|finish";

pub(crate) const EMBED_TAGS: &str = "iframe|object|embed|applet|frameset|frame|base|meta";

static STRIP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Script blocks, then any stray opening or closing script tag
        r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>".to_string(),
        r"(?i)<\s*/?\s*script\b[^>]*>?".to_string(),
        format!(r"(?i)<\s*/?\s*(?:{EMBED_TAGS})\b[^>]*>?"),
        format!(r#"(?i)\bon(?:{EVENT_HANDLERS})\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]*)"#),
        r"(?i)\b(?:javascript|vbscript|livescript)\s*:".to_string(),
        r"(?i)\bdata\s*:\s*text/html[^,]*,?".to_string(),
        r"(?i)\bexpression\s*\(".to_string(),
        // SQL keyword followed by a suspicious clause
        r"(?i)\bunion\s+(?:all\s+)?select\b".to_string(),
        r"(?i)\b(?:drop|truncate|alter)\s+(?:table|database|schema)\b".to_string(),
        r"(?i)\binsert\s+into\s+\w+\s*(?:\(|values\b|select\b)".to_string(),
        r"(?i)\bdelete\s+from\s+\w+\s*(?:where\b|;)".to_string(),
        r"(?i)\bupdate\s+\w+\s+set\s+\w+\s*=".to_string(),
        r"(?i)'\s*(?:or|and)\s+'?\w+'?\s*=\s*'?\w+'?".to_string(),
        r"(?i)\bexec(?:ute)?\s+(?:xp|sp)_\w+".to_string(),
        r"(?i)\b(?:pg_sleep|sleep|benchmark)\s*\(".to_string(),
        r"(?i)\bwaitfor\s+delay\b".to_string(),
        r";\s*--".to_string(),
        r"/\*.*?\*/".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid sanitize pattern"))
    .collect()
});

/// Decode, normalize and strip one round.
fn sanitize_round(input: &str) -> String {
    let mut out = normalize(input);
    for pattern in STRIP_PATTERNS.iter() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, "").into_owned();
        }
    }
    out.trim().to_string()
}

/// Sanitize a single string to a fixpoint.
pub fn sanitize_string(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_ROUNDS {
        let next = sanitize_round(&current);
        if next == current {
            return current;
        }
        current = next;
    }
    tracing::warn!(
        input_len = input.len(),
        rounds = MAX_ROUNDS,
        "Sanitizer did not converge, dropping value"
    );
    String::new()
}

/// Sanitize every string in a JSON tree in place. Keys are left as-is.
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let cleaned = sanitize_string(s);
            if cleaned != *s {
                *s = cleaned;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => map.values_mut().for_each(sanitize_value),
        _ => {}
    }
}
