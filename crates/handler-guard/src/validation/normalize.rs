//! Decode and normalize passes applied before pattern matching.
//!
//! Attack strings are routinely hidden behind percent-encoding (often applied
//! more than once), HTML entities, JSON `\uXXXX` escapes, compatibility
//! Unicode forms (fullwidth `＜script＞`) and embedded control characters.
//! Every pass here undoes one of those layers.

use std::borrow::Cow;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

/// Maximum percent-decoding passes per normalization
pub const MAX_PERCENT_PASSES: usize = 3;

/// Maximum HTML entity decoding passes per normalization
pub const MAX_ENTITY_PASSES: usize = 3;

static HTML_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
        .expect("invalid html entity pattern")
});

static UNICODE_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\[uU]([0-9a-fA-F]{4})").expect("invalid unicode escape pattern")
});

/// Percent-decode until stable or `MAX_PERCENT_PASSES` is reached.
///
/// Invalid UTF-8 sequences decode lossily.
pub fn percent_decode_repeated(input: &str) -> Cow<'_, str> {
    let mut current: Cow<'_, str> = Cow::Borrowed(input);
    for _ in 0..MAX_PERCENT_PASSES {
        if !current.contains('%') {
            break;
        }
        let decoded = percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if decoded == *current {
            break;
        }
        current = Cow::Owned(decoded);
    }
    current
}

/// Decode named, decimal and hex HTML entities in one pass.
///
/// Unknown names and invalid code points are left untouched.
pub fn decode_html_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }
    HTML_ENTITY.replace_all(input, |caps: &Captures<'_>| {
        let body = &caps[1];
        let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = body.strip_prefix('#') {
            dec.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            named_entity(body)
        };
        match decoded {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    })
}

/// Entity-decode until stable or `MAX_ENTITY_PASSES` is reached.
pub fn decode_html_entities_repeated(input: &str) -> Cow<'_, str> {
    let mut current: Cow<'_, str> = Cow::Borrowed(input);
    for _ in 0..MAX_ENTITY_PASSES {
        let decoded = match decode_html_entities(&current) {
            Cow::Borrowed(_) => break,
            Cow::Owned(decoded) => decoded,
        };
        if decoded == *current {
            break;
        }
        current = Cow::Owned(decoded);
    }
    current
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name.to_ascii_lowercase().as_str() {
        "lt" => '<',
        "gt" => '>',
        "amp" => '&',
        "quot" => '"',
        "apos" => '\'',
        "sol" => '/',
        "bsol" => '\\',
        "colon" => ':',
        "semi" => ';',
        "lpar" => '(',
        "rpar" => ')',
        "equals" => '=',
        "grave" => '`',
        "nbsp" => '\u{a0}',
        "tab" => '\t',
        "newline" => '\n',
        _ => return None,
    };
    Some(c)
}

/// Decode JSON-style `\uXXXX` escapes; lone surrogates stay encoded.
pub fn decode_unicode_escapes(input: &str) -> Cow<'_, str> {
    if !input.contains('\\') {
        return Cow::Borrowed(input);
    }
    UNICODE_ESCAPE.replace_all(input, |caps: &Captures<'_>| {
        u32::from_str_radix(&caps[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_else(|| caps[0].to_string())
    })
}

/// Unicode NFKC normalization
pub fn nfkc(input: &str) -> String {
    input.nfkc().collect()
}

/// Remove control characters except tab, line feed and carriage return.
pub fn strip_control_chars(input: &str) -> Cow<'_, str> {
    if !input.chars().any(is_stripped_control) {
        return Cow::Borrowed(input);
    }
    Cow::Owned(input.chars().filter(|c| !is_stripped_control(*c)).collect())
}

fn is_stripped_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

/// One full decode and normalize pass, in a fixed order.
pub fn normalize(input: &str) -> String {
    let decoded = percent_decode_repeated(input);
    let decoded = decode_html_entities_repeated(&decoded);
    let decoded = decode_unicode_escapes(&decoded);
    let normalized = nfkc(&decoded);
    strip_control_chars(&normalized).into_owned()
}
