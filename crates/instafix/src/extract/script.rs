//! Embedded-script strategy.
//!
//! The embed page ships the post as a JSON document serialized into a
//! JavaScript string literal on a single line of inline script. We find that
//! line, walk its string literals, unescape the one mentioning the media key
//! and read `gql_data` out of it.

use async_trait::async_trait;
use serde_json::Value;

use super::{gql, ExtractError, Extraction, ExtractionContext, ExtractionStrategy};

/// Key whose presence marks the payload line and literal.
pub const PAYLOAD_MARKER: &str = "shortcode_media";

pub struct EmbeddedScript;

#[async_trait]
impl ExtractionStrategy for EmbeddedScript {
    fn name(&self) -> &'static str {
        "embedded_script"
    }

    async fn attempt(&self, ctx: &ExtractionContext<'_>) -> Result<Extraction, ExtractError> {
        let payload = find_payload(ctx.document)?;
        let value: Value = serde_json::from_str(&payload)
            .map_err(|e| ExtractError::Malformed(format!("embedded payload: {e}")))?;
        let gql_data = value.get("gql_data").unwrap_or(&Value::Null);
        gql::parse_post(gql_data, ctx.post_id).map(Extraction::Resolved)
    }
}

/// Locate and unescape the JSON payload inside the embed document.
pub fn find_payload(document: &str) -> Result<String, ExtractError> {
    let line = document
        .lines()
        .find(|line| line.contains(PAYLOAD_MARKER))
        .ok_or(ExtractError::MarkerMissing(PAYLOAD_MARKER))?;

    // Drop the opening `<script ...>` tag.
    let script = match line.find('>') {
        Some(i) => &line[i + 1..],
        None => line,
    };

    let literal = StringLiterals::new(script)
        .find(|lit| lit.contains(PAYLOAD_MARKER))
        .ok_or(ExtractError::NoPayload)?;
    Ok(unescape_js(literal))
}

/// Iterator over the raw bodies (quotes stripped, escapes intact) of the
/// string literals in a fragment of JavaScript.
struct StringLiterals<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> StringLiterals<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }
}

impl<'a> Iterator for StringLiterals<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.src.as_bytes();
        let start = (self.pos..bytes.len()).find(|&i| matches!(bytes[i], b'"' | b'\'' | b'`'))?;
        let quote = bytes[start];

        let mut i = start + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b if b == quote => {
                    self.pos = i + 1;
                    return Some(&self.src[start + 1..i]);
                }
                _ => i += 1,
            }
        }
        // Unterminated literal: nothing more to find.
        self.pos = bytes.len();
        None
    }
}

/// Resolve JavaScript string escapes.
///
/// Unknown escapes yield the escaped character itself, as JS does. Lone
/// surrogates become U+FFFD.
pub fn unescape_js(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            break;
        };
        match esc {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0C}'),
            'v' => out.push('\u{0B}'),
            '0' if !chars.peek().is_some_and(char::is_ascii_digit) => out.push('\0'),
            // Line continuation.
            '\n' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            'x' => match take_hex(&mut chars, 2) {
                Some(code) => out.push(char::from_u32(code).unwrap_or('\u{FFFD}')),
                None => out.push('x'),
            },
            'u' => out.push(read_unicode_escape(&mut chars)),
            other => out.push(other),
        }
    }
    out
}

type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn take_hex(chars: &mut Chars<'_>, n: usize) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..n {
        let digit = chars.peek()?.to_digit(16)?;
        chars.next();
        value = value * 16 + digit;
    }
    Some(value)
}

fn read_unicode_escape(chars: &mut Chars<'_>) -> char {
    // \u{XXXXXX}
    if chars.peek() == Some(&'{') {
        chars.next();
        let mut value = 0u32;
        for c in chars.by_ref() {
            if c == '}' {
                return char::from_u32(value).unwrap_or('\u{FFFD}');
            }
            match c.to_digit(16) {
                Some(d) => value = value.saturating_mul(16).saturating_add(d),
                None => return '\u{FFFD}',
            }
        }
        return '\u{FFFD}';
    }

    let Some(high) = take_hex(chars, 4) else {
        return '\u{FFFD}';
    };
    if !(0xD800..0xDC00).contains(&high) {
        return char::from_u32(high).unwrap_or('\u{FFFD}');
    }

    // High surrogate: expect a `\uDC00..=\uDFFF` partner.
    let mut lookahead = chars.clone();
    if lookahead.next() == Some('\\') && lookahead.next() == Some('u') {
        if let Some(low) = take_hex(&mut lookahead, 4) {
            if (0xDC00..0xE000).contains(&low) {
                *chars = lookahead;
                let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return char::from_u32(code).unwrap_or('\u{FFFD}');
            }
        }
    }
    '\u{FFFD}'
}
