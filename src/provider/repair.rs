//! Malformed JSON repair for structured model output.
//!
//! Models asked for JSON routinely return almost-JSON: fenced blocks,
//! `//` commentary, bare dates, trailing commas, or output that simply
//! stops mid-structure. Repair is a fixed, ordered list of independent
//! textual transforms followed by a structural balancing pass. Each
//! transform is a plain function over the text, individually unit tested,
//! and fires only on the pattern it owns; the order is declared once in
//! [`REPAIRS`].
//!
//! Repair runs only after a direct parse of the fence-stripped text has
//! failed, and the result must itself parse or the original parse error
//! is reported. Truncated output (finish reason `length`) never reaches
//! this module; the executor raises that as its own terminal error.

use tracing::debug;

use crate::error::CallError;

/// The ordered repair pipeline. Balancing runs after these.
pub const REPAIRS: &[(&str, fn(&str) -> String)] = &[
    ("strip_line_comments", strip_line_comments),
    ("unescape_stray_quotes", unescape_stray_quotes),
    ("quote_bare_dates", quote_bare_dates),
    ("fix_zero_prefixed_numbers", fix_zero_prefixed_numbers),
    ("remove_trailing_commas", remove_trailing_commas),
];

/// Pull the JSON payload out of a fenced or chatty response.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();

    // Check for ```json ... ``` fences.
    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return after_fence[..end].trim();
        }
    }

    // Check for ``` ... ``` fences (no language tag).
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            return after_fence[..end].trim();
        }
    }

    // Outermost object or array boundaries, whichever opens first.
    let mut best: Option<(usize, usize)> = None;
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = trimmed.find(open)
            && let Some(end) = trimmed.rfind(close)
            && end > start
            && best.is_none_or(|(s, _)| start < s)
        {
            best = Some((start, end));
        }
    }
    if let Some((start, end)) = best {
        return &trimmed[start..=end];
    }

    trimmed
}

/// Parse structured output, repairing once if the direct parse fails.
///
/// # Errors
/// Returns [`CallError::MalformedJson`] carrying the ORIGINAL parse error
/// when even the repaired text does not parse.
pub fn parse_structured(raw: &str) -> Result<serde_json::Value, CallError> {
    let stripped = strip_code_fences(raw);
    let first_err = match serde_json::from_str(stripped) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let (repaired, applied) = repair_with_log(stripped);
    match serde_json::from_str(&repaired) {
        Ok(value) => {
            debug!(repairs = ?applied, "parsed structured output after repair");
            Ok(value)
        }
        Err(_) => Err(CallError::MalformedJson(first_err.to_string())),
    }
}

/// Apply every transform in order, then balance quotes and brackets.
pub fn repair(input: &str) -> String {
    repair_with_log(input).0
}

fn repair_with_log(input: &str) -> (String, Vec<&'static str>) {
    let mut text = input.to_owned();
    let mut applied = Vec::new();
    for (name, transform) in REPAIRS {
        let next = transform(&text);
        if next != text {
            applied.push(*name);
            text = next;
        }
    }
    let balanced = balance_structure(&text);
    if balanced != text {
        applied.push("balance_structure");
        text = balanced;
    }
    (text, applied)
}

/// Remove `//` line comments outside string literals.
fn strip_line_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Drop to end of line, keeping the newline itself.
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Undo wholesale quote escaping (`{\"key\": \"value\"}`).
///
/// Fires only when an escaped quote sits in a structural position (right
/// after `{`, `[`, `,` or `:`), which means the model escaped the quotes
/// that delimit keys and values, not a quote inside prose.
fn unescape_stray_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut structural = false;
    for i in 0..bytes.len().saturating_sub(1) {
        if bytes[i] == b'\\' && bytes[i + 1] == b'"' {
            let mut j = i;
            while j > 0 && bytes[j - 1].is_ascii_whitespace() {
                j -= 1;
            }
            if j == 0 || matches!(bytes[j - 1], b'{' | b'[' | b',' | b':') {
                structural = true;
                break;
            }
        }
    }
    if structural {
        input.replace("\\\"", "\"")
    } else {
        input.to_owned()
    }
}

/// Wrap bare ISO-8601 date/datetime value tokens in quotes.
fn quote_bare_dates(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c.is_ascii_digit()
            && value_position(&out)
            && let Some(len) = match_bare_date(&bytes[i..])
        {
            out.push('"');
            out.push_str(&input[i..i + len]);
            out.push('"');
            i += len;
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// True when the next token would be a JSON value.
fn value_position(emitted: &str) -> bool {
    matches!(emitted.trim_end().chars().last(), Some(':' | ',' | '['))
}

/// Length of a leading `YYYY-MM-DD` (optionally `Thh:mm:ss...`) token
/// that ends at a value delimiter.
fn match_bare_date(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 10 {
        return None;
    }
    let date_shape = bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit);
    if !date_shape {
        return None;
    }
    let mut len = 10;
    if bytes.get(len) == Some(&b'T') {
        len += 1;
        while bytes
            .get(len)
            .is_some_and(|b| b.is_ascii_digit() || matches!(b, b':' | b'.' | b'+' | b'-' | b'Z'))
        {
            len += 1;
        }
    }
    match bytes.get(len) {
        None => Some(len),
        Some(b) if matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace() => Some(len),
        Some(_) => None,
    }
}

/// Insert the missing decimal point in zero-prefixed numeric literals
/// (`"confidence": 075` becomes `0.75`).
fn fix_zero_prefixed_numbers(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len() + 4);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == '0' && number_position(&out) {
            let mut j = i + 1;
            while bytes.get(j).is_some_and(u8::is_ascii_digit) {
                j += 1;
            }
            // More digits after the leading zero and no decimal point:
            // JSON forbids the leading zero, so restore the intended one.
            if j > i + 1 && bytes.get(j) != Some(&b'.') {
                out.push_str("0.");
                out.push_str(&input[i + 1..j]);
                i = j;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Like [`value_position`] but also accepts a minus sign already emitted.
fn number_position(emitted: &str) -> bool {
    let trimmed = emitted.trim_end();
    match trimmed.chars().last() {
        Some(':' | ',' | '[') => true,
        Some('-') => value_position(&trimmed[..trimmed.len() - 1]),
        _ => false,
    }
}

/// Drop commas that sit directly before `}` or `]`.
fn remove_trailing_commas(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            let mut j = i + 1;
            while bytes.get(j).is_some_and(u8::is_ascii_whitespace) {
                j += 1;
            }
            if matches!(bytes.get(j), Some(b'}') | Some(b']')) {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Close an odd quote, then append closers for unmatched `{` / `[` in
/// proper nesting order.
fn balance_structure(input: &str) -> String {
    let mut out = input.trim_end().to_owned();

    let mut quotes = 0usize;
    let mut escaped = false;
    for c in out.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quotes += 1;
        }
    }
    if quotes % 2 == 1 {
        out.push('"');
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(c),
            '}' if stack.last() == Some(&'{') => {
                stack.pop();
            }
            ']' if stack.last() == Some(&'[') => {
                stack.pop();
            }
            _ => {}
        }
    }
    while let Some(open) = stack.pop() {
        out.push(if open == '{' { '}' } else { ']' });
    }
    out
}
