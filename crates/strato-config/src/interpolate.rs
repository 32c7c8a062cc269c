use std::collections::HashMap;

/// Expand `$name`, `${name}` and `${name:-default}` against a substitution
/// map. Unresolved names expand to the empty string; `$$` escapes to a
/// literal `$`. A lone trailing `$` is kept as-is.
pub fn interpolate(text: &str, substitutions: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                let start = *start;
                let rest = &text[start + 1..];
                match rest.find('}') {
                    Some(end) => {
                        let inner = &rest[..end];
                        out.push_str(&resolve(inner, substitutions));
                        // skip past the closing brace
                        while let Some((i, _)) = chars.next() {
                            if i == start + end + 1 {
                                break;
                            }
                        }
                    }
                    None => {
                        // unterminated ${ — keep the text verbatim
                        out.push_str(&text[idx..]);
                        break;
                    }
                }
            }
            Some((start, ch)) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let start = *start;
                let mut end = text.len();
                for (i, ch) in text[start..].char_indices() {
                    if !(ch.is_ascii_alphanumeric() || ch == '_') {
                        end = start + i;
                        break;
                    }
                }
                let name = &text[start..end];
                out.push_str(substitutions.get(name).map(String::as_str).unwrap_or(""));
                while let Some((i, _)) = chars.peek() {
                    if *i >= end {
                        break;
                    }
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Resolve the inside of a `${...}` expansion, honouring `:-default`.
fn resolve(inner: &str, substitutions: &HashMap<String, String>) -> String {
    match inner.split_once(":-") {
        Some((name, default)) => substitutions
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.to_string()),
        None => substitutions.get(inner).cloned().unwrap_or_default(),
    }
}
