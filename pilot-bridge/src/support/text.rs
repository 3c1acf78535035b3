/// Truncates to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

pub fn prefix_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Splits text into chunks of at most `limit` characters, preferring to break
/// at a newline, then at a space. The separator at a break is dropped.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some((end, next)) = rest.char_indices().nth(limit) else {
            chunks.push(rest.to_string());
            break;
        };
        let window = &rest[..end];
        // A separator right after the window still counts as a break point.
        let lookahead = &rest[..end + next.len_utf8()];
        let split = lookahead
            .rfind('\n')
            .filter(|pos| *pos > 0)
            .or_else(|| lookahead.rfind(' ').filter(|pos| *pos > 0));
        match split {
            Some(pos) => {
                chunks.push(window[..pos].to_string());
                rest = &rest[pos + 1..];
            }
            None => {
                chunks.push(window.to_string());
                rest = &rest[end..];
            }
        }
    }
    chunks
}

/// Renders scalar tool inputs as `key: value` pairs; nested values are skipped.
pub fn format_input_summary(input: &serde_json::Map<String, serde_json::Value>) -> String {
    input
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => "null".to_string(),
                _ => return None,
            };
            Some(format!("{key}: {rendered}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
