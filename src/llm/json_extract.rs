//! Pulls one JSON value out of an LLM completion that may wrap it in
//! prose, a ```json fenced block, or both.

/// Extract the first balanced JSON object or array found in `text`.
///
/// Strategy: prefer a fenced code block (```json ... ``` or ``` ... ```) if
/// present; otherwise scan for the first `{` or `[` and walk forward,
/// tracking brace/bracket depth while respecting string escapes, until the
/// opening token's match closes. Returns `None` if nothing balances.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Some(fenced) = extract_fenced(text) {
        if let Ok(value) = serde_json::from_str(&fenced) {
            return Some(value);
        }
    }

    let candidate = extract_balanced(text)?;
    serde_json::from_str(&candidate).ok()
}

fn extract_fenced(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let after_fence = after_fence.strip_prefix('\n').unwrap_or(after_fence);
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim().to_string())
}

fn extract_balanced(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let start = bytes.iter().position(|&c| c == '{' || c == '[')?;
    let open = bytes[start];
    let close = if open == '{' { '}' } else { ']' };

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &ch) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(bytes[start..end].iter().collect());
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_object() {
        let text = r#"{"foo": "bar", "n": 1}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["foo"], "bar");
    }

    #[test]
    fn extracts_from_prose_prefix() {
        let text = "Sure, here is the plan:\n{\"steps\": [1, 2, 3]}\nLet me know if that works.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["steps"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn extracts_from_fenced_block() {
        let text = "```json\n{\"ok\": true}\n```";
        let value = extract_json(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let text = r#"{"message": "contains a } brace and a { brace"}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["message"], "contains a } brace and a { brace");
    }

    #[test]
    fn extracts_array_root() {
        let text = "prefix [1, 2, {\"a\": \"b\"}] suffix";
        let value = extract_json(text).unwrap();
        assert_eq!(value, serde_json::json!([1, 2, {"a": "b"}]));
    }

    #[test]
    fn returns_none_when_nothing_balances() {
        assert!(extract_json("no json here, just words {unbalanced").is_none());
    }
}
