//! JSON object extraction from model replies.
//!
//! Models wrap structured output in markdown fences or surround it with
//! prose. Strategies, in order:
//! 1. ```` ```json ```` fenced block
//! 2. Any fenced block containing an object
//! 3. Content that is itself an object
//! 4. The largest valid object anywhere, preferring later ones

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated ({unclosed_braces} unclosed braces): {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Index of the `}` closing the object that starts at `s[0]`.
///
/// Braces inside string literals (including escaped quotes) are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

fn is_object(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(candidate),
        Ok(serde_json::Value::Object(_))
    )
}

fn object_at_start(s: &str) -> Option<String> {
    let end = find_matching_brace(s)?;
    let candidate = &s[..=end];
    is_object(candidate).then(|| candidate.to_string())
}

fn from_fenced_block(content: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let found = re.captures_iter(content).find_map(|caps| {
        let block = caps.get(1)?.as_str().trim();
        let start = block.find('{')?;
        object_at_start(&block[start..])
    });
    found
}

/// Largest valid object in `content`; on equal size the later one wins.
fn largest_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| object_at_start(&content[start..]).map(|json| (start, json)))
        .max_by(|(a_start, a), (b_start, b)| a.len().cmp(&b.len()).then(a_start.cmp(b_start)))
        .map(|(_, json)| json)
}

/// Extracts a JSON object from a model reply.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(json) = from_fenced_block(trimmed, r"```json\s*\n?([\s\S]*?)\n?```") {
        return Ok(json);
    }
    if let Some(json) = from_fenced_block(trimmed, r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```") {
        return Ok(json);
    }
    if trimmed.starts_with('{') {
        if let Some(json) = object_at_start(trimmed) {
            return Ok(json);
        }
    }
    if let Some(json) = largest_object(trimmed) {
        return Ok(json);
    }

    if let Some(start) = trimmed.find('{') {
        let partial = &trimmed[start..];
        let unclosed = unclosed_braces(partial);
        if unclosed > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: partial.chars().take(100).collect(),
                unclosed_braces: unclosed,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(50).collect(),
    })
}
