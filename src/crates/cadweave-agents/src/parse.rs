//! Response text cleanup shared by the adapters

/// Strip surrounding markdown code fences, if present
///
/// Models frequently wrap JSON or scripts in ``` fences despite being
/// asked not to; take the content of the first fenced block when one
/// exists, otherwise return the trimmed input.
pub(crate) fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}

/// Extract the outermost JSON object from free-form model output
pub(crate) fn extract_json_object(text: &str) -> Option<String> {
    let cleaned = strip_code_fences(text);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(cleaned[start..=end].to_string())
}
