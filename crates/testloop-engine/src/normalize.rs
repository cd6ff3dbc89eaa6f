const FENCE: &str = "```";

/// Reduces a model reply to the code it carries.
///
/// A reply that opens with a fence loses the whole opening fence line
/// (language tag included) and a trailing fence. A reply with prose around a
/// single fenced block is reduced to that block. A one-line reply wrapped in
/// fences keeps the text between them. Anything else is only trimmed.
/// The result is never checked for syntax.
pub fn normalize_code(reply: &str) -> String {
    let trimmed = reply.trim();

    if let Some(rest) = trimmed.strip_prefix(FENCE) {
        let body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            // Single line: code between the fences, or a bare language tag.
            None if rest.trim_end().ends_with(FENCE) => rest,
            None => "",
        };
        let body = body.trim_end();
        let body = body.strip_suffix(FENCE).unwrap_or(body);
        return body.trim().to_string();
    }

    if let Some(block) = embedded_block(trimmed) {
        return block.trim().to_string();
    }

    let body = trimmed.strip_suffix(FENCE).unwrap_or(trimmed);
    body.trim().to_string()
}

fn embedded_block(text: &str) -> Option<&str> {
    let open = text.find(&format!("\n{FENCE}"))? + 1;
    let after_open = &text[open + FENCE.len()..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find(FENCE)?;
    Some(&body[..close])
}
