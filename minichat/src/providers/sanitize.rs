//! Turn failed HTTP responses into presentable error messages: pick the
//! message out of the body, scrub secret-like tokens and cap the length.

use super::ProviderError;

const MAX_API_ERROR_CHARS: usize = 200;

/// Prefixes of credentials that must never be echoed back: OpenAI-style keys
/// and the JWTs MiniMax issues as API keys.
const SECRET_PREFIXES: [&str; 2] = ["sk-", "eyJ"];

/// Shortest body after the prefix that is treated as a credential. Real keys
/// are far longer; shorter runs are ordinary words like `sk-learn`.
const MIN_SECRET_BODY_CHARS: usize = 16;

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

/// Byte range of the first credential-looking token at or after `from`.
fn find_secret(input: &str, from: usize) -> Option<(usize, usize)> {
    let mut pos = from;
    loop {
        let (start, prefix) = SECRET_PREFIXES
            .iter()
            .filter_map(|p| input[pos..].find(p).map(|i| (pos + i, *p)))
            .min_by_key(|(i, _)| *i)?;
        let body_start = start + prefix.len();
        let body_len = input[body_start..].chars().take_while(|c| is_secret_char(*c)).count();
        let at_boundary = !input[..start].chars().next_back().is_some_and(is_secret_char);

        if at_boundary && body_len >= MIN_SECRET_BODY_CHARS {
            // Secret chars are ASCII, so chars == bytes here.
            return Some((start, body_start + body_len));
        }
        pos = body_start;
    }
}

/// Replace credential-looking tokens with `[REDACTED]`. Only whole tokens
/// that start at a word boundary and are long enough to be a key qualify.
pub fn scrub_secret_patterns(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while let Some((start, end)) = find_secret(input, pos) {
        out.push_str(&input[pos..start]);
        out.push_str("[REDACTED]");
        pos = end;
    }
    out.push_str(&input[pos..]);
    out
}

/// Scrub secrets and truncate to a displayable length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let end = scrubbed
        .char_indices()
        .nth(MAX_API_ERROR_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(scrubbed.len());

    format!("{}...", &scrubbed[..end])
}

/// Best-effort message from an error body: `error.message`, then `message`,
/// else a synthesized `API Error: <status>`.
pub fn error_message(status: u16, body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        fn non_empty(m: Option<&serde_json::Value>) -> Option<&str> {
            m.and_then(|m| m.as_str()).filter(|m| !m.is_empty())
        }
        non_empty(v.pointer("/error/message")).or_else(|| non_empty(v.get("message")))
    });
    match message {
        Some(m) => sanitize_api_error(m),
        None => format!("API Error: {}", status),
    }
}

/// Build the classified error for a non-2xx response.
pub fn error_from_response(status: u16, body: &str) -> ProviderError {
    ProviderError::from_status(status, error_message(status, body))
}
