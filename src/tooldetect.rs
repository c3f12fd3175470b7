use axum::http::HeaderMap;

/// Ordered User-Agent substring patterns. First match wins.
const UA_PATTERNS: &[(&str, &str)] = &[
    ("cursor", "cursor"),
    ("claude-code", "claude-code"),
    ("codex-cli", "codex-cli"),
    ("continue", "continue"),
    ("copilot", "copilot"),
    ("openai-python", "openai-sdk"),
    ("openai-node", "openai-sdk"),
    ("anthropic-python", "anthropic-sdk"),
    ("anthropic-typescript", "anthropic-sdk"),
];

/// Maps inbound headers to a canonical client-tool identifier.
/// An explicit `X-Client-Name` header wins over User-Agent sniffing.
pub fn detect_tool(headers: &HeaderMap) -> String {
    if let Some(name) = headers
        .get("x-client-name")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
    {
        return name;
    }

    let ua = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase())
        .unwrap_or_default();

    for (pattern, name) in UA_PATTERNS {
        if ua.contains(pattern) {
            return (*name).to_string();
        }
    }

    "unknown".to_string()
}
