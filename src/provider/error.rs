//! Provider error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API key for {vendor}")]
    MissingApiKey { vendor: &'static str },

    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("request timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Format an API error body for display, mining the JSON `error.message`
/// field when one is present.
///
/// `"HTTP 429: {"error":{"message":"slow down"}}"` becomes
/// `"HTTP 429: slow down"`; plain text passes through unchanged.
#[must_use]
pub fn format_api_error(error: &str) -> String {
    if let Some(json_start) = error.find('{') {
        let json_str = &error[json_start..];
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str)
            && let Some(msg) = extract_error_message(&json)
        {
            let prefix = error[..json_start].trim();
            if prefix.is_empty() {
                return msg;
            }
            return format!("{prefix} {msg}");
        }
    }
    error.to_string()
}

fn extract_error_message(json: &serde_json::Value) -> Option<String> {
    if let Some(error_obj) = json.get("error") {
        if let Some(msg) = error_obj.get("message").and_then(|v| v.as_str()) {
            let mut result = msg.to_string();
            if let Some(code) = error_obj.get("code").and_then(|v| v.as_str()) {
                result = format!("{result} (code: {code})");
            }
            return Some(result);
        }
        if let Some(msg) = error_obj.as_str() {
            return Some(msg.to_string());
        }
    }
    json.get("message")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}
