//! Error bodies in the client's chosen format

use serde_json::{Value, json};

/// OpenAI-shaped error body.
pub fn openai_error_body(message: &str, error_type: &str, code: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    })
}

/// Anthropic-shaped error body.
pub fn anthropic_error_body(message: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": "api_error",
            "message": message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_error_shape() {
        let body = openai_error_body("no accounts", "service_unavailable", "503");
        assert_eq!(body["error"]["message"], "no accounts");
        assert_eq!(body["error"]["type"], "service_unavailable");
        assert_eq!(body["error"]["code"], "503");
    }

    #[test]
    fn anthropic_error_shape() {
        let body = anthropic_error_body("boom");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["message"], "boom");
    }
}
