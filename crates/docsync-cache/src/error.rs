//! Error types for the fetch layer
//!
//! A [`FetchError`] is `Clone` so that a single settled outcome can be handed
//! to every caller that joined the same in-flight request.

use serde_json::Value;

/// Errors produced while performing or decoding an outbound request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Transport failure before any response was received
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response whose body carried no usable message
    #[error("{message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// `HTTP <status>: <statusText>`
        message: String,
    },

    /// Non-2xx response with a structured error body
    #[error("{message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Message extracted from the body
        message: String,
    },

    /// Superseded by a newer request for the same key
    #[error("request cancelled")]
    Cancelled,

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    /// HTTP status of the failed response, if one was received
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if the failure came from a structured server error body
    #[inline]
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    /// Build the error for a non-2xx response
    ///
    /// The message is taken from `error.message`, `message` or `detail` (in
    /// that order), then from a bare string `error` or `error.type`. When none
    /// is present, or the body is not JSON, falls back to
    /// `HTTP <status>: <statusText>`.
    #[must_use]
    pub fn from_response(status: u16, status_text: &str, body: &str) -> Self {
        match serde_json::from_str::<Value>(body)
            .ok()
            .as_ref()
            .and_then(extract_error_message)
        {
            Some(message) => Self::Server { status, message },
            None => Self::Http {
                status,
                message: format!("HTTP {status}: {status_text}"),
            },
        }
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Network(format!("request task failed: {err}"))
        }
    }
}

/// Pull a human-readable message out of an error body
#[must_use]
pub fn extract_error_message(body: &Value) -> Option<String> {
    let as_text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_owned);

    as_text(body.pointer("/error/message"))
        .or_else(|| as_text(body.get("message")))
        .or_else(|| as_text(body.get("detail")))
        .or_else(|| as_text(body.get("error")))
        .or_else(|| as_text(body.pointer("/error/type")))
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_priority() {
        let body = json!({"error": {"message": "nested"}, "message": "top", "detail": "detail"});
        assert_eq!(extract_error_message(&body).as_deref(), Some("nested"));

        let body = json!({"message": "top", "detail": "detail"});
        assert_eq!(extract_error_message(&body).as_deref(), Some("top"));

        let body = json!({"detail": "detail"});
        assert_eq!(extract_error_message(&body).as_deref(), Some("detail"));
    }

    #[test]
    fn bare_string_and_type_fallbacks() {
        assert_eq!(
            extract_error_message(&json!({"error": "syntax error"})).as_deref(),
            Some("syntax error")
        );
        assert_eq!(
            extract_error_message(&json!({"error": {"type": "unique_violation"}})).as_deref(),
            Some("unique_violation")
        );
        assert_eq!(extract_error_message(&json!({"ok": false})), None);
    }

    #[test]
    fn unparsable_body_falls_back_to_status_line() {
        let err = FetchError::from_response(502, "Bad Gateway", "<html>oops</html>");
        assert_eq!(err.to_string(), "HTTP 502: Bad Gateway");
        assert_eq!(err.status(), Some(502));
        assert!(!err.is_structured());
    }

    #[test]
    fn structured_body_becomes_server_error() {
        let body = r#"{"error":{"message":"bad name"}}"#;
        let err = FetchError::from_response(400, "Bad Request", body);
        assert_eq!(
            err,
            FetchError::Server {
                status: 400,
                message: "bad name".to_string()
            }
        );
        assert!(err.is_structured());
    }

    proptest::proptest! {
        #[test]
        fn nested_message_survives_any_status(
            status in 400u16..600,
            message in "[a-zA-Z0-9 _.-]{1,40}",
        ) {
            let body = json!({"error": {"message": message.clone()}}).to_string();
            let err = FetchError::from_response(status, "irrelevant", &body);
            proptest::prop_assert_eq!(err, FetchError::Server { status, message });
        }
    }
}
