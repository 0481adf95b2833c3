//! HTTP status classification for the completion backend.

use reqwest::StatusCode;

use crate::domain::ports::CompletionError;

/// Map an HTTP status and response body onto the port's error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> CompletionError {
    match status.as_u16() {
        429 => CompletionError::RateLimited,
        500 | 502 | 503 | 504 | 529 => {
            CompletionError::Transient(format!("server error {status}: {body}"))
        }
        _ => CompletionError::Permanent(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_rate_limited() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(err, CompletionError::RateLimited));
        assert!(err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500u16, 502, 503, 504, 529] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, "overloaded".into());
            assert!(err.is_transient(), "status {code} should be transient");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400u16, 401, 403, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, String::new());
            assert!(!err.is_transient(), "status {code} should be permanent");
        }
    }
}
