use thiserror::Error;

/// Failure of a request issued through the sync layer.
///
/// Cloneable so that one failure can be handed to every caller attached to a
/// deduplicated request and kept on a rejected cache entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {message}")]
    Network { message: String, transient: bool },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Session expired - please log in again")]
    AuthExpired,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut cut = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        ApiError::Http {
            status,
            body: Self::truncate_body(body),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ApiError::Network {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network { transient: true, .. })
    }

    /// True for the failures a UI should render as one "connection or session
    /// problem" banner: network failures that survived retrying and a
    /// session that could not be renewed.
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, ApiError::Network { .. } | ApiError::AuthExpired)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_body() {
            ApiError::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            ApiError::Validation(err.to_string())
        } else {
            ApiError::Network {
                message: err.to_string(),
                transient: err.is_connect() || err.is_timeout() || err.is_request(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_keeps_status_and_body() {
        let err = ApiError::from_status(422, "missing field");
        assert_eq!(
            err,
            ApiError::Http {
                status: 422,
                body: "missing field".to_string()
            }
        );
        assert!(!err.is_unauthorized());
        assert!(ApiError::from_status(401, "").is_unauthorized());
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400); // 800 bytes, 2 per char
        let ApiError::Http { body: truncated, .. } = ApiError::from_status(500, &body) else {
            panic!("expected http error");
        };
        assert!(truncated.contains("truncated, 800 total bytes"));
        assert!(truncated.starts_with(&"é".repeat(250)));
    }

    #[test]
    fn test_connection_problem_classification() {
        assert!(ApiError::transient("reset").is_connection_problem());
        assert!(ApiError::AuthExpired.is_connection_problem());
        assert!(!ApiError::from_status(500, "boom").is_connection_problem());
        assert!(!ApiError::Validation("bad".into()).is_connection_problem());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ApiError::from_status(404, "no such patient").to_string(),
            "HTTP 404: no such patient"
        );
        assert_eq!(
            ApiError::AuthExpired.to_string(),
            "Session expired - please log in again"
        );
    }
}
