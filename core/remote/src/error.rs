//! Remote API errors.

use thiserror::Error;

/// Failure reported by the remote API or the transport beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API error (status {status:?}): {message}")]
pub struct ApiError {
    /// HTTP status, `None` when no response was received.
    pub status: Option<u16>,
    pub message: String,
    /// Raw response body, if any.
    pub body: Option<String>,
}

impl ApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            body: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Stale lock token.
    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// The target no longer exists server-side.
    pub fn is_missing(&self) -> bool {
        matches!(self.status, Some(404) | Some(410))
    }

    /// Response body cut to `max` characters for logging.
    pub fn truncated_body(&self, max: usize) -> Option<String> {
        self.body.as_ref().map(|body| body.chars().take(max).collect())
    }
}

impl From<ApiError> for fieldsync_common::Error {
    fn from(err: ApiError) -> Self {
        match err.status {
            None => fieldsync_common::Error::Network(err.message),
            status => fieldsync_common::Error::Api {
                status,
                message: err.message,
                body: err.body,
            },
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ApiError::http(409, "stale").is_conflict());
        assert!(ApiError::http(404, "gone").is_missing());
        assert!(ApiError::http(410, "gone").is_missing());
        assert!(!ApiError::http(500, "oops").is_missing());
        assert!(!ApiError::network("offline").is_conflict());
    }

    #[test]
    fn test_truncated_body() {
        let err = ApiError::http(500, "oops").with_body("x".repeat(600));
        assert_eq!(err.truncated_body(500).unwrap().len(), 500);
    }

    #[test]
    fn test_into_common_error() {
        let err: fieldsync_common::Error = ApiError::network("offline").into();
        assert!(matches!(err, fieldsync_common::Error::Network(_)));
        let err: fieldsync_common::Error = ApiError::http(422, "bad").into();
        assert_eq!(err.http_status(), Some(422));
    }
}
