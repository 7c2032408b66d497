//! Error types for the assistant Lambda functions.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the assistant Lambda functions.
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value store error
    #[error("Store error: {0}")]
    Store(String),

    /// AWS SDK error (other than the key-value store)
    #[error("AWS error: {0}")]
    Aws(String),

    /// Configuration error
    #[error("{0}")]
    Config(String),

    /// Validation error
    #[error("{0}")]
    Validation(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Not found error
    #[error("{0}")]
    NotFound(String),

    /// A conditional write failed (item missing or already present)
    #[error("Conditional check failed: {0}")]
    Conflict(String),

    /// An upstream HTTP API returned an error
    #[error("{0}")]
    Upstream(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 401,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Upstream(_) => 502,
            _ => 500,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("x".into()).status_code(), 400);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        assert_eq!(Error::Upstream("x".into()).status_code(), 502);
        assert_eq!(Error::Store("x".into()).status_code(), 500);
        assert_eq!(Error::Config("x".into()).status_code(), 500);
    }

    #[test]
    fn test_validation_message_is_bare() {
        let err = Error::Validation("name required".into());
        assert_eq!(err.to_string(), "name required");
    }
}
