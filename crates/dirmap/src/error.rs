//! Directory access error types
//!
//! Error definitions with transient/permanent classification. Read paths
//! degrade to empty results on these errors; write paths always return them.

use thiserror::Error;

/// LDAP result code for `sizeLimitExceeded`.
pub const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;

/// LDAP result code for `noSuchObject`.
pub const RC_NO_SUCH_OBJECT: u32 = 32;

/// LDAP result code for `invalidCredentials`.
pub const RC_INVALID_CREDENTIALS: u32 = 49;

/// LDAP result code for `entryAlreadyExists`.
pub const RC_ALREADY_EXISTS: u32 = 68;

/// Error that can occur while talking to a directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Connection errors (usually transient)
    /// Failed to establish a connection to the directory server.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection or operation timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    // Authentication errors (permanent)
    /// Bind was rejected.
    #[error("authentication failed for {bind_dn}")]
    AuthenticationFailed { bind_dn: String },

    // Configuration errors (permanent)
    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// One or more session options could not be applied.
    #[error("{} session option(s) rejected", failures.len())]
    OptionsRejected { failures: Vec<(String, String)> },

    // Read errors
    /// A search could not be completed.
    #[error("search failed with code {code}: {message}")]
    SearchFailed { code: u32, message: String },

    /// A record field was accessed that the record does not hold.
    #[error("field '{field}' does not exist on this record")]
    FieldNotFound { field: String },

    // Write errors
    /// A directory write failed.
    #[error("operation failed: {message}")]
    OperationFailed { message: String, code: Option<u32> },

    /// The target entry does not exist.
    #[error("object not found: {dn}")]
    ObjectNotFound { dn: String },

    /// An entry with the same DN already exists.
    #[error("object already exists: {dn}")]
    ObjectAlreadyExists { dn: String },

    /// A filtered erase removed some matches but not all of them.
    #[error("erase incomplete: {erased} erased, {} failed", failed.len())]
    EraseIncomplete { erased: usize, failed: Vec<String> },

    /// Data handed to a write is unusable.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    // Cache errors
    /// The cache service could not be reached.
    #[error("cache unavailable: {message}")]
    CacheUnavailable { message: String },
}

impl DirectoryError {
    /// Check if this error is transient and the operation could be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::ConnectionTimeout { .. }
                | DirectoryError::CacheUnavailable { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// The directory result code carried by this error, if any.
    pub fn result_code(&self) -> Option<u32> {
        match self {
            DirectoryError::SearchFailed { code, .. } => Some(*code),
            DirectoryError::OperationFailed { code, .. } => *code,
            DirectoryError::AuthenticationFailed { .. } => Some(RC_INVALID_CREDENTIALS),
            DirectoryError::ObjectNotFound { .. } => Some(RC_NO_SUCH_OBJECT),
            DirectoryError::ObjectAlreadyExists { .. } => Some(RC_ALREADY_EXISTS),
            _ => None,
        }
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::OptionsRejected { .. } => "OPTIONS_REJECTED",
            DirectoryError::SearchFailed { .. } => "SEARCH_FAILED",
            DirectoryError::FieldNotFound { .. } => "FIELD_NOT_FOUND",
            DirectoryError::OperationFailed { .. } => "OPERATION_FAILED",
            DirectoryError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            DirectoryError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            DirectoryError::EraseIncomplete { .. } => "ERASE_INCOMPLETE",
            DirectoryError::InvalidData { .. } => "INVALID_DATA",
            DirectoryError::CacheUnavailable { .. } => "CACHE_UNAVAILABLE",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a search failed error.
    pub fn search_failed(code: u32, message: impl Into<String>) -> Self {
        DirectoryError::SearchFailed {
            code,
            message: message.into(),
        }
    }

    /// Create an operation failed error for a directory result code.
    pub fn operation_failed_with_code(code: u32, message: impl Into<String>) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Create a field not found error.
    pub fn field_not_found(field: impl Into<String>) -> Self {
        DirectoryError::FieldNotFound {
            field: field.into(),
        }
    }

    /// Create a cache unavailable error.
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        DirectoryError::CacheUnavailable {
            message: message.into(),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let transient_errors = vec![
            DirectoryError::connection_failed("test"),
            DirectoryError::ConnectionTimeout { timeout_secs: 30 },
            DirectoryError::cache_unavailable("redis down"),
        ];

        for err in transient_errors {
            assert!(
                err.is_transient(),
                "Expected {} to be transient",
                err.error_code()
            );
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn test_permanent_errors() {
        let permanent_errors = vec![
            DirectoryError::AuthenticationFailed {
                bind_dn: "cn=admin".to_string(),
            },
            DirectoryError::field_not_found("mail"),
            DirectoryError::search_failed(87, "bad filter"),
            DirectoryError::ObjectNotFound {
                dn: "cn=x".to_string(),
            },
        ];

        for err in permanent_errors {
            assert!(
                err.is_permanent(),
                "Expected {} to be permanent",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(
            DirectoryError::search_failed(87, "bad filter").result_code(),
            Some(87)
        );
        assert_eq!(
            DirectoryError::ObjectNotFound {
                dn: "cn=x".to_string()
            }
            .result_code(),
            Some(RC_NO_SUCH_OBJECT)
        );
        assert_eq!(DirectoryError::field_not_found("x").result_code(), None);
        assert_eq!(
            DirectoryError::operation_failed_with_code(53, "unwilling").result_code(),
            Some(53)
        );
    }

    #[test]
    fn test_error_display() {
        let err = DirectoryError::field_not_found("telephoneNumber");
        assert_eq!(
            err.to_string(),
            "field 'telephoneNumber' does not exist on this record"
        );

        let err = DirectoryError::EraseIncomplete {
            erased: 2,
            failed: vec!["cn=a".to_string()],
        };
        assert_eq!(err.to_string(), "erase incomplete: 2 erased, 1 failed");

        let err = DirectoryError::OptionsRejected {
            failures: vec![("protocol_version".to_string(), "v2".to_string())],
        };
        assert_eq!(err.to_string(), "1 session option(s) rejected");
    }

    #[test]
    fn test_error_with_source() {
        let source_err = std::io::Error::new(std::io::ErrorKind::Other, "refused");
        let err = DirectoryError::connection_failed_with_source("failed", source_err);

        assert!(err.is_transient());
        if let DirectoryError::ConnectionFailed { source, .. } = &err {
            assert!(source.is_some());
        } else {
            panic!("Expected ConnectionFailed variant");
        }
    }
}
