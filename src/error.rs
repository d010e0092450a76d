//! Error types for the serving core.
//!
//! Every failure a caller can observe maps to one [`ServingError`] variant.
//! Variants are split into client errors (bad artifact, payload, schema or
//! lookup) and server errors (evaluation failure, timeout, internal faults);
//! [`ServingError::status_code`] gives the HTTP status for each.

use thiserror::Error;

/// Error type for registry, codec and inference operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServingError {
    #[error("Invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid servable name: {0}")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Unknown output column: {0}")]
    UnknownOutputColumn(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Model evaluation failed: {0}")]
    Evaluation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for serving operations.
pub type Result<T> = std::result::Result<T, ServingError>;

impl ServingError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServingError::InvalidArtifact(_)
            | ServingError::InvalidName(_)
            | ServingError::MalformedPayload(_)
            | ServingError::SchemaMismatch(_)
            | ServingError::UnknownOutputColumn(_) => 400,
            ServingError::NotFound(_) => 404,
            ServingError::UnsupportedFormat(_) | ServingError::UnsupportedContentType(_) => 415,
            ServingError::Timeout(_) => 504,
            ServingError::Evaluation(_) | ServingError::Internal(_) => 500,
        }
    }

    /// Whether the caller caused the error (bad request, unknown model, ...).
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    /// Short stable name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            ServingError::InvalidArtifact(_) => "invalid_artifact",
            ServingError::UnsupportedFormat(_) => "unsupported_format",
            ServingError::InvalidName(_) => "invalid_name",
            ServingError::NotFound(_) => "not_found",
            ServingError::UnsupportedContentType(_) => "unsupported_content_type",
            ServingError::MalformedPayload(_) => "malformed_payload",
            ServingError::SchemaMismatch(_) => "schema_mismatch",
            ServingError::UnknownOutputColumn(_) => "unknown_output_column",
            ServingError::Timeout(_) => "timeout",
            ServingError::Evaluation(_) => "evaluation",
            ServingError::Internal(_) => "internal",
        }
    }
}

impl From<ort::Error> for ServingError {
    fn from(err: ort::Error) -> Self {
        ServingError::Evaluation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ServingError::NotFound("iris".into()).status_code(), 404);
        assert_eq!(ServingError::SchemaMismatch("x".into()).status_code(), 400);
        assert_eq!(ServingError::UnsupportedContentType("text/csv".into()).status_code(), 415);
        assert_eq!(ServingError::Timeout("deploy".into()).status_code(), 504);
        assert_eq!(ServingError::Evaluation("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_client_vs_server_errors() {
        assert!(ServingError::MalformedPayload("x".into()).is_client_error());
        assert!(ServingError::UnknownOutputColumn("x".into()).is_client_error());
        assert!(!ServingError::Internal("x".into()).is_client_error());
        assert!(!ServingError::Timeout("x".into()).is_client_error());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = ServingError::NotFound("model 'iris' version 7".into());
        assert_eq!(err.to_string(), "Not found: model 'iris' version 7");
    }
}
