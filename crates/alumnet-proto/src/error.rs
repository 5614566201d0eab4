//! Error types for the alumnet-proto crate.

use thiserror::Error;

/// Errors that can occur while building or parsing wire types.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Unknown row filter operator.
    #[error("unknown filter operator: {0}")]
    UnknownOperator(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtoError::Decoding("eof".to_string()).to_string(),
            "decoding error: eof"
        );
        assert_eq!(
            ProtoError::MissingField("topic").to_string(),
            "missing required field: topic"
        );
        assert_eq!(
            ProtoError::UnknownOperator("like".to_string()).to_string(),
            "unknown filter operator: like"
        );
    }
}
