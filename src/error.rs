//! Error types shared by every public entry point.

use thiserror::Error;

/// Errors raised by the language-model stack
///
/// Each variant carries a human-readable message naming the offending
/// parameter, shape, or file.
#[derive(Debug, Error)]
pub enum LmError {
    /// Invalid hyperparameters, unsupported method names, bad file prefixes
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Mismatched tensor shapes at forward time
    #[error("shape error: {0}")]
    Shape(String),

    /// Positional encoding overflow and out-of-range indices
    #[error("bounds error: {0}")]
    Bounds(String),

    /// Filesystem failures during checkpoint or tokenizer IO
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed checkpoint archives or tokenizer files
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for LmError {
    fn from(err: serde_json::Error) -> Self {
        LmError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_category() {
        let err = LmError::Configuration("temperature must be positive, got 0".into());
        assert_eq!(
            err.to_string(),
            "configuration error: temperature must be positive, got 0"
        );

        let err = LmError::Bounds("position 12 exceeds 10".into());
        assert!(err.to_string().starts_with("bounds error"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LmError = io.into();
        assert!(matches!(err, LmError::Io(_)));
    }

    #[test]
    fn test_json_errors_become_decode_errors() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: LmError = parse.unwrap_err().into();
        assert!(matches!(err, LmError::Decode(_)));
    }
}
