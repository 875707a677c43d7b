//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    Encode {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    Decode {
        /// Description of the decoding error.
        message: String,
    },

    /// Compressed payload could not be restored.
    #[error("decompression failed: {message}")]
    Decompression {
        /// Description of the decompression error.
        message: String,
    },

    /// Payload exceeds the configured size limit.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Declared or actual size.
        size: usize,
        /// Maximum accepted size.
        limit: usize,
    },

    /// The message cannot be carried by this frame kind.
    #[error("unexpected frame kind: {kind}")]
    UnexpectedKind {
        /// Name of the offending kind.
        kind: String,
    },
}

impl ProtocolError {
    /// Create an encoding error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a decoding error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a decompression error.
    pub fn decompression(message: impl Into<String>) -> Self {
        Self::Decompression {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::decode("truncated map");
        assert_eq!(err.to_string(), "decoding failed: truncated map");

        let err = ProtocolError::PayloadTooLarge {
            size: 100,
            limit: 10,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("10"));
    }
}
