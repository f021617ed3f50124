//! Protocol error types.

use remoting_core::RemotingError;
use thiserror::Error;

/// Errors raised while framing or unframing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer underflow: need {needed} bytes, {available} readable")]
    Underflow { needed: usize, available: usize },

    #[error("invalid writer index {index}: must be within {min}..={max}")]
    InvalidWriterIndex { index: usize, min: usize, max: usize },

    #[error("invalid serializer id {0}: must be within 1..=31")]
    InvalidSerializerId(u8),

    #[error("unknown serializer id {serializer_id} (message {id})")]
    UnknownSerializer { id: i64, serializer_id: u8 },

    #[error("invalid body length {length} (message {id}, max {max})")]
    InvalidBodyLength { id: i64, length: i64, max: u32 },

    #[error("encode failed (message {id}): {source}")]
    Encode {
        id: i64,
        #[source]
        source: SerializationError,
    },

    #[error("decode failed (message {id}): {source}")]
    Decode {
        id: i64,
        #[source]
        source: SerializationError,
    },
}

impl ProtocolError {
    /// Returns the id of the message being processed, when known.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            ProtocolError::UnknownSerializer { id, .. }
            | ProtocolError::InvalidBodyLength { id, .. }
            | ProtocolError::Encode { id, .. }
            | ProtocolError::Decode { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl From<ProtocolError> for RemotingError {
    fn from(err: ProtocolError) -> Self {
        let id = err.message_id();
        match err {
            ProtocolError::Encode { .. } => RemotingError::Serialization {
                id,
                message: err.to_string(),
            },
            _ => RemotingError::Protocol {
                id,
                message: err.to_string(),
            },
        }
    }
}

/// Errors raised by a body serializer.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("body truncated: need {needed} bytes, {available} left")]
    Truncated { needed: usize, available: usize },

    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("value of type {actual} does not conform to declared type {declared}")]
    TypeMismatch { declared: String, actual: &'static str },

    #[error("{args} arguments but {types} parameter types")]
    ArgumentMismatch { args: usize, types: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoting_core::ErrorKind;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Underflow {
            needed: 8,
            available: 3,
        };
        assert!(err.to_string().contains("8"));

        let err = ProtocolError::InvalidSerializerId(32);
        assert!(err.to_string().contains("32"));

        let err = ProtocolError::UnknownSerializer {
            id: 9,
            serializer_id: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("7") && msg.contains("9"));

        let err = ProtocolError::Decode {
            id: 11,
            source: SerializationError::InvalidUtf8,
        };
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_message_id() {
        let err = ProtocolError::Encode {
            id: 5,
            source: SerializationError::NegativeLength(-1),
        };
        assert_eq!(err.message_id(), Some(5));
        assert_eq!(ProtocolError::InvalidSerializerId(0).message_id(), None);
    }

    #[test]
    fn test_conversion_to_remoting_error() {
        let err: RemotingError = ProtocolError::Decode {
            id: 42,
            source: SerializationError::InvalidUtf8,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.message_id(), Some(42));

        let err: RemotingError = ProtocolError::Encode {
            id: 43,
            source: SerializationError::ArgumentMismatch { args: 1, types: 2 },
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(err.message_id(), Some(43));
    }
}
