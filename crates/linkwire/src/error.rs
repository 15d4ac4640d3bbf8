//! # Error Definitions
//!
//! Failures raised while converting values or moving messages to and from bytes.

/// Operational failures within the wire layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// A message or payload body could not be serialized.
    Encode(String),
    /// The bytes did not form a valid message or payload body.
    Decode(String),
    /// A `Value` or `Payload` did not hold the type the caller asked for.
    TypeMismatch { expected: String, found: String },
    /// A payload carried a tag other than the one being unpacked.
    UnknownTag { expected: String, found: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            Self::UnknownTag { expected, found } => {
                write!(f, "Payload tag mismatch: expected '{}', found '{}'", expected, found)
            }
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
