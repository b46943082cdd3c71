//! SDK error types.
//!
//! Provides error types for decoding and validating domain values.

/// SDK errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdkError {
    /// Payload is not a JSON object.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Payload names a protocol other than the indexed one.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Unknown token operation.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Missing required field.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Invalid amount value.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid decimals value.
    #[error("invalid decimals: {0}")]
    InvalidDecimals(String),

    /// Invalid holder address.
    #[error("invalid holder: {0}")]
    InvalidHolder(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
