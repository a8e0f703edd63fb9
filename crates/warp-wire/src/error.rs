//! Error types for wire encoding and decoding

/// Errors from request building and stream decoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request template is corrupt: {0}")]
    Template(String),

    #[error("protobuf decode error: {0}")]
    Decode(String),

    #[error("base64 decode error: {0}")]
    Base64(String),

    #[error("empty turn: no user message and no tool results")]
    EmptyTurn,
}

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
