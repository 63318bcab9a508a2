//! # Error Taxonomy
//!
//! Per-call failures (codec, transport, misuse) are recovered at the call
//! site and reported through return values plus a log line; only failing to
//! bind the broker's port triple is fatal.

use thiserror::Error;

/// Errors from payload encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be encoded to bytes.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload bytes could not be decoded as the declared type.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The declared type carries data but the event had no payload.
    #[error("event has no payload")]
    MissingPayload,

    /// A string payload was not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Errors from bus and entrypoint operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Payload encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The broker could not bind one of its three ports. Fatal at startup.
    #[error("failed to bind {channel} channel on port {port}: {source}")]
    Bind {
        /// Which of the three channels failed.
        channel: &'static str,
        /// The port that could not be bound.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure outside of broker startup.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A subscription pattern violates the trailing-wildcard rule.
    #[error("invalid topic pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Envelope serialization failure on the wire path.
    #[error("failed to serialize event envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The registry has no handlers under the requested namespace.
    #[error("unknown registry namespace {0:?}")]
    UnknownNamespace(String),
}
