//! # Event Envelope
//!
//! The immutable unit of exchange between publishers and subscribers. The
//! payload is already-encoded bytes (see [`crate::codec`]); typed handlers
//! decode it at delivery. On the wire the envelope is serialized as
//! self-describing JSON, so any peer can inspect an event without knowing
//! the payload type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable event envelope.
///
/// The id is generated at construction and stays stable across relays and
/// bridges, which lets consumers deduplicate events that travel multiple
/// hops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Dot-delimited topic (`"orders.created"`). Segments are opaque tokens.
    #[serde(rename = "type")]
    pub topic: String,

    /// Encoded payload bytes, absent for payload-free events.
    pub payload: Option<Vec<u8>>,

    /// Globally unique id for this emission.
    pub id: String,

    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with a freshly generated id.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self::with_id(topic, payload, Uuid::new_v4().to_string())
    }

    /// Create an event propagating an existing id.
    ///
    /// Used by bridges so a relayed event keeps the id of the original
    /// emission.
    #[must_use]
    pub fn with_id(topic: impl Into<String>, payload: Option<Vec<u8>>, id: String) -> Self {
        Self {
            topic: topic.into(),
            payload,
            id,
            timestamp: Utc::now(),
        }
    }

    /// Create a payload-free signaling event.
    #[must_use]
    pub fn signal(topic: impl Into<String>) -> Self {
        Self::new(topic, None)
    }
}
