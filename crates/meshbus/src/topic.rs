//! # Topic Matching
//!
//! Pure functions matching dot-delimited topics against trailing-wildcard
//! patterns. Used by the local bus, the remote entrypoint reactor, and the
//! broker's bridge path. Exact (non-wildcard) subscriptions are routed by
//! direct key lookup and never pass through these functions.

use crate::error::BusError;
use crate::RESERVED_TOPICS;

/// Wildcard segment token.
pub const WILDCARD: &str = "*";

/// Match a concrete topic against a wildcard pattern.
///
/// Segments are compared in lock-step over the shorter of the two
/// sequences. A `*` pattern segment matches the entire remainder of the
/// topic, however many segments follow. If the paired segments are
/// exhausted without hitting a wildcard the match fails: this function is
/// only meaningful for patterns that actually contain a wildcard.
#[must_use]
pub fn wildcard_match(topic: &str, pattern: &str) -> bool {
    for (t, p) in topic.split('.').zip(pattern.split('.')) {
        if p == WILDCARD {
            return true;
        }
        if t != p {
            return false;
        }
    }
    false
}

/// Collect every pattern that matches the topic.
///
/// Reserved signaling topics are excluded up front, so a subscriber using
/// `*` never receives internal close/pulse traffic. The exclusion applies
/// independently at every bridge hop.
pub fn wildcard_search<'a, I>(topic: &str, patterns: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    if RESERVED_TOPICS.contains(&topic) {
        return Vec::new();
    }
    patterns
        .into_iter()
        .filter(|p| wildcard_match(topic, p))
        .cloned()
        .collect()
}

/// Whether a registration pattern contains the wildcard token.
#[must_use]
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|s| s == WILDCARD)
}

/// Validate a subscription pattern.
///
/// A pattern may contain at most one wildcard segment and it must be the
/// trailing segment. Exact patterns always pass.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let segments: Vec<&str> = pattern.split('.').collect();
    let wildcards = segments.iter().filter(|s| **s == WILDCARD).count();
    if wildcards > 1 {
        return Err(BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "at most one wildcard segment is allowed",
        });
    }
    if wildcards == 1 && segments.last() != Some(&WILDCARD) {
        return Err(BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "the wildcard must be the trailing segment",
        });
    }
    Ok(())
}

/// Transport-level subscription prefix for a pattern.
///
/// The broadcast channel filters frames by topic prefix (the wildcard is a
/// registration-table concept, not a wire concept): `"a.b.*"` subscribes to
/// the prefix `"a.b."`, a bare `"*"` subscribes to everything.
#[must_use]
pub fn subscription_prefix(pattern: &str) -> String {
    if pattern == WILDCARD {
        return String::new();
    }
    match pattern.strip_suffix(".*") {
        Some(head) => format!("{head}."),
        None => pattern.to_string(),
    }
}
