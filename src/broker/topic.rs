//! Topic routing
//!
//! Topics and patterns are dot-separated segment sequences such as
//! `orders.created`. A pattern segment equal to `*` matches exactly one
//! arbitrary segment at that position, and a pattern that is just `*`
//! matches every topic regardless of depth. Matching is case-sensitive and
//! a single left-to-right pass over the segments.

use std::fmt;

use crate::utils::BrokerError;

const SEPARATOR: char = '.';
const WILDCARD: &str = "*";

/// Returns true when `topic` is selected by `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }

    let mut pattern_segments = pattern.split(SEPARATOR);
    let mut topic_segments = topic.split(SEPARATOR);

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) if p == WILDCARD || p == t => continue,
            _ => return false,
        }
    }
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(String);

impl Pattern {
    /// Validate a raw pattern. Empty patterns and patterns with empty
    /// segments (`orders..created`, `.orders`) are rejected.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        if raw.is_empty() || raw.split(SEPARATOR).any(str::is_empty) {
            return Err(BrokerError::InvalidPattern(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches(&self.0, topic)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
