//! Hierarchical event names and subscription patterns
//!
//! Names are segments joined by `/`, conventionally
//! `Integration/DeviceType/DeviceName/Control-or-Query`. Patterns use the same
//! grammar, except that any segment may be the single-segment wildcard `+`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Segment separator for names and patterns
pub const SEPARATOR: char = '/';

/// Single-segment wildcard
pub const WILDCARD: &str = "+";

/// Error type for invalid names and patterns
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,

    #[error("name '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("name '{0}' contains a wildcard; only patterns may use '+'")]
    WildcardInName(String),

    #[error("segment '{segment}' in '{name}' mixes '+' with other characters")]
    PartialWildcard { name: String, segment: String },
}

/// A concrete event name such as `Daikin/Sensor/Lounge/Temperature`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName(String);

impl EventName {
    /// Parse and validate an event name
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_segments(&name)?;
        if name.split(SEPARATOR).any(|s| s.contains('+')) {
            return Err(NameError::WildcardInName(name));
        }
        Ok(Self(name))
    }

    /// Build a name from individual segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self, NameError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the segments of the name
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Segment at `index`, if present
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments().nth(index)
    }
}

impl FromStr for EventName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EventName {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A subscription pattern: literal segments or `+`, matched positionally
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self, NameError> {
        let raw = pattern.into();
        validate_segments(&raw)?;

        let segments = raw
            .split(SEPARATOR)
            .map(|s| {
                if s == WILDCARD {
                    Ok(Segment::Wildcard)
                } else if s.contains('+') {
                    Err(NameError::PartialWildcard {
                        name: raw.clone(),
                        segment: s.to_string(),
                    })
                } else {
                    Ok(Segment::Literal(s.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether any segment is the `+` wildcard
    pub fn is_wildcard(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::Wildcard)
    }

    /// Check whether `name` matches this pattern
    ///
    /// Depths must be equal and every literal segment must equal the name's
    /// segment at the same position.
    pub fn matches(&self, name: &EventName) -> bool {
        if self.depth() != name.depth() {
            return false;
        }
        self.segments
            .iter()
            .zip(name.segments())
            .all(|(pattern, segment)| match pattern {
                Segment::Wildcard => true,
                Segment::Literal(literal) => literal == segment,
            })
    }
}

impl FromStr for TopicPattern {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

impl From<EventName> for TopicPattern {
    fn from(name: EventName) -> Self {
        let segments = name
            .segments()
            .map(|s| Segment::Literal(s.to_string()))
            .collect();
        Self {
            raw: name.0,
            segments,
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn validate_segments(raw: &str) -> Result<(), NameError> {
    if raw.is_empty() {
        return Err(NameError::Empty);
    }
    if raw.split(SEPARATOR).any(str::is_empty) {
        return Err(NameError::EmptySegment(raw.to_string()));
    }
    Ok(())
}
