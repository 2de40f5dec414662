use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Level separator for hierarchical topics.
pub const LEVEL_SEPARATOR: char = '/';

/// Upper bound on topic and filter length in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// Concrete topic a message is published on (`iot/stream`,
/// `devices/42/telemetry`). Never contains wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn parse(value: impl Into<String>) -> Result<Self, RelayError> {
        let value = value.into();
        validate_len(&value)?;
        for level in value.split(LEVEL_SEPARATOR) {
            if level.contains(['+', '#']) || level == "*" {
                return Err(RelayError::format(format!(
                    "topic '{value}': wildcards are only allowed in filters"
                )));
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split(LEVEL_SEPARATOR)
    }

    /// 1-based topic level, as used by `${topic(N)}` expressions.
    pub fn level(&self, n: usize) -> Option<&str> {
        n.checked_sub(1).and_then(|i| self.levels().nth(i))
    }

    /// Reserved system topics start with `$`.
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(raw).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════
//  TopicFilter
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Exact(String),
    /// `+`: exactly one level.
    Single,
    /// `#` or `*`: the remaining levels, including none.
    Remainder,
}

/// Topic predicate with wildcard levels.
///
/// `+` matches exactly one level, `#` (or `*`) matches every remaining level
/// and must be the last level of the filter. Wildcards must occupy a whole
/// level. Filters starting with a wildcard do not match `$` system topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(value: impl Into<String>) -> Result<Self, RelayError> {
        let raw = value.into();
        validate_len(&raw)?;

        let parts: Vec<&str> = raw.split(LEVEL_SEPARATOR).collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "+" => Level::Single,
                "#" | "*" => {
                    if i + 1 != parts.len() {
                        return Err(RelayError::format(format!(
                            "filter '{raw}': multi-level wildcard must be the last level"
                        )));
                    }
                    Level::Remainder
                }
                other if other.contains(['+', '#']) => {
                    return Err(RelayError::format(format!(
                        "filter '{raw}': wildcard must occupy a whole level"
                    )));
                }
                other => Level::Exact(other.to_string()),
            };
            levels.push(level);
        }

        Ok(Self { raw, levels })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the filter has no wildcard levels.
    pub fn is_exact(&self) -> bool {
        self.levels.iter().all(|l| matches!(l, Level::Exact(_)))
    }

    /// Side-effect free predicate over a topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        if topic.is_system() && !matches!(self.levels.first(), Some(Level::Exact(_))) {
            return false;
        }

        let mut topic_levels = topic.levels();
        for level in &self.levels {
            match level {
                Level::Remainder => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for TopicFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for TopicFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TopicFilter::parse(raw).map_err(serde::de::Error::custom)
    }
}

fn validate_len(value: &str) -> Result<(), RelayError> {
    if value.is_empty() {
        return Err(RelayError::format("topic must not be empty"));
    }
    if value.len() > MAX_TOPIC_LEN {
        return Err(RelayError::format(format!(
            "topic exceeds {MAX_TOPIC_LEN} bytes"
        )));
    }
    Ok(())
}
