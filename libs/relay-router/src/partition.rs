//! Partition-key expressions for `put_to_stream` actions.
//!
//! The default, `${newuuid()}`, draws a fresh key for every record, so
//! records spread randomly across partitions and no per-key ordering exists
//! between them. Callers that need ordering must configure a key that is
//! stable for the records that have to stay ordered, e.g. `${clientid()}`.

use std::fmt;

use serde::Deserialize;

use relay_api::{Message, PartitionKey, RelayError};

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum PartitionKeyExpr {
    /// `${newuuid()}`
    #[default]
    NewUuid,
    /// `${topic()}`
    Topic,
    /// `${topic(N)}`, 1-based level.
    TopicLevel(usize),
    /// `${clientid()}`
    ClientId,
    Literal(String),
}

impl PartitionKeyExpr {
    pub fn parse(expr: &str) -> Result<Self, RelayError> {
        let expr = expr.trim();
        let Some(inner) = expr.strip_prefix("${").and_then(|e| e.strip_suffix('}')) else {
            if expr.is_empty() {
                return Err(RelayError::config("partition key expression is empty"));
            }
            if expr.contains("${") {
                return Err(RelayError::config(format!(
                    "partition key '{expr}': substitutions must span the whole key"
                )));
            }
            return Ok(Self::Literal(expr.to_string()));
        };

        match inner.trim() {
            "newuuid()" => Ok(Self::NewUuid),
            "topic()" => Ok(Self::Topic),
            "clientid()" => Ok(Self::ClientId),
            other => {
                let level = other
                    .strip_prefix("topic(")
                    .and_then(|s| s.strip_suffix(')'))
                    .and_then(|n| n.trim().parse::<usize>().ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        RelayError::config(format!("partition key '{expr}': unknown function"))
                    })?;
                Ok(Self::TopicLevel(level))
            }
        }
    }

    /// Key for one message. Fails when the expression refers to something
    /// the message does not have.
    pub fn evaluate(&self, message: &Message) -> Result<PartitionKey, RelayError> {
        match self {
            Self::NewUuid => Ok(PartitionKey::new(uuid::Uuid::new_v4().to_string())),
            Self::Topic => Ok(PartitionKey::new(message.topic().as_str())),
            Self::TopicLevel(n) => message
                .topic()
                .level(*n)
                .map(PartitionKey::new)
                .ok_or_else(|| {
                    RelayError::format(format!(
                        "topic '{}' has no level {n}",
                        message.topic()
                    ))
                }),
            Self::ClientId => message
                .client_id()
                .map(|c| PartitionKey::new(c.as_str()))
                .ok_or_else(|| RelayError::format("system message has no client id")),
            Self::Literal(key) => Ok(PartitionKey::new(key.as_str())),
        }
    }
}

impl TryFrom<String> for PartitionKeyExpr {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for PartitionKeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewUuid => f.write_str("${newuuid()}"),
            Self::Topic => f.write_str("${topic()}"),
            Self::TopicLevel(n) => write!(f, "${{topic({n})}}"),
            Self::ClientId => f.write_str("${clientid()}"),
            Self::Literal(key) => f.write_str(key),
        }
    }
}
