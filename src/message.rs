//! The conversation message model.
//!
//! A [`Message`] is one turn of a conversation.  It is a plain value; how it looks on disk is
//! decided by [`encode`] and [`decode`], which map it to and from a generic key-value record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

const ROLE_FIELD: &str = "role";
const CONTENT_FIELD: &str = "content";

/// The author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the whole conversation.
    System,
    /// The human side of the conversation.
    User,
    /// The model side of the conversation.
    Assistant,
}

impl Role {
    /// The wire and on-disk name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(Error::format(format!("unknown role {s:?}"), None, None)),
        }
    }
}

/// One turn of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Who said it.
    pub role: Role,
    /// What was said.
    pub content: String,
}

impl Message {
    /// Creates a new message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Encodes a message as a record with exactly two fields, `role` then `content`.
pub fn encode(message: &Message) -> Mapping {
    let mut record = Mapping::new();
    record.insert(
        Value::String(ROLE_FIELD.to_string()),
        Value::String(message.role.as_str().to_string()),
    );
    record.insert(
        Value::String(CONTENT_FIELD.to_string()),
        Value::String(message.content.clone()),
    );
    record
}

/// Decodes a record produced by [`encode`].
///
/// A record missing either field, or holding something other than a mapping, is an error; it is
/// never silently skipped.
pub fn decode(record: &Value) -> Result<Message> {
    let Some(record) = record.as_mapping() else {
        return Err(Error::format("message record is not a mapping", None, None));
    };
    let role = record
        .get(ROLE_FIELD)
        .ok_or_else(|| Error::format("message record has no role", None, None))?;
    let role = role
        .as_str()
        .ok_or_else(|| Error::format("message role is not a string", None, None))?
        .parse::<Role>()?;
    let content = match record.get(CONTENT_FIELD) {
        Some(Value::String(content)) => content.clone(),
        // YAML turns bare words like `yes` or `42` into other scalars.
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(Error::format("message content is not text", None, None));
        }
        None => {
            return Err(Error::format("message record has no content", None, None));
        }
    };
    Ok(Message { role, content })
}
