//! Durable record format for conversation histories.
//!
//! A history is stored as a JSON array of objects. Each object has exactly one
//! role key mapping to the message content, plus an optional `name`:
//!
//! ```json
//! [
//!   { "system": "Be terse." },
//!   { "user": "What's the weather?" },
//!   { "function": "{\"temp\": 21}", "name": "get_weather" },
//!   { "assistant": "21 degrees." }
//! ]
//! ```
//!
//! Token counts are never persisted; they are recomputed on demand after load.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use gee_types::{Message, Role};

const NAME_KEY: &str = "name";

/// On-disk form of a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
}

impl StoredMessage {
    #[must_use]
    pub fn encode(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
            name: message.name().map(str::to_string),
        }
    }

    #[must_use]
    pub fn decode(self) -> Message {
        Message::new(self.role, self.content, self.name)
    }
}

impl Serialize for StoredMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.name.is_some() { 2 } else { 1 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(self.role.as_str(), &self.content)?;
        if let Some(name) = &self.name {
            map.serialize_entry(NAME_KEY, name)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StoredMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(StoredMessageVisitor)
    }
}

struct StoredMessageVisitor;

impl<'de> Visitor<'de> for StoredMessageVisitor {
    type Value = StoredMessage;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map with exactly one role key and an optional name")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entry: Option<(Role, String)> = None;
        let mut name: Option<String> = None;

        while let Some(key) = map.next_key::<String>()? {
            if key == NAME_KEY {
                if name.is_some() {
                    return Err(de::Error::duplicate_field(NAME_KEY));
                }
                name = Some(map.next_value()?);
                continue;
            }

            let Some(role) = Role::parse(&key) else {
                return Err(de::Error::custom(format!("unknown role `{key}`")));
            };
            if let Some((existing, _)) = &entry {
                return Err(de::Error::custom(format!(
                    "message has more than one role (`{existing}` and `{role}`)"
                )));
            }
            entry = Some((role, map.next_value()?));
        }

        let (role, content) = entry.ok_or_else(|| de::Error::custom("message has no role key"))?;
        Ok(StoredMessage {
            role,
            content,
            name,
        })
    }
}

/// Serialize a history to its durable text form.
pub fn encode_history(messages: &[Message]) -> serde_json::Result<String> {
    let records: Vec<StoredMessage> = messages.iter().map(StoredMessage::encode).collect();
    let mut text = serde_json::to_string_pretty(&records)?;
    text.push('\n');
    Ok(text)
}

/// Parse a history from its durable text form.
pub fn decode_history(text: &str) -> serde_json::Result<Vec<Message>> {
    let records: Vec<StoredMessage> = serde_json::from_str(text)?;
    Ok(records.into_iter().map(StoredMessage::decode).collect())
}
