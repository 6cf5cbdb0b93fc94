//! Message types for the transport: addresses, work items and receive results.

use crate::error::{ProcessingError, ValidationError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Addressing
// ============================================================================

/// Logical destination: a queue name with an optional scope.
///
/// The textual form is `queue` or `queue@scope`, where the scope names the
/// schema or connection that hosts the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    queue: String,
    scope: Option<String>,
}

impl Address {
    /// Create an unscoped address
    pub fn new(queue: impl Into<String>) -> Result<Self, ValidationError> {
        let queue = queue.into();
        let trimmed = queue.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Required {
                field: "address.queue".to_string(),
            });
        }
        if trimmed.contains('@') {
            return Err(ValidationError::InvalidFormat {
                field: "address.queue".to_string(),
                message: "queue name cannot contain '@'".to_string(),
            });
        }

        Ok(Self {
            queue: trimmed.to_string(),
            scope: None,
        })
    }

    /// Attach a scope to the address
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        let trimmed = scope.trim();
        self.scope = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}@{}", self.queue, scope),
            None => write!(f, "{}", self.queue),
        }
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((queue, scope)) => Ok(Self::new(queue)?.with_scope(scope)),
            None => Self::new(s),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Ordered string map with unique keys.
///
/// Insertion order is preserved because the envelope writes headers in the
/// order the host added them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace a header, keeping the original position on replace.
    ///
    /// Returns the previous value when the key was already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    /// Append a header, failing if the key is already present
    pub fn try_insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(ValidationError::InvalidFormat {
                field: "headers".to_string(),
                message: format!("duplicate key '{}'", key),
            });
        }
        self.0.push((key, value.into()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl TryFrom<Vec<(String, String)>> for Headers {
    type Error = ValidationError;

    fn try_from(pairs: Vec<(String, String)>) -> Result<Self, Self::Error> {
        let mut headers = Headers::new();
        for (key, value) in pairs {
            headers.try_insert(key, value)?;
        }
        Ok(headers)
    }
}

impl From<Headers> for Vec<(String, String)> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

// ============================================================================
// Work Items
// ============================================================================

/// Intent of a work item as understood by the host bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIntent {
    #[default]
    Send,
    Publish,
    Subscribe,
    Unsubscribe,
    Reply,
}

impl MessageIntent {
    /// Tag written into the envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::Reply => "Reply",
        }
    }
}

impl std::fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageIntent {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Send" => Ok(Self::Send),
            "Publish" => Ok(Self::Publish),
            "Subscribe" => Ok(Self::Subscribe),
            "Unsubscribe" => Ok(Self::Unsubscribe),
            "Reply" => Ok(Self::Reply),
            other => Err(ValidationError::InvalidFormat {
                field: "message_intent".to_string(),
                message: format!("unknown intent '{}'", other),
            }),
        }
    }
}

/// A decoded work item handed to the host's processing callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub message_intent: MessageIntent,
    #[serde(default)]
    pub reply_to_address: Option<Address>,
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_recoverable() -> bool {
    true
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        general_purpose::STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl TransportMessage {
    /// Create a recoverable `Send` work item with a fresh id
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: new_message_id(),
            headers: Headers::new(),
            body: body.into(),
            correlation_id: None,
            message_intent: MessageIntent::default(),
            reply_to_address: None,
            recoverable: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_intent(mut self, intent: MessageIntent) -> Self {
        self.message_intent = intent;
        self
    }

    pub fn with_reply_to_address(mut self, address: Address) -> Self {
        self.reply_to_address = Some(address);
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

/// Per-send options that shape the envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Overrides the work item's own reply-to address when set
    pub reply_to_address: Option<Address>,
}

impl SendOptions {
    pub fn with_reply_to_address(mut self, address: Address) -> Self {
        self.reply_to_address = Some(address);
        self
    }
}

/// An undecoded item as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Envelope bytes, kept verbatim for poison forwarding
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    /// Broker-assigned identifier; empty until enqueued
    pub message_id: Vec<u8>,
}

impl RawMessage {
    /// Create an outgoing raw message; the broker assigns the id on enqueue
    pub fn new(payload: impl Into<Bytes>, correlation_id: Option<String>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id,
            message_id: Vec::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: Vec<u8>) -> Self {
        self.message_id = message_id;
        self
    }
}

// ============================================================================
// Receive Results
// ============================================================================

/// Outcome of one dequeue attempt on a queue handle
#[derive(Debug)]
pub enum MessageReadResult {
    NoMessage,
    /// The payload could not be decoded; the raw bytes are kept unchanged
    Poison(RawMessage),
    Success(TransportMessage),
}

/// Outcome of one receive cycle run by a receive strategy
#[derive(Debug)]
pub enum ReceiveResult {
    NoMessage,
    Received(TransportMessage),
    FailedProcessing {
        message: TransportMessage,
        error: ProcessingError,
    },
}

impl ReceiveResult {
    /// The work item the cycle saw, if any
    pub fn message(&self) -> Option<&TransportMessage> {
        match self {
            Self::NoMessage => None,
            Self::Received(message) => Some(message),
            Self::FailedProcessing { message, .. } => Some(message),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::FailedProcessing { .. })
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
