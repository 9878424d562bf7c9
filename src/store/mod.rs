pub mod cloudflare;
pub mod file;
pub mod selector;
pub mod upstash;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Key holding the JSON message array on the remote stores
pub const MESSAGES_KEY: &str = "chat_messages";
/// Key holding the most recent LINE sender on the remote stores
pub const LAST_USER_KEY: &str = "last_user_id";

/// Who wrote a message. The wire names match the documents the web chat
/// has always written: the operator is "user", the LINE side is "line".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user", alias = "operator")]
    Operator,
    #[serde(rename = "line", alias = "remote-user")]
    RemoteUser,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A message received from LINE. Falls back to a random id when the
    /// platform did not supply one.
    pub fn from_remote(provider_id: Option<String>, text: String) -> Self {
        Self {
            id: provider_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            sender: Sender::RemoteUser,
            text,
            timestamp: now(),
        }
    }

    /// A message written by the operator, id derived from the clock.
    pub fn from_operator(text: String) -> Self {
        let timestamp = now();
        Self {
            id: timestamp.timestamp_millis().to_string(),
            sender: Sender::Operator,
            text,
            timestamp,
        }
    }
}

/// The whole persisted conversation: the ordered log plus the pointer to
/// the last LINE user who wrote in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_id: Option<String>,
}

impl ConversationState {
    pub fn push(&mut self, message: Message, sender_id: Option<&str>) {
        self.messages.push(message);
        if let Some(id) = sender_id {
            self.last_user_id = Some(id.to_string());
        }
    }
}

/// Storage for the single conversation. Every backend gives the same
/// guarantees: absent data reads as empty, I/O failures are errors and
/// never silently replaced by defaults, appends never reorder or drop
/// earlier entries.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    /// The full log in conversation order
    async fn read_all(&self) -> Result<Vec<Message>, RelayError>;

    /// The most recent LINE sender, if anyone has written in yet
    async fn read_last_sender_id(&self) -> Result<Option<String>, RelayError>;

    /// Add `message` to the end of the log; overwrite the sender pointer
    /// when `sender_id` is given.
    async fn append(&self, message: Message, sender_id: Option<&str>) -> Result<(), RelayError>;
}

/// Millisecond precision, matching what the web client renders.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Decode the message array stored under [`MESSAGES_KEY`].
pub(crate) fn decode_messages(backend: &'static str, raw: &str) -> Result<Vec<Message>, RelayError> {
    serde_json::from_str(raw).map_err(|e| RelayError::malformed(backend, e))
}

pub(crate) fn encode_messages(backend: &'static str, messages: &[Message]) -> Result<String, RelayError> {
    serde_json::to_string(messages).map_err(|e| RelayError::malformed(backend, e))
}

/// Empty pointers are treated as unset.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
