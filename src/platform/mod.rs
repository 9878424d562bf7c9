pub mod line;

use async_trait::async_trait;

use crate::error::RelayError;

/// A text message received from the chat platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Platform user ID of the sender, when the platform disclosed it
    pub sender_id: Option<String>,
    /// The message text
    pub text: String,
    /// Platform-assigned message ID
    pub provider_id: Option<String>,
}

/// Outbound channel back to the chat platform
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), RelayError>;
}
