use std::sync::Arc;

use tracing::{error, info};

use crate::config::DispatchOrder;
use crate::error::RelayError;
use crate::platform::{InboundEvent, PushSender};
use crate::store::{Message, MessageStore};

/// The single conversation between the operator and whoever last wrote in
/// on LINE. Owns the selected store and the push client; shared by every
/// request handler.
pub struct Relay {
    store: Arc<dyn MessageStore>,
    push: Arc<dyn PushSender>,
    order: DispatchOrder,
}

impl Relay {
    pub fn new(
        store: Arc<dyn MessageStore>,
        push: Arc<dyn PushSender>,
        order: DispatchOrder,
    ) -> Self {
        Self { store, push, order }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    /// The full log, straight from the store.
    pub async fn messages(&self) -> Result<Vec<Message>, RelayError> {
        self.store.read_all().await
    }

    /// Record inbound messages one append at a time, in delivery order.
    /// Stops at the first failure; earlier events stay recorded.
    pub async fn ingest(&self, events: Vec<InboundEvent>) -> Result<usize, RelayError> {
        let mut recorded = 0;
        for event in events {
            let sender_id = event.sender_id.filter(|id| !id.is_empty());
            let message = Message::from_remote(event.provider_id, event.text);

            info!(
                "LINE message {} from {}",
                message.id,
                sender_id.as_deref().unwrap_or("unknown sender")
            );

            self.store
                .append(message, sender_id.as_deref())
                .await
                .inspect_err(|e| error!("Failed to record LINE message: {}", e))?;
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Push operator text to the last LINE sender and log it.
    pub async fn dispatch(&self, text: &str) -> Result<Message, RelayError> {
        if text.trim().is_empty() {
            return Err(RelayError::EmptyMessage);
        }

        let recipient = self
            .store
            .read_last_sender_id()
            .await?
            .ok_or(RelayError::NoRecipient)?;

        let message = Message::from_operator(text.to_string());

        match self.order {
            DispatchOrder::SendThenAppend => {
                self.push.send(&recipient, text).await?;
                self.store
                    .append(message.clone(), None)
                    .await
                    .inspect_err(|e| {
                        error!("Message delivered to {} but not recorded: {}", recipient, e)
                    })?;
            }
            DispatchOrder::AppendThenSend => {
                self.store.append(message.clone(), None).await?;
                self.push.send(&recipient, text).await.inspect_err(|e| {
                    error!("Message {} recorded but not delivered: {}", message.id, e)
                })?;
            }
        }

        info!("Operator message {} sent to {}", message.id, recipient);
        Ok(message)
    }
}
