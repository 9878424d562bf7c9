use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{InboundEvent, PushSender};
use crate::config::LineConfig;
use crate::error::RelayError;

/// Body of a LINE Messaging API webhook call
#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl WebhookBody {
    /// Text messages in delivery order. Follows, stickers, images and the
    /// like are skipped.
    pub fn into_inbound(self) -> Vec<InboundEvent> {
        self.events
            .into_iter()
            .filter_map(|event| {
                if event.event_type != "message" {
                    debug!("Skipping LINE {} event", event.event_type);
                    return None;
                }
                let message = event.message?;
                if message.message_type != "text" {
                    debug!("Skipping LINE {} message", message.message_type);
                    return None;
                }
                Some(InboundEvent {
                    sender_id: event.source.and_then(|s| s.user_id),
                    text: message.text.unwrap_or_default(),
                    provider_id: message.id,
                })
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: [TextMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    text: &'a str,
}

/// Client for the LINE push message endpoint
pub struct LinePushClient {
    client: reqwest::Client,
    base_url: String,
    channel_access_token: String,
}

impl LinePushClient {
    pub fn new(client: reqwest::Client, config: &LineConfig) -> Self {
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            channel_access_token: config.channel_access_token.clone(),
        }
    }
}

#[async_trait]
impl PushSender for LinePushClient {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), RelayError> {
        let url = format!("{}/v2/bot/message/push", self.base_url);
        let request = PushRequest {
            to: recipient_id,
            messages: [TextMessage {
                message_type: "text",
                text,
            }],
        };

        debug!("Pushing message to LINE: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.channel_access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::PushFailed {
                reason: format!("request to LINE failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(RelayError::PushFailed {
                reason: format!("LINE API error ({}): {}", status, error_body),
            });
        }

        info!("Pushed message to LINE user {}", recipient_id);
        Ok(())
    }
}
