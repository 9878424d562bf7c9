use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{
    decode_messages, encode_messages, non_empty, Message, MessageStore, LAST_USER_KEY,
    MESSAGES_KEY,
};
use crate::error::RelayError;

const BACKEND: &str = "cloudflare";

/// Cloudflare Workers KV through the v4 REST API.
///
/// Workers KV has no conditional write. Appends are serialized inside this
/// process; two processes writing the same namespace can still overwrite
/// each other.
pub struct CloudflareKvStore {
    client: reqwest::Client,
    namespace_url: String,
    token: String,
    write_lock: Mutex<()>,
}

impl CloudflareKvStore {
    pub fn new(
        client: reqwest::Client,
        api_base_url: &str,
        account_id: &str,
        namespace_id: &str,
        token: &str,
    ) -> Self {
        Self {
            client,
            namespace_url: format!(
                "{}/accounts/{}/storage/kv/namespaces/{}",
                api_base_url.trim_end_matches('/'),
                account_id,
                namespace_id
            ),
            token: token.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.namespace_url, key)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        let response = self
            .client
            .get(self.value_url(key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::unavailable(BACKEND, format!("GET {} failed: {}", key, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::unavailable(
                BACKEND,
                format!("GET {} returned {}: {}", key, status, body),
            ));
        }

        let value = response.text().await.map_err(|e| {
            RelayError::unavailable(BACKEND, format!("GET {} body unreadable: {}", key, e))
        })?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), RelayError> {
        let response = self
            .client
            .put(self.value_url(key))
            .bearer_auth(&self.token)
            .header("Content-Type", "text/plain")
            .body(value)
            .send()
            .await
            .map_err(|e| RelayError::unavailable(BACKEND, format!("PUT {} failed: {}", key, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::unavailable(
                BACKEND,
                format!("PUT {} returned {}: {}", key, status, body),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for CloudflareKvStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn read_all(&self) -> Result<Vec<Message>, RelayError> {
        match self.get(MESSAGES_KEY).await? {
            Some(raw) => decode_messages(BACKEND, &raw),
            None => Ok(Vec::new()),
        }
    }

    async fn read_last_sender_id(&self) -> Result<Option<String>, RelayError> {
        Ok(non_empty(self.get(LAST_USER_KEY).await?))
    }

    #[instrument(skip(self, message), fields(backend = BACKEND, message_id = %message.id))]
    async fn append(&self, message: Message, sender_id: Option<&str>) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;

        let mut messages = self.read_all().await?;
        messages.push(message);
        self.put(MESSAGES_KEY, encode_messages(BACKEND, &messages)?)
            .await?;

        if let Some(id) = sender_id {
            self.put(LAST_USER_KEY, id.to_string()).await?;
        }

        debug!("Conversation now holds {} messages", messages.len());
        Ok(())
    }
}
