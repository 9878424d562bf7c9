use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{non_empty, ConversationState, Message, MessageStore};
use crate::error::RelayError;

const BACKEND: &str = "file";

/// The whole conversation as one JSON document on local disk.
///
/// Every append rewrites the document through a temp file and a rename,
/// so a crash mid-write leaves the previous version in place.
pub struct FileStore {
    path: PathBuf,
    timeout: Duration,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<ConversationState, RelayError> {
        let read = bounded(self.timeout, tokio::fs::read_to_string(&self.path)).await?;
        match read {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| RelayError::malformed(BACKEND, e))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ConversationState::default()),
            Err(e) => Err(RelayError::unavailable(
                BACKEND,
                format!("failed to read {}: {}", self.path.display(), e),
            )),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<(), RelayError> {
        let json =
            serde_json::to_string_pretty(state).map_err(|e| RelayError::malformed(BACKEND, e))?;

        let tmp_path = self.temp_path();
        let write = async {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp_path, json.as_bytes()).await?;
            tokio::fs::rename(&tmp_path, &self.path).await
        };

        bounded(self.timeout, write).await?.map_err(|e| {
            RelayError::unavailable(
                BACKEND,
                format!("failed to write {}: {}", self.path.display(), e),
            )
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "messages.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl MessageStore for FileStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn read_all(&self) -> Result<Vec<Message>, RelayError> {
        Ok(self.load().await?.messages)
    }

    async fn read_last_sender_id(&self) -> Result<Option<String>, RelayError> {
        Ok(non_empty(self.load().await?.last_user_id))
    }

    #[instrument(skip(self, message), fields(backend = BACKEND, message_id = %message.id))]
    async fn append(&self, message: Message, sender_id: Option<&str>) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.load().await?;
        state.push(message, sender_id);
        self.save(&state).await?;

        debug!("Conversation now holds {} messages", state.messages.len());
        Ok(())
    }
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RelayError::unavailable(BACKEND, format!("timed out after {:?}", timeout)))
}
