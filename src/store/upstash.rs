use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{
    decode_messages, encode_messages, non_empty, Message, MessageStore, LAST_USER_KEY,
    MESSAGES_KEY,
};
use crate::error::RelayError;

const BACKEND: &str = "upstash";

/// Writes ARGV[2] only if the key still holds ARGV[1] ('' meaning absent).
const COMPARE_AND_SET: &str = "\
local current = redis.call('GET', KEYS[1])
if current == false then current = '' end
if current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0";

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Redis over the Upstash REST protocol (also what Vercel KV serves).
///
/// The log lives under `chat_messages` as one JSON array and is replaced
/// wholesale on append, guarded by a server-side compare-and-swap so a
/// concurrent writer in another process is detected instead of overwritten.
pub struct UpstashStore {
    client: reqwest::Client,
    url: String,
    token: String,
    max_attempts: u32,
    write_lock: Mutex<()>,
}

impl UpstashStore {
    pub fn new(client: reqwest::Client, url: &str, token: &str, max_attempts: u32) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            max_attempts: max_attempts.max(1),
            write_lock: Mutex::new(()),
        }
    }

    async fn command(&self, args: &[&str]) -> Result<Value, RelayError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(|e| RelayError::unavailable(BACKEND, format!("{} failed: {}", args[0], e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::unavailable(
                BACKEND,
                format!("{} returned {}: {}", args[0], status, body),
            ));
        }

        let body: CommandResponse = response.json().await.map_err(|e| {
            RelayError::unavailable(BACKEND, format!("unreadable {} response: {}", args[0], e))
        })?;
        match body.error {
            Some(error) => Err(RelayError::unavailable(
                BACKEND,
                format!("{} rejected: {}", args[0], error),
            )),
            None => Ok(body.result),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(RelayError::malformed(
                BACKEND,
                format!("GET {} returned {}", key, other),
            )),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError> {
        self.command(&["SET", key, value]).await?;
        Ok(())
    }

    /// Returns false when someone else changed the key since `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, RelayError> {
        let result = self
            .command(&["EVAL", COMPARE_AND_SET, "1", key, expected.unwrap_or(""), value])
            .await?;
        Ok(result.as_i64() == Some(1))
    }
}

#[async_trait]
impl MessageStore for UpstashStore {
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

        for attempt in 1..=self.max_attempts {
            let current = self.get(MESSAGES_KEY).await?;
            let mut messages = match current.as_deref() {
                Some(raw) => decode_messages(BACKEND, raw)?,
                None => Vec::new(),
            };
            messages.push(message.clone());
            let encoded = encode_messages(BACKEND, &messages)?;

            if self
                .compare_and_set(MESSAGES_KEY, current.as_deref(), &encoded)
                .await?
            {
                if let Some(id) = sender_id {
                    self.set(LAST_USER_KEY, id).await?;
                }
                debug!("Conversation now holds {} messages", messages.len());
                return Ok(());
            }

            warn!(
                "{} changed during append (attempt {}/{})",
                MESSAGES_KEY, attempt, self.max_attempts
            );
        }

        Err(RelayError::LostUpdate {
            backend: BACKEND,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::http_client;
    use crate::store::Sender;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Minimal in-memory Redis answering GET, SET and the swap script.
    #[derive(Default)]
    struct FakeRedis {
        data: std::sync::Mutex<HashMap<String, String>>,
    }

    impl Respond for FakeRedis {
        fn respond(&self, req: &Request) -> ResponseTemplate {
            let args = command_args(req);
            let mut data = self.data.lock().unwrap();
            let result = match args.first().map(String::as_str) {
                Some("GET") => data.get(&args[1]).map_or(Value::Null, |v| json!(v)),
                Some("SET") => {
                    data.insert(args[1].clone(), args[2].clone());
                    json!("OK")
                }
                Some("EVAL") => {
                    let current = data.get(&args[3]).cloned().unwrap_or_default();
                    if current == args[4] {
                        data.insert(args[3].clone(), args[5].clone());
                        json!(1)
                    } else {
                        json!(0)
                    }
                }
                _ => {
                    return ResponseTemplate::new(400)
                        .set_body_json(json!({ "error": "ERR unknown command" }))
                }
            };
            ResponseTemplate::new(200).set_body_json(json!({ "result": result }))
        }
    }

    fn command_args(req: &Request) -> Vec<String> {
        serde_json::from_slice(&req.body).unwrap_or_default()
    }

    fn is_command(name: &'static str) -> impl Fn(&Request) -> bool + Send + Sync {
        move |req: &Request| command_args(req).first().map(String::as_str) == Some(name)
    }

    fn store(server: &MockServer) -> UpstashStore {
        UpstashStore::new(reqwest::Client::new(), &server.uri(), "tok", 3)
    }

    fn stored_log(messages: &[Message]) -> String {
        serde_json::to_string(messages).unwrap()
    }

    #[tokio::test]
    async fn test_empty_database_reads_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .mount(&server)
            .await;

        let store = store(&server);
        assert!(store.read_all().await.unwrap().is_empty());
        assert_eq!(store.read_last_sender_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reads_log_and_pointer() {
        let server = MockServer::start().await;
        let log = vec![Message::from_remote(Some("1".into()), "hello".into())];
        Mock::given(method("POST"))
            .and(body_json(json!(["GET", "chat_messages"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": stored_log(&log) })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["GET", "last_user_id"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "U1" })))
            .mount(&server)
            .await;

        let store = store(&server);
        assert_eq!(store.read_all().await.unwrap(), log);
        assert_eq!(store.read_last_sender_id().await.unwrap().as_deref(), Some("U1"));
    }

    #[tokio::test]
    async fn test_append_swaps_against_absent_log_and_sets_pointer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["GET", "chat_messages"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .and(|req: &Request| {
                let args = command_args(req);
                if args.len() != 6 {
                    return false;
                }
                let written: Vec<Message> = serde_json::from_str(&args[5]).unwrap_or_default();
                args[3] == "chat_messages"
                    && args[4].is_empty()
                    && written.len() == 1
                    && written[0].sender == Sender::RemoteUser
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!(["SET", "last_user_id", "U1"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .append(Message::from_remote(Some("1".into()), "hello".into()), Some("U1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operator_append_leaves_pointer_alone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(is_command("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("SET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" })))
            .expect(0)
            .mount(&server)
            .await;

        store(&server)
            .append(Message::from_operator("hi".into()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conflict_is_retried_against_fresh_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(is_command("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 0 })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
            .mount(&server)
            .await;

        store(&server)
            .append(Message::from_operator("hi".into()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_persistent_conflict_reports_lost_update() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(is_command("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "[]" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 0 })))
            .expect(3)
            .mount(&server)
            .await;

        let err = store(&server)
            .append(Message::from_remote(None, "x".into()), Some("U1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::LostUpdate {
                backend: "upstash",
                attempts: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_malformed_log_is_not_reset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(is_command("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "{oops" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
            .expect(0)
            .mount(&server)
            .await;

        let store = store(&server);
        assert!(matches!(
            store.read_all().await.unwrap_err(),
            RelayError::MalformedState { .. }
        ));
        assert!(matches!(
            store
                .append(Message::from_operator("x".into()), None)
                .await
                .unwrap_err(),
            RelayError::MalformedState { .. }
        ));
    }

    #[tokio::test]
    async fn test_http_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let err = store(&server).read_all().await.unwrap_err();
        assert!(matches!(err, RelayError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_command_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "ERR max requests limit exceeded" })),
            )
            .mount(&server)
            .await;

        let err = store(&server).read_last_sender_id().await.unwrap_err();
        assert!(err.to_string().contains("max requests limit"));
    }

    #[tokio::test]
    async fn test_slow_server_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": null }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = http_client(Duration::from_millis(200)).unwrap();
        let store = UpstashStore::new(client, &server.uri(), "tok", 3);

        let started = std::time::Instant::now();
        let err = store.read_all().await.unwrap_err();
        assert!(matches!(err, RelayError::BackendUnavailable { backend: "upstash", .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_pointer_write_failure_keeps_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(is_command("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("EVAL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(is_command("SET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .expect(1)
            .mount(&server)
            .await;

        let err = store(&server)
            .append(Message::from_remote(Some("1".into()), "hello".into()), Some("U1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("SET"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(FakeRedis::default())
            .mount(&server)
            .await;

        // One attempt only: any interleaving would surface as a lost update
        let store = Arc::new(UpstashStore::new(reqwest::Client::new(), &server.uri(), "tok", 1));

        let tasks = (0..10).map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let msg = Message::from_remote(Some(format!("m{i}")), "hi".into());
                store.append(msg, Some(&format!("U{i}"))).await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let messages = store.read_all().await.unwrap();
        assert_eq!(messages.len(), 10);
        let mut ids: Vec<_> = messages.into_iter().map(|m| m.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert!(store.read_last_sender_id().await.unwrap().is_some());
    }
}
