use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};

use super::cloudflare::CloudflareKvStore;
use super::file::FileStore;
use super::upstash::UpstashStore;
use super::MessageStore;
use crate::config::{http_client, StorageConfig};

const UPSTASH_KEYS: [&str; 2] = ["UPSTASH_REDIS_REST_URL", "UPSTASH_REDIS_REST_TOKEN"];
/// Vercel KV is Upstash underneath and uses these names for the same pair
const VERCEL_KV_KEYS: [&str; 2] = ["KV_REST_API_URL", "KV_REST_API_TOKEN"];
const CLOUDFLARE_KEYS: [&str; 3] = [
    "CLOUDFLARE_ACCOUNT_ID",
    "CLOUDFLARE_KV_NAMESPACE_ID",
    "CLOUDFLARE_API_TOKEN",
];

/// Which store holds the conversation, decided once at startup.
///
/// Priority is fixed: Upstash (or its Vercel KV names), then Cloudflare
/// Workers KV, then the local file.
#[derive(Clone, PartialEq, Eq)]
pub enum BackendSelection {
    Upstash {
        url: String,
        token: String,
    },
    Cloudflare {
        account_id: String,
        namespace_id: String,
        api_token: String,
    },
    LocalFile,
}

impl BackendSelection {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Pure selection over a variable lookup. Blank values count as unset;
    /// a credential set that is only partly present is an error rather
    /// than a silent fall-through to the next backend.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let upstash = match credentials(&get, "Upstash", &UPSTASH_KEYS)? {
            Some(values) => Some(values),
            None => credentials(&get, "Vercel KV", &VERCEL_KV_KEYS)?,
        };
        let cloudflare = credentials(&get, "Cloudflare KV", &CLOUDFLARE_KEYS)?;

        if let Some(mut values) = upstash {
            if cloudflare.is_some() {
                warn!("Both Upstash and Cloudflare KV are configured; using Upstash");
            }
            let token = values.pop().unwrap_or_default();
            let url = values.pop().unwrap_or_default();
            return Ok(BackendSelection::Upstash { url, token });
        }

        if let Some(mut values) = cloudflare {
            let api_token = values.pop().unwrap_or_default();
            let namespace_id = values.pop().unwrap_or_default();
            let account_id = values.pop().unwrap_or_default();
            return Ok(BackendSelection::Cloudflare {
                account_id,
                namespace_id,
                api_token,
            });
        }

        Ok(BackendSelection::LocalFile)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendSelection::Upstash { .. } => "upstash",
            BackendSelection::Cloudflare { .. } => "cloudflare",
            BackendSelection::LocalFile => "file",
        }
    }

    /// Build the selected store.
    pub fn open(&self, config: &StorageConfig) -> Result<Arc<dyn MessageStore>> {
        let timeout = config.timeout();
        let store: Arc<dyn MessageStore> = match self {
            BackendSelection::LocalFile => {
                info!("Storing messages in {}", config.file_path.display());
                Arc::new(FileStore::new(&config.file_path, timeout))
            }
            BackendSelection::Upstash { url, token } => {
                info!("Storing messages in Upstash Redis at {}", url);
                Arc::new(UpstashStore::new(
                    http_client(timeout)?,
                    url,
                    token,
                    config.max_append_attempts,
                ))
            }
            BackendSelection::Cloudflare {
                account_id,
                namespace_id,
                api_token,
            } => {
                info!("Storing messages in Cloudflare KV namespace {}", namespace_id);
                warn!("Cloudflare KV has no conditional writes; run a single relay instance");
                Arc::new(CloudflareKvStore::new(
                    http_client(timeout)?,
                    &config.cloudflare_api_base_url,
                    account_id,
                    namespace_id,
                    api_token,
                ))
            }
        };
        Ok(store)
    }
}

/// Credentials stay out of debug output.
impl fmt::Debug for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSelection::Upstash { url, .. } => {
                f.debug_struct("Upstash").field("url", url).finish_non_exhaustive()
            }
            BackendSelection::Cloudflare {
                account_id,
                namespace_id,
                ..
            } => f
                .debug_struct("Cloudflare")
                .field("account_id", account_id)
                .field("namespace_id", namespace_id)
                .finish_non_exhaustive(),
            BackendSelection::LocalFile => write!(f, "LocalFile"),
        }
    }
}

/// All values of `keys` in order, `None` if none is set.
fn credentials<F>(get: &F, backend: &str, keys: &[&str]) -> Result<Option<Vec<String>>>
where
    F: Fn(&str) -> Option<String>,
{
    let values: Vec<Option<String>> = keys.iter().map(|key| get(*key)).collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }

    let missing: Vec<&str> = keys
        .iter()
        .zip(&values)
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| *key)
        .collect();
    if !missing.is_empty() {
        bail!(
            "Incomplete {} credentials: {} not set",
            backend,
            missing.join(", ")
        );
    }

    Ok(Some(values.into_iter().flatten().collect()))
}
