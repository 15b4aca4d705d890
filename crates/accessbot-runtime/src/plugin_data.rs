use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::{PluginDataKey, PluginDataMap};
use accessbot_kernel::{cas_retry_delay, PluginDataCodec};
use tracing::debug;

use crate::authority::AccessRequestAuthority;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CasRetry {
    pub max_attempts: u32,
    pub step: Duration,
}

impl Default for CasRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_millis(200),
        }
    }
}

impl CasRetry {
    pub fn from_config(cfg: &accessbot_config::PluginData) -> Self {
        Self {
            max_attempts: cfg.cas_max_attempts.max(1),
            step: Duration::from_millis(cfg.cas_backoff_step_ms),
        }
    }
}

/// Plugin-scoped access to the annotation blob of access requests.
#[derive(Clone)]
pub struct PluginDataClient {
    authority: Arc<dyn AccessRequestAuthority>,
    plugin: String,
    retry: CasRetry,
}

impl PluginDataClient {
    pub fn new(
        authority: Arc<dyn AccessRequestAuthority>,
        plugin: impl Into<String>,
        retry: CasRetry,
    ) -> Self {
        Self {
            authority,
            plugin: plugin.into(),
            retry,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn authority(&self) -> &dyn AccessRequestAuthority {
        self.authority.as_ref()
    }

    /// Current data; an entry that does not exist yet reads as empty.
    pub async fn get(&self, request_id: &str) -> Result<PluginDataMap> {
        match self.authority.get_plugin_data(&self.key(request_id)).await {
            Ok(map) => Ok(map),
            Err(err) if err.is_not_found() => Ok(PluginDataMap::new()),
            Err(err) => Err(err),
        }
    }

    /// Single compare-and-swap. Conflicts surface as `CompareFailed`.
    pub async fn set(
        &self,
        request_id: &str,
        set: PluginDataMap,
        expect: Option<PluginDataMap>,
    ) -> Result<()> {
        self.authority
            .update_plugin_data(&self.key(request_id), set, expect)
            .await
    }

    /// Read-modify-write with bounded retries on CAS conflicts only.
    ///
    /// Returns the written map, or `None` when `change` reported no change.
    /// Keys removed by `change` are deleted.
    pub async fn modify<F>(&self, request_id: &str, mut change: F) -> Result<Option<PluginDataMap>>
    where
        F: FnMut(&mut PluginDataMap) -> bool + Send,
    {
        let mut attempt = 1;
        loop {
            let old = self.get(request_id).await?;
            let mut new = old.clone();
            if !change(&mut new) {
                return Ok(None);
            }
            let expect = expectation(&old, &new);
            let mut set = new.clone();
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                set.insert(key.clone(), String::new());
            }
            match self.set(request_id, set, Some(expect)).await {
                Ok(()) => return Ok(Some(new)),
                Err(err) if err.is_compare_failed() && attempt < self.retry.max_attempts => {
                    let delay = cas_retry_delay(attempt, self.retry.step);
                    debug!(
                        request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "plugin data changed concurrently, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.context(format!("update plugin data of {request_id}"))),
            }
        }
    }

    /// Typed variant of [`modify`](Self::modify) over a plugin's own schema.
    pub async fn update<T, F>(&self, request_id: &str, mut change: F) -> Result<Option<T>>
    where
        T: PluginDataCodec + Send,
        F: FnMut(&mut T) -> bool + Send,
    {
        let written = self
            .modify(request_id, |map| {
                let old = T::decode(map);
                let mut new = old.clone();
                if !change(&mut new) || new == old {
                    return false;
                }
                *map = new.encode();
                true
            })
            .await?;
        Ok(written.map(|map| T::decode(&map)))
    }

    pub async fn get_typed<T: PluginDataCodec>(&self, request_id: &str) -> Result<T> {
        Ok(T::decode(&self.get(request_id).await?))
    }

    fn key(&self, request_id: &str) -> PluginDataKey {
        PluginDataKey::access_request(request_id, &self.plugin)
    }
}

/// Expect every key either side touches to still hold what was read.
fn expectation(old: &PluginDataMap, new: &PluginDataMap) -> PluginDataMap {
    let mut expect = old.clone();
    for key in new.keys() {
        expect.entry(key.clone()).or_default();
    }
    expect
}

impl std::fmt::Debug for PluginDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDataClient")
            .field("plugin", &self.plugin)
            .field("retry", &self.retry)
            .finish()
    }
}
