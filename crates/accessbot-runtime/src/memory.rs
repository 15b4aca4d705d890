use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use accessbot_contracts::{
    AccessRequest, PingResponse, PluginDataKey, PluginDataMap, RawEvent, RequestFilter,
    RequestState, StateUpdate, WatchFilter,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::authority::{AccessRequestAuthority, RawEventStream};
use crate::error::{Error, Result};

type StreamItem = Result<RawEvent>;

struct Subscriber {
    filter: WatchFilter,
    tx: mpsc::UnboundedSender<StreamItem>,
}

#[derive(Default)]
struct MemoryState {
    requests: BTreeMap<String, AccessRequest>,
    plugin_data: HashMap<PluginDataKey, PluginDataMap>,
    subscribers: Vec<Subscriber>,
    watch_failures: VecDeque<Error>,
}

impl MemoryState {
    fn publish(&mut self, event: &RawEvent, req: Option<&AccessRequest>) {
        self.subscribers.retain(|sub| {
            if let Some(req) = req {
                if !sub.filter.matches(req) {
                    return !sub.tx.is_closed();
                }
            }
            sub.tx.send(Ok(event.clone())).is_ok()
        });
    }
}

/// In-process authority: requests, plugin data and live event streams.
///
/// Backs tests and the `memory` authority type. The extra methods let tests
/// inject raw stream traffic and transport failures.
pub struct MemoryAuthority {
    state: Mutex<MemoryState>,
    server_version: String,
    watch_attempts: AtomicU64,
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::with_version(env!("CARGO_PKG_VERSION"))
    }

    pub fn with_version(server_version: &str) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            server_version: server_version.to_string(),
            watch_attempts: AtomicU64::new(0),
        }
    }

    /// Removes a request and its plugin data, as expiry does.
    pub async fn delete_access_request(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.requests.remove(id).is_none() {
            return Err(Error::not_found(format!("access request {id} not found")));
        }
        state.plugin_data.retain(|key, _| key.resource != id);
        state.publish(&RawEvent::delete(id), None);
        Ok(())
    }

    /// The next `watch_events` calls fail with these errors, in order.
    pub async fn fail_next_watches(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().await.watch_failures.extend(errors);
    }

    /// Pushes a raw event to every open stream, bypassing filters.
    pub async fn inject_raw(&self, event: RawEvent) {
        let mut state = self.state.lock().await;
        state
            .subscribers
            .retain(|sub| sub.tx.send(Ok(event.clone())).is_ok());
    }

    /// Terminates every open stream with `err`.
    pub async fn break_streams(&self, err: Error) {
        let mut state = self.state.lock().await;
        for sub in state.subscribers.drain(..) {
            let _ = sub.tx.send(Err(err.clone()));
        }
    }

    /// Ends every open stream without an error.
    pub async fn close_streams(&self) {
        self.state.lock().await.subscribers.clear();
    }

    pub async fn open_streams(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    pub fn watch_attempts(&self) -> u64 {
        self.watch_attempts.load(Ordering::SeqCst)
    }

    pub async fn plugin_data(&self, key: &PluginDataKey) -> PluginDataMap {
        self.state
            .lock()
            .await
            .plugin_data
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AccessRequestAuthority for MemoryAuthority {
    async fn ping(&self) -> Result<PingResponse> {
        Ok(PingResponse {
            server_version: self.server_version.clone(),
            cluster_name: "memory".to_string(),
            proxy_public_addr: String::new(),
            features: BTreeMap::new(),
        })
    }

    async fn create_access_request(&self, mut req: AccessRequest) -> Result<AccessRequest> {
        if req.user.is_empty() || req.roles.is_empty() {
            return Err(Error::bad_parameter(
                "access request needs a user and at least one role",
            ));
        }
        let mut state = self.state.lock().await;
        if req.id.is_empty() {
            req.id = uuid::Uuid::new_v4().to_string();
        } else if state.requests.contains_key(&req.id) {
            return Err(Error::bad_parameter(format!(
                "access request {} already exists",
                req.id
            )));
        }
        req.state = RequestState::Pending;
        req.created = Utc::now();
        state.requests.insert(req.id.clone(), req.clone());
        state.publish(&RawEvent::put(req.clone()), Some(&req));
        debug!(request_id = %req.id, user = %req.user, "created access request");
        Ok(req)
    }

    async fn get_access_requests(&self, filter: &RequestFilter) -> Result<Vec<AccessRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|req| filter.matches(req))
            .cloned()
            .collect())
    }

    async fn set_access_request_state(&self, id: &str, update: StateUpdate) -> Result<()> {
        if !update.state.is_resolved() {
            return Err(Error::bad_parameter(
                "access requests can only be approved or denied",
            ));
        }
        let mut state = self.state.lock().await;
        let req = state
            .requests
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("access request {id} not found")))?;
        if req.state.is_resolved() {
            return Err(Error::bad_parameter(format!(
                "access request {id} is already {}",
                req.state
            )));
        }
        req.state = update.state;
        req.resolve_reason = update.reason;
        req.resolve_annotations
            .insert("delegator".to_string(), vec![update.delegator]);
        let req = req.clone();
        state.publish(&RawEvent::put(req.clone()), Some(&req));
        Ok(())
    }

    async fn watch_events(&self, filter: &WatchFilter) -> Result<RawEventStream> {
        self.watch_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(err) = state.watch_failures.pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(Ok(RawEvent::init()));
        state.subscribers.push(Subscriber {
            filter: filter.clone(),
            tx,
        });
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn get_plugin_data(&self, key: &PluginDataKey) -> Result<PluginDataMap> {
        let state = self.state.lock().await;
        state
            .plugin_data
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no plugin data for {}", key.resource)))
    }

    async fn update_plugin_data(
        &self,
        key: &PluginDataKey,
        set: PluginDataMap,
        expect: Option<PluginDataMap>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.requests.contains_key(&key.resource) {
            return Err(Error::not_found(format!(
                "access request {} not found",
                key.resource
            )));
        }
        if let Some(expect) = expect {
            let current = state.plugin_data.get(key);
            for (k, want) in &expect {
                let have = current
                    .and_then(|data| data.get(k))
                    .map(String::as_str)
                    .unwrap_or_default();
                if have != want {
                    return Err(Error::compare_failed(format!(
                        "plugin data key {k:?} of {} has changed",
                        key.resource
                    )));
                }
            }
        }
        let current = state.plugin_data.entry(key.clone()).or_default();
        for (k, v) in set {
            if v.is_empty() {
                current.remove(&k);
            } else {
                current.insert(k, v);
            }
        }
        Ok(())
    }
}
