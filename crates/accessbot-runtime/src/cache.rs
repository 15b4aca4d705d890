use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::AccessRequest;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TTL_TICKS: u64 = 60 * 60;
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("request cache is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedRequest<L> {
    pub request: AccessRequest,
    pub locator: L,
}

struct Entry<L> {
    cached: CachedRequest<L>,
    expiry: u64,
}

struct Inner<L> {
    tick: u64,
    next_expiry: Option<u64>,
    entries: HashMap<String, Entry<L>>,
    tainted: bool,
}

/// Process-local, tick-expiring map from request id to the last known request
/// and where it was posted.
pub struct RequestCache<L> {
    ttl: u64,
    inner: Mutex<Inner<L>>,
}

impl<L: Clone> RequestCache<L> {
    pub fn new(ttl_ticks: u64) -> Self {
        Self {
            ttl: ttl_ticks,
            inner: Mutex::new(Inner {
                tick: 0,
                next_expiry: None,
                entries: HashMap::new(),
                tainted: false,
            }),
        }
    }

    pub fn put(&self, request: AccessRequest, locator: L) -> Result<(), CacheError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.tainted {
            return Err(CacheError::Closed);
        }
        let expiry = inner.tick + self.ttl;
        inner.next_expiry = Some(inner.next_expiry.map_or(expiry, |next| next.min(expiry)));
        inner.entries.insert(
            request.id.clone(),
            Entry {
                cached: CachedRequest { request, locator },
                expiry,
            },
        );
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Result<Option<CachedRequest<L>>, CacheError> {
        let inner = self.inner.lock();
        if inner.tainted {
            return Err(CacheError::Closed);
        }
        Ok(inner.entries.get(request_id).map(|e| e.cached.clone()))
    }

    /// Fetch-and-remove. `Ok(None)` means the caller must ask the authority.
    pub fn pop(&self, request_id: &str) -> Result<Option<CachedRequest<L>>, CacheError> {
        let mut inner = self.inner.lock();
        if inner.tainted {
            return Err(CacheError::Closed);
        }
        Ok(inner.entries.remove(request_id).map(|e| e.cached))
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let inner = self.inner.lock();
        if inner.tainted {
            return Err(CacheError::Closed);
        }
        Ok(inner.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        self.len().map(|n| n == 0)
    }

    /// Advances the clock by one tick, sweeping only when an entry is due.
    pub fn advance(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.tainted {
            return;
        }
        inner.tick += 1;
        let tick = inner.tick;
        match inner.next_expiry {
            Some(next) if next <= tick => {}
            _ => return,
        }
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expiry > tick);
        inner.next_expiry = inner.entries.values().map(|e| e.expiry).min();
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            debug!(evicted, tick, "evicted expired requests from cache");
        }
    }

    /// Drops every entry; all later calls fail with [`CacheError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.next_expiry = None;
        inner.tainted = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().tainted
    }
}

impl<L: Clone + Send + 'static> RequestCache<L> {
    /// Ticks the cache every `tick` until `cancel` fires, then closes it.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tick: Duration,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cache.close();
                        debug!("request cache closed");
                        return;
                    }
                    _ = ticker.tick() => cache.advance(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> AccessRequest {
        let mut req = AccessRequest::pending("alice", vec!["admin".to_string()]);
        req.id = id.to_string();
        req
    }

    #[test]
    fn entry_survives_until_ttl() {
        let cache = RequestCache::new(60);
        cache.put(request("r1"), "C1/1".to_string()).unwrap();
        for _ in 0..59 {
            cache.advance();
        }
        let hit = cache.pop("r1").unwrap().expect("entry should still be cached");
        assert_eq!(hit.request.id, "r1");
        assert_eq!(hit.locator, "C1/1");
        assert!(cache.pop("r1").unwrap().is_none());
    }

    #[test]
    fn entry_is_evicted_after_ttl() {
        let cache = RequestCache::new(60);
        cache.put(request("r1"), ()).unwrap();
        for _ in 0..61 {
            cache.advance();
        }
        assert!(cache.pop("r1").unwrap().is_none());
    }

    #[test]
    fn sweep_recomputes_next_expiry() {
        let cache = RequestCache::new(10);
        cache.put(request("early"), ()).unwrap();
        for _ in 0..5 {
            cache.advance();
        }
        cache.put(request("late"), ()).unwrap();
        for _ in 0..5 {
            cache.advance();
        }
        assert!(cache.get("early").unwrap().is_none());
        assert!(cache.get("late").unwrap().is_some());
        for _ in 0..5 {
            cache.advance();
        }
        assert!(cache.get("late").unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn closed_cache_fails_loudly() {
        let cache = RequestCache::new(60);
        cache.put(request("r1"), ()).unwrap();
        cache.close();
        assert_eq!(cache.get("r1"), Err(CacheError::Closed));
        assert_eq!(cache.pop("r1"), Err(CacheError::Closed));
        assert_eq!(cache.put(request("r2"), ()), Err(CacheError::Closed));
        assert_eq!(cache.len(), Err(CacheError::Closed));
    }

    #[tokio::test]
    async fn sweeper_taints_cache_on_cancel() {
        let cache = Arc::new(RequestCache::new(60));
        cache.put(request("r1"), ()).unwrap();
        let cancel = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(&cancel, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("r1").unwrap().is_some());
        cancel.cancel();
        sweeper.await.unwrap();
        assert!(cache.is_closed());
        assert_eq!(cache.pop("r1"), Err(CacheError::Closed));
    }
}
