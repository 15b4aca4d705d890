//! Core of the access request bot: watch the authority's event stream, keep
//! per-plugin data consistent across instances, and resolve requests from
//! reviewer callbacks.

mod authority;
mod cache;
mod completion;
mod error;
mod http;
mod job;
mod memory;
mod plugin;
mod plugin_data;
mod server;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use accessbot_kernel::check_min_version;
use tracing::info;

pub use authority::{get_access_request, AccessRequestAuthority, RawEventStream};
pub use cache::{CacheError, CachedRequest, RequestCache, DEFAULT_TTL_TICKS, TICK};
pub use error::{Error, ErrorKind, Result};
pub use http::HttpAuthority;
pub use job::{
    EventHandler, FnHandler, Readiness, WatcherJob, WatcherJobConfig, DEFAULT_EVENT_TIMEOUT,
    DEFAULT_INIT_TIMEOUT,
};
pub use memory::MemoryAuthority;
pub use plugin::{
    notifier_from_config, AccessPlugin, LogNotifier, MessageCache, Notifier, WebhookNotifier,
};
pub use plugin_data::{CasRetry, PluginDataClient};
pub use server::{build_app, serve, AppState};
pub use watcher::Watcher;

pub fn authority_from_config(
    cfg: &accessbot_config::Authority,
) -> Result<Arc<dyn AccessRequestAuthority>> {
    match cfg.kind.as_str() {
        "memory" => Ok(Arc::new(MemoryAuthority::new())),
        "http" => Ok(Arc::new(HttpAuthority::from_config(cfg)?)),
        other => Err(Error::bad_parameter(format!(
            "unsupported authority type {other:?}"
        ))),
    }
}

/// Pings the authority and refuses servers older than `min_version`.
pub async fn check_authority(
    authority: &dyn AccessRequestAuthority,
    min_version: &str,
) -> Result<()> {
    let pong = authority
        .ping()
        .await
        .map_err(|err| err.context("ping authority"))?;
    check_min_version(&pong.server_version, min_version)?;
    info!(
        server_version = %pong.server_version,
        cluster = %pong.cluster_name,
        "connected to access request authority"
    );
    Ok(())
}

/// Everything `serve` needs, wired from one configuration.
pub struct Bot {
    pub authority: Arc<dyn AccessRequestAuthority>,
    pub cache: Arc<MessageCache>,
    pub job: WatcherJob,
    pub sweeper: tokio::task::JoinHandle<()>,
}

impl Bot {
    /// Spawns the cache sweeper and the watcher job under `cancel`.
    pub fn spawn(
        cfg: &accessbot_config::Config,
        authority: Arc<dyn AccessRequestAuthority>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Self> {
        let timeout = Duration::from_millis(cfg.authority.timeout_ms);
        let notifier = notifier_from_config(&cfg.notifier, timeout)?;
        let cache = Arc::new(MessageCache::new(cfg.cache.ttl_secs));
        let sweeper = cache.spawn_sweeper(cancel, TICK);
        let data = PluginDataClient::new(
            authority.clone(),
            cfg.plugin.name.clone(),
            CasRetry::from_config(&cfg.plugin_data),
        );
        let plugin = AccessPlugin::new(data, notifier, cache.clone());
        let job = WatcherJob::spawn(
            authority.clone(),
            WatcherJobConfig::from_config(&cfg.watcher),
            plugin,
            cancel,
        );
        Ok(Self {
            authority,
            cache,
            job,
            sweeper,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.authority.clone(),
            self.cache.clone(),
            self.job.readiness(),
        )
    }
}
