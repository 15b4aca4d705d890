use accessbot_contracts::{
    AccessRequest, PingResponse, PluginDataKey, PluginDataMap, RawEvent, RequestFilter,
    StateUpdate, WatchFilter,
};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// One stream attempt. The stream ends (`None`) when the authority closes it.
pub type RawEventStream = BoxStream<'static, Result<RawEvent>>;

/// Everything the bot needs from the access-request authority.
///
/// Adapters classify their own transport failures into
/// [`ErrorKind`](crate::ErrorKind); callers never inspect transport errors.
#[async_trait]
pub trait AccessRequestAuthority: Send + Sync {
    async fn ping(&self) -> Result<PingResponse>;

    async fn create_access_request(&self, req: AccessRequest) -> Result<AccessRequest>;

    async fn get_access_requests(&self, filter: &RequestFilter) -> Result<Vec<AccessRequest>>;

    async fn set_access_request_state(&self, id: &str, update: StateUpdate) -> Result<()>;

    async fn watch_events(&self, filter: &WatchFilter) -> Result<RawEventStream>;

    /// Missing entries may be reported as `NotFound` or as an empty map.
    async fn get_plugin_data(&self, key: &PluginDataKey) -> Result<PluginDataMap>;

    /// Applies `set` if every key in `expect` currently holds the expected
    /// value (`""` meaning absent). Empty values in `set` delete keys.
    async fn update_plugin_data(
        &self,
        key: &PluginDataKey,
        set: PluginDataMap,
        expect: Option<PluginDataMap>,
    ) -> Result<()>;
}

/// Fetch a single request by id, mapping "no match" to `NotFound`.
pub async fn get_access_request(
    authority: &dyn AccessRequestAuthority,
    id: &str,
) -> Result<AccessRequest> {
    authority
        .get_access_requests(&RequestFilter::by_id(id))
        .await?
        .into_iter()
        .find(|req| req.id == id)
        .ok_or_else(|| crate::Error::not_found(format!("access request {id} not found")))
}
