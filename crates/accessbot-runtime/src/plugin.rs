use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::{AccessRequest, Event, RequestState};
use accessbot_kernel::{AccessPluginData, PostedMessage, Resolution, ResolutionTag};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::get_access_request;
use crate::cache::RequestCache;
use crate::error::{Error, Result};
use crate::http::{classify_status, classify_transport};
use crate::job::EventHandler;
use crate::plugin_data::PluginDataClient;

/// Where the bot announces requests and their outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_request(&self, req: &AccessRequest) -> Result<Vec<PostedMessage>>;

    async fn update_resolution(
        &self,
        messages: &[PostedMessage],
        request_id: &str,
        resolution: &Resolution,
    ) -> Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post_request(&self, req: &AccessRequest) -> Result<Vec<PostedMessage>> {
        info!(
            request_id = %req.id,
            user = %req.user,
            roles = %req.roles.join(","),
            reason = %req.request_reason,
            "new access request"
        );
        Ok(vec![PostedMessage {
            channel_id: "log".to_string(),
            message_id: req.id.clone(),
        }])
    }

    async fn update_resolution(
        &self,
        messages: &[PostedMessage],
        request_id: &str,
        resolution: &Resolution,
    ) -> Result<()> {
        info!(
            request_id,
            resolution = %resolution.tag,
            reason = %resolution.reason,
            messages = messages.len(),
            "access request resolved"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// POSTs JSON documents to a single URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::bad_parameter(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(
                classify_status(status),
                format!("webhook answered {status}"),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn post_request(&self, req: &AccessRequest) -> Result<Vec<PostedMessage>> {
        let response = self
            .post(json!({
                "event": "request_created",
                "request_id": req.id,
                "user": req.user,
                "roles": req.roles,
                "reason": req.request_reason,
                "suggested_reviewers": req.suggested_reviewers,
            }))
            .await?;
        // The reply body is optional; a bare 2xx still counts as posted.
        let reply: WebhookReply = response.json().await.unwrap_or_default();
        Ok(vec![PostedMessage {
            channel_id: reply.channel_id.unwrap_or_else(|| "webhook".to_string()),
            message_id: reply.message_id.unwrap_or_else(|| req.id.clone()),
        }])
    }

    async fn update_resolution(
        &self,
        messages: &[PostedMessage],
        request_id: &str,
        resolution: &Resolution,
    ) -> Result<()> {
        let messages: Vec<_> = messages
            .iter()
            .map(|m| json!({"channel_id": m.channel_id, "message_id": m.message_id}))
            .collect();
        self.post(json!({
            "event": "request_resolved",
            "request_id": request_id,
            "resolution": resolution.tag.as_str(),
            "reason": resolution.reason,
            "messages": messages,
        }))
        .await?;
        Ok(())
    }
}

pub fn notifier_from_config(
    cfg: &accessbot_config::Notifier,
    timeout: Duration,
) -> Result<Arc<dyn Notifier>> {
    match cfg.kind.as_str() {
        "log" => Ok(Arc::new(LogNotifier)),
        "webhook" => {
            let url = cfg
                .webhook_url
                .as_deref()
                .ok_or_else(|| Error::bad_parameter("notifier.webhook_url is required"))?;
            Ok(Arc::new(WebhookNotifier::new(url, timeout)?))
        }
        other => Err(Error::bad_parameter(format!(
            "unsupported notifier type {other:?}"
        ))),
    }
}

pub type MessageCache = RequestCache<Vec<PostedMessage>>;

/// Announces new requests once per cluster and records their outcome in
/// plugin data.
pub struct AccessPlugin {
    data: PluginDataClient,
    notifier: Arc<dyn Notifier>,
    cache: Arc<MessageCache>,
}

impl AccessPlugin {
    pub fn new(
        data: PluginDataClient,
        notifier: Arc<dyn Notifier>,
        cache: Arc<MessageCache>,
    ) -> Self {
        Self {
            data,
            notifier,
            cache,
        }
    }

    /// The stream's snapshot is only trusted for its id.
    async fn on_put(&self, snapshot: AccessRequest) -> Result<()> {
        let req = match get_access_request(self.data.authority(), &snapshot.id).await {
            Ok(req) => req,
            Err(err) if err.is_not_found() => {
                debug!(request_id = %snapshot.id, "request is gone, treating it as expired");
                return self.on_delete(&snapshot.id).await;
            }
            Err(err) => return Err(err),
        };
        match req.state {
            RequestState::Pending => self.on_pending(req).await,
            RequestState::Approved | RequestState::Denied => self.on_resolved(req).await,
        }
    }

    async fn on_pending(&self, req: AccessRequest) -> Result<()> {
        let existing: AccessPluginData = self.data.get_typed(&req.id).await?;
        if !existing.messages.is_empty() {
            debug!(request_id = %req.id, "request already announced");
            self.cache.put(req, existing.messages)?;
            return Ok(());
        }

        let messages = match self.notifier.post_request(&req).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(request_id = %req.id, error = %err, "failed to post access request");
                self.cache.put(req, Vec::new())?;
                return Ok(());
            }
        };

        let written = self
            .data
            .update::<AccessPluginData, _>(&req.id, |data| {
                if !data.messages.is_empty() {
                    return false;
                }
                data.user = req.user.clone();
                data.roles = req.roles.clone();
                data.request_reason = req.request_reason.clone();
                data.messages = messages.clone();
                true
            })
            .await?;
        let messages = match written {
            Some(data) => data.messages,
            None => {
                debug!(request_id = %req.id, "another instance announced the request first");
                self.data
                    .get_typed::<AccessPluginData>(&req.id)
                    .await?
                    .messages
            }
        };
        self.cache.put(req, messages)?;
        Ok(())
    }

    async fn on_resolved(&self, req: AccessRequest) -> Result<()> {
        let tag = match req.state {
            RequestState::Approved => ResolutionTag::Approved,
            RequestState::Denied => ResolutionTag::Denied,
            RequestState::Pending => return Ok(()),
        };
        self.cache.pop(&req.id)?;
        let resolution = Resolution {
            tag,
            reason: req.resolve_reason.clone(),
        };
        let written = self
            .data
            .update::<AccessPluginData, _>(&req.id, |data| {
                if data.is_resolved() {
                    return false;
                }
                data.resolution = resolution.clone();
                true
            })
            .await?;
        match written {
            Some(data) => self.notify_resolution(&data.messages, &req.id, &resolution).await,
            None => debug!(request_id = %req.id, "request already resolved"),
        }
        Ok(())
    }

    async fn on_delete(&self, request_id: &str) -> Result<()> {
        let cached = self.cache.pop(request_id)?;
        let resolution = Resolution {
            tag: ResolutionTag::Expired,
            reason: String::new(),
        };
        let written = self
            .data
            .update::<AccessPluginData, _>(request_id, |data| {
                if data.is_resolved() {
                    return false;
                }
                data.resolution = resolution.clone();
                true
            })
            .await;
        let messages = match written {
            Ok(Some(data)) => Some(data.messages),
            Ok(None) => None,
            // Plugin data usually goes away together with the request.
            Err(err) if err.is_not_found() => cached.map(|c| c.locator),
            Err(err) => return Err(err),
        };
        if let Some(messages) = messages {
            self.notify_resolution(&messages, request_id, &resolution)
                .await;
        }
        Ok(())
    }

    async fn notify_resolution(
        &self,
        messages: &[PostedMessage],
        request_id: &str,
        resolution: &Resolution,
    ) {
        if let Err(err) = self
            .notifier
            .update_resolution(messages, request_id, resolution)
            .await
        {
            warn!(request_id, error = %err, "failed to update notification");
        }
    }
}

#[async_trait]
impl EventHandler for AccessPlugin {
    async fn handle(&self, cancel: CancellationToken, event: Event) -> Result<()> {
        let work = async {
            match event {
                Event::Init => Ok(()),
                Event::Put(snapshot) => self.on_put(snapshot).await,
                Event::Delete { request_id } => self.on_delete(&request_id).await,
            }
        };
        tokio::select! {
            result = work => result,
            _ = cancel.cancelled() => Err(Error::canceled("event handling canceled")),
        }
    }
}
