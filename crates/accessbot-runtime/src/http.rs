use std::time::Duration;

use accessbot_contracts::{
    AccessRequest, ErrorResponse, PingResponse, PluginDataKey, PluginDataMap, PluginDataUpdate,
    RawEvent, RequestFilter, StateUpdate, WatchFilter,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::authority::{AccessRequestAuthority, RawEventStream};
use crate::error::{Error, ErrorKind, Result};

/// Authority reached over JSON/HTTP, with the event feed as NDJSON.
pub struct HttpAuthority {
    endpoint: String,
    client: Client,
    stream_client: Client,
}

impl HttpAuthority {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::bad_parameter(e.to_string()))?;
        // The event feed stays open indefinitely; only bound the connect.
        let stream_client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::bad_parameter(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    pub fn from_config(cfg: &accessbot_config::Authority) -> Result<Self> {
        let endpoint = cfg
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::bad_parameter("authority.endpoint is required"))?;
        Self::new(endpoint, Duration::from_millis(cfg.timeout_ms))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn plugin_data_url(&self, key: &PluginDataKey) -> String {
        self.url(&format!(
            "/v1/plugin-data/{}/{}/{}",
            key.kind, key.resource, key.plugin
        ))
    }
}

#[async_trait]
impl AccessRequestAuthority for HttpAuthority {
    async fn ping(&self) -> Result<PingResponse> {
        read_json(send(self.client.get(self.url("/v1/ping"))).await?).await
    }

    async fn create_access_request(&self, req: AccessRequest) -> Result<AccessRequest> {
        read_json(send(self.client.post(self.url("/v1/access-requests")).json(&req)).await?).await
    }

    async fn get_access_requests(&self, filter: &RequestFilter) -> Result<Vec<AccessRequest>> {
        let mut query = Vec::new();
        if let Some(id) = &filter.id {
            query.push(("id", id.clone()));
        }
        if let Some(user) = &filter.user {
            query.push(("user", user.clone()));
        }
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        read_json(
            send(
                self.client
                    .get(self.url("/v1/access-requests"))
                    .query(&query),
            )
            .await?,
        )
        .await
    }

    async fn set_access_request_state(&self, id: &str, update: StateUpdate) -> Result<()> {
        send(
            self.client
                .put(self.url(&format!("/v1/access-requests/{id}/state")))
                .json(&update),
        )
        .await?;
        Ok(())
    }

    async fn watch_events(&self, filter: &WatchFilter) -> Result<RawEventStream> {
        let mut query = vec![("kind", filter.kind.clone())];
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        let response = send(
            self.stream_client
                .get(self.url("/v1/events"))
                .query(&query),
        )
        .await?;
        debug!(endpoint = %self.endpoint, "opened event stream");
        Ok(ndjson_events(response.bytes_stream().boxed()))
    }

    async fn get_plugin_data(&self, key: &PluginDataKey) -> Result<PluginDataMap> {
        read_json(send(self.client.get(self.plugin_data_url(key))).await?).await
    }

    async fn update_plugin_data(
        &self,
        key: &PluginDataKey,
        set: PluginDataMap,
        expect: Option<PluginDataMap>,
    ) -> Result<()> {
        send(
            self.client
                .put(self.plugin_data_url(key))
                .json(&PluginDataUpdate { set, expect }),
        )
        .await?;
        Ok(())
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    Err(Error::new(classify_status(status), message))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::bad_parameter(format!("decode authority response: {e}")))
}

pub(crate) fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::BadParameter,
        StatusCode::NOT_FOUND | StatusCode::GONE => ErrorKind::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ErrorKind::CompareFailed,
        StatusCode::NOT_IMPLEMENTED => ErrorKind::NotImplemented,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::DeadlineExceeded,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::ConnectionProblem,
        _ => ErrorKind::Internal,
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::deadline_exceeded(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Error::connection_problem(err.to_string())
    } else if err.is_decode() {
        Error::bad_parameter(err.to_string())
    } else {
        Error::connection_problem(err.to_string())
    }
}

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

struct LineReader {
    body: ByteStream,
    buf: Vec<u8>,
    finished: bool,
}

/// Splits a byte stream into newline-delimited JSON events. A broken body is a
/// connection problem; the body ending is the end of the stream.
pub(crate) fn ndjson_events(body: ByteStream) -> RawEventStream {
    let reader = LineReader {
        body,
        buf: Vec::new(),
        finished: false,
    };
    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                let line = trim_line(&line);
                if line.is_empty() {
                    continue;
                }
                let item = serde_json::from_slice::<RawEvent>(line)
                    .map_err(|e| Error::bad_parameter(format!("malformed event on stream: {e}")));
                return Some((item, reader));
            }
            if reader.finished {
                let rest = std::mem::take(&mut reader.buf);
                let rest = trim_line(&rest);
                if rest.is_empty() {
                    return None;
                }
                let item = serde_json::from_slice::<RawEvent>(rest)
                    .map_err(|e| Error::bad_parameter(format!("malformed event on stream: {e}")));
                return Some((item, reader));
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    reader.finished = true;
                    reader.buf.clear();
                    return Some((Err(classify_transport(err)), reader));
                }
                None => reader.finished = true,
            }
        }
    })
    .boxed()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((last, rest)) = line.split_last() {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}
