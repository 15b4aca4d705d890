use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource kind under which access requests and their plugin data live.
pub const KIND_ACCESS_REQUEST: &str = "access_request";

pub type PluginDataMap = BTreeMap<String, String>;

pub type Annotations = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Denied => "denied",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestState::Pending),
            "approved" => Some(RequestState::Approved),
            "denied" => Some(RequestState::Denied),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream payloads may carry only some fields; missing ones take the
/// defaults of an empty pending request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessRequest {
    pub id: String,
    pub user: String,
    pub roles: Vec<String>,
    pub request_reason: String,
    pub resolve_reason: String,
    pub state: RequestState,
    pub created: DateTime<Utc>,
    pub suggested_reviewers: Vec<String>,
    pub system_annotations: Annotations,
    pub resolve_annotations: Annotations,
}

impl Default for AccessRequest {
    fn default() -> Self {
        Self::pending(String::new(), Vec::new())
    }
}

impl AccessRequest {
    /// A fresh pending request; the authority assigns the final id on create.
    pub fn pending(user: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            id: String::new(),
            user: user.into(),
            roles,
            request_reason: String::new(),
            resolve_reason: String::new(),
            state: RequestState::Pending,
            created: Utc::now(),
            suggested_reviewers: Vec::new(),
            system_annotations: Annotations::new(),
            resolve_annotations: Annotations::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.request_reason = reason.into();
        self
    }
}

/// Typed event delivered to watcher consumers.
///
/// A `Put` carries the stream's snapshot, which can be partial or stale;
/// only its id is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init,
    Put(AccessRequest),
    Delete { request_id: String },
}

impl Event {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Event::Init => None,
            Event::Put(req) => Some(&req.id),
            Event::Delete { request_id } => Some(request_id),
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Event::Init => "init",
            Event::Put(_) => "put",
            Event::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RawOp {
    Init,
    Put,
    Delete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawResource {
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AccessRequest>,
}

/// Event exactly as it arrives on the authority stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub op: RawOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<RawResource>,
}

impl RawEvent {
    pub fn init() -> Self {
        Self {
            op: RawOp::Init,
            resource: None,
        }
    }

    pub fn put(req: AccessRequest) -> Self {
        Self {
            op: RawOp::Put,
            resource: Some(RawResource {
                kind: KIND_ACCESS_REQUEST.to_string(),
                name: req.id.clone(),
                request: Some(req),
            }),
        }
    }

    pub fn delete(request_id: impl Into<String>) -> Self {
        Self {
            op: RawOp::Delete,
            resource: Some(RawResource {
                kind: KIND_ACCESS_REQUEST.to_string(),
                name: request_id.into(),
                request: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchFilter {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RequestState>,
}

impl WatchFilter {
    pub fn access_requests() -> Self {
        Self {
            kind: KIND_ACCESS_REQUEST.to_string(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: RequestState) -> Self {
        self.state = Some(state);
        self
    }

    /// Whether a Put for `req` passes this filter. Deletes always pass.
    pub fn matches(&self, req: &AccessRequest) -> bool {
        self.kind == KIND_ACCESS_REQUEST && self.state.map(|s| s == req.state).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RequestState>,
}

impl RequestFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, req: &AccessRequest) -> bool {
        self.id.as_ref().map(|v| *v == req.id).unwrap_or(true)
            && self.user.as_ref().map(|v| *v == req.user).unwrap_or(true)
            && self.state.map(|s| s == req.state).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: RequestState,
    pub delegator: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginDataKey {
    pub kind: String,
    pub resource: String,
    pub plugin: String,
}

impl PluginDataKey {
    pub fn access_request(request_id: &str, plugin: &str) -> Self {
        Self {
            kind: KIND_ACCESS_REQUEST.to_string(),
            resource: request_id.to_string(),
            plugin: plugin.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDataUpdate {
    pub set: PluginDataMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<PluginDataMap>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingResponse {
    pub server_version: String,
    pub cluster_name: String,
    #[serde(default)]
    pub proxy_public_addr: String,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
