use std::fmt;
use std::time::Duration;

use accessbot_contracts::PluginDataMap;
use thiserror::Error;

/// A plugin's own view of the plugin data blob.
///
/// Implementations must be deterministic: `decode(&encode(v)) == v` for
/// every value inside the schema's documented alphabet, and
/// `encode(&decode(m)) == m` for every map `encode` can produce from one.
pub trait PluginDataCodec: Default + Clone + PartialEq {
    fn encode(&self) -> PluginDataMap;
    fn decode(map: &PluginDataMap) -> Self;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolutionTag {
    #[default]
    Unresolved,
    Approved,
    Denied,
    Expired,
}

impl ResolutionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionTag::Unresolved => "",
            ResolutionTag::Approved => "approved",
            ResolutionTag::Denied => "denied",
            ResolutionTag::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "approved" => ResolutionTag::Approved,
            "denied" => ResolutionTag::Denied,
            "expired" => ResolutionTag::Expired,
            _ => ResolutionTag::Unresolved,
        }
    }
}

impl fmt::Display for ResolutionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub tag: ResolutionTag,
    pub reason: String,
}

/// Where a notification about a request ended up on the provider side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel_id: String,
    pub message_id: String,
}

/// Plugin data of the reference access plugin.
///
/// Roles are stored comma-joined and messages as comma-joined
/// `channel/message` pairs, so the encoding only round-trips when roles are
/// non-empty and comma-free, channel ids contain neither `,` nor `/`, and
/// message ids contain no `,`. Message ids may contain `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPluginData {
    pub user: String,
    pub roles: Vec<String>,
    pub request_reason: String,
    pub reviews_count: u32,
    pub resolution: Resolution,
    pub messages: Vec<PostedMessage>,
}

impl AccessPluginData {
    pub fn is_resolved(&self) -> bool {
        self.resolution.tag != ResolutionTag::Unresolved
    }
}

impl PluginDataCodec for AccessPluginData {
    fn encode(&self) -> PluginDataMap {
        let mut out = PluginDataMap::new();
        out.insert("user".to_string(), self.user.clone());
        out.insert("roles".to_string(), self.roles.join(","));
        out.insert("request_reason".to_string(), self.request_reason.clone());
        out.insert(
            "reviews_count".to_string(),
            if self.reviews_count == 0 {
                String::new()
            } else {
                self.reviews_count.to_string()
            },
        );
        out.insert(
            "resolution".to_string(),
            self.resolution.tag.as_str().to_string(),
        );
        out.insert(
            "resolve_reason".to_string(),
            self.resolution.reason.clone(),
        );
        out.insert(
            "messages".to_string(),
            self.messages
                .iter()
                .map(|m| format!("{}/{}", m.channel_id, m.message_id))
                .collect::<Vec<_>>()
                .join(","),
        );
        out
    }

    fn decode(map: &PluginDataMap) -> Self {
        let field = |key: &str| map.get(key).cloned().unwrap_or_default();
        let roles = match map.get("roles").map(|v| v.as_str()) {
            None | Some("") => Vec::new(),
            Some(v) => v.split(',').map(str::to_string).collect(),
        };
        let messages = match map.get("messages").map(|v| v.as_str()) {
            None | Some("") => Vec::new(),
            Some(v) => v
                .split(',')
                .filter_map(|pair| {
                    let (channel_id, message_id) = pair.split_once('/')?;
                    Some(PostedMessage {
                        channel_id: channel_id.to_string(),
                        message_id: message_id.to_string(),
                    })
                })
                .collect(),
        };
        Self {
            user: field("user"),
            roles,
            request_reason: field("request_reason"),
            reviews_count: map
                .get("reviews_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            resolution: Resolution {
                tag: ResolutionTag::parse(&field("resolution")),
                reason: field("resolve_reason"),
            },
            messages,
        }
    }
}

/// Bounded exponential backoff for stream reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Delay before retrying a compare-and-swap conflict; `attempt` starts at 1.
pub fn cas_retry_delay(attempt: u32, step: Duration) -> Duration {
    step.saturating_mul(attempt.max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid version {0:?}")]
    Invalid(String),
    #[error("server version {server} is older than the required {required}")]
    TooOld { server: String, required: String },
}

/// Fails unless `server` is at least `required` (major.minor.patch).
pub fn check_min_version(server: &str, required: &str) -> Result<(), VersionError> {
    let have = parse_version(server)?;
    let want = parse_version(required)?;
    if have < want {
        return Err(VersionError::TooOld {
            server: server.to_string(),
            required: required.to_string(),
        });
    }
    Ok(())
}

fn parse_version(value: &str) -> Result<(u64, u64, u64), VersionError> {
    let trimmed = value.trim().trim_start_matches('v');
    let core = trimmed
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let mut parts = core.split('.');
    let mut next = || -> Result<u64, VersionError> {
        match parts.next() {
            None => Ok(0),
            Some(p) => p
                .parse::<u64>()
                .map_err(|_| VersionError::Invalid(value.to_string())),
        }
    };
    let parsed = (next()?, next()?, next()?);
    if core.is_empty() || parts.next().is_some() {
        return Err(VersionError::Invalid(value.to_string()));
    }
    Ok(parsed)
}
