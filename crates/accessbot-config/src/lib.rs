use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub authority: Authority,
    pub plugin: Plugin,
    #[serde(default)]
    pub watcher: Watcher,
    #[serde(default)]
    pub plugin_data: PluginData,
    #[serde(default)]
    pub cache: Cache,
    pub server: Server,
    #[serde(default)]
    pub notifier: Notifier,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_authority_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_server_version")]
    pub min_server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watcher {
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginData {
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
    #[serde(default = "default_cas_backoff_step_ms")]
    pub cas_backoff_step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notifier {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Watcher {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            event_timeout_ms: default_event_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for PluginData {
    fn default() -> Self {
        Self {
            cas_max_attempts: default_cas_max_attempts(),
            cas_backoff_step_ms: default_cas_backoff_step_ms(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            kind: "log".to_string(),
            webhook_url: None,
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_authority_timeout_ms() -> u64 {
    10_000
}

fn default_min_server_version() -> String {
    "1.0.0".to_string()
}

fn default_init_timeout_ms() -> u64 {
    15_000
}

fn default_event_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_cas_max_attempts() -> u32 {
    3
}

fn default_cas_backoff_step_ms() -> u64 {
    200
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.authority.kind != "memory" && cfg.authority.kind != "http" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "authority.type={} is not implemented; supported: memory, http",
            cfg.authority.kind
        )));
    }
    if cfg.authority.kind == "http"
        && cfg
            .authority
            .endpoint
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "authority.endpoint is required when authority.type=http".to_string(),
        ));
    }
    if cfg.authority.kind == "memory" && cfg.authority.endpoint.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "authority.endpoint is not supported when authority.type=memory".to_string(),
        ));
    }
    if cfg.plugin.name.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "plugin.name must not be empty".to_string(),
        ));
    }
    if cfg.watcher.event_timeout_ms == 0 || cfg.watcher.init_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "watcher timeouts must be >= 1".to_string(),
        ));
    }
    if cfg.watcher.backoff_max_ms < cfg.watcher.backoff_base_ms {
        return Err(ConfigError::UnsupportedConfig(
            "watcher.backoff_max_ms must be >= watcher.backoff_base_ms".to_string(),
        ));
    }
    if cfg.plugin_data.cas_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "plugin_data.cas_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.cache.ttl_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.ttl_secs must be >= 1".to_string(),
        ));
    }
    match cfg.notifier.kind.as_str() {
        "log" => {}
        "webhook" => {
            if cfg
                .notifier
                .webhook_url
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "notifier.webhook_url is required when notifier.type=webhook".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "notifier.type={other} is not implemented; supported: log, webhook"
            )))
        }
    }
    if cfg.log.format != "text" && cfg.log.format != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "log.format={} is not implemented; supported: text, json",
            cfg.log.format
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("accessbot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
authority:
  type: "memory"

plugin:
  name: "accessbot"

server:
  listen_addr: "127.0.0.1:0"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_to_minimal_config() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.watcher.event_timeout_ms, 5_000);
        assert_eq!(cfg.watcher.backoff_max_ms, 2_000);
        assert_eq!(cfg.plugin_data.cas_max_attempts, 3);
        assert_eq!(cfg.plugin_data.cas_backoff_step_ms, 200);
        assert_eq!(cfg.cache.ttl_secs, 3_600);
        assert_eq!(cfg.notifier.kind, "log");
        assert_eq!(cfg.log.format, "text");
    }

    #[test]
    fn supports_http_authority_with_endpoint() {
        let cfg = parse_and_validate(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"http\"\n  endpoint: \"http://127.0.0.1:3025\"",
        ))
        .expect("http config should be accepted");
        assert_eq!(cfg.authority.kind, "http");
        assert_eq!(
            cfg.authority.endpoint.as_deref(),
            Some("http://127.0.0.1:3025")
        );
    }

    #[test]
    fn rejects_http_authority_without_endpoint() {
        let err = parse_and_validate(&base_yaml().replace("type: \"memory\"", "type: \"http\""))
            .expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_authority_type() {
        let err = parse_and_validate(&base_yaml().replace("type: \"memory\"", "type: \"grpc\""))
            .expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_webhook_notifier_without_url() {
        let yaml = format!("{}\nnotifier:\n  type: \"webhook\"\n", base_yaml());
        let err = parse_and_validate(&yaml).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_missing_plugin_section() {
        let yaml = base_yaml().replace("plugin:\n  name: \"accessbot\"\n", "");
        let err = parse_and_validate(&yaml).expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn reports_missing_file() {
        let err = load_and_validate("/nonexistent/accessbot.yaml").expect_err("missing file");
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
