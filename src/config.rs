use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "offlinerelay.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Explicit path wins; otherwise `offlinerelay.toml` in the working
    /// directory; otherwise built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            return Self::from_path(default_path);
        }
        Ok(Self::default())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding the persisted queue blob.
    pub path: PathBuf,
    /// URL substrings an offline mutation must contain to be queued.
    /// Empty means queue every offline mutation.
    pub queue_only_for: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("offlinerelay-data"),
            queue_only_for: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub binary_body_policy: BinaryBodyPolicy,
}

/// What replay does with an entry whose body was captured only as a
/// marker: the payload itself is gone either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryBodyPolicy {
    /// Remove the entry with a warning; it can never replay faithfully.
    #[default]
    Discard,
    /// Reissue the request with an empty body.
    ReplayEmpty,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version tag naming the current cache generation.
    pub version: String,
    /// Pre-cached page served when navigation fails with no exact match.
    pub offline_fallback: String,
    /// Bounded cache size; oldest entries are evicted past this count.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: "offline-cache-v1".to_owned(),
            offline_fallback: "/offline.html".to_owned(),
            max_entries: 150,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::{BinaryBodyPolicy, Config, LogFormat};

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config.queue.path, std::path::Path::new("offlinerelay-data"));
        assert!(config.queue.queue_only_for.is_empty());
        assert_eq!(config.replay.binary_body_policy, BinaryBodyPolicy::Discard);
        assert_eq!(config.cache.version, "offline-cache-v1");
        assert_eq!(config.cache.offline_fallback, "/offline.html");
        assert_eq!(config.cache.max_entries, 150);
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = Config::from_toml_str(
            r#"
[queue]
path = "/var/lib/offlinerelay"
queue_only_for = ["/rest/v1/", "/storage/v1/"]

[replay]
binary_body_policy = "replay_empty"

[cache]
version = "app-cache-v7"
offline_fallback = "https://app.example/offline.html"
max_entries = 40

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();

        assert_eq!(
            config.queue.queue_only_for,
            vec!["/rest/v1/".to_owned(), "/storage/v1/".to_owned()]
        );
        assert_eq!(
            config.replay.binary_body_policy,
            BinaryBodyPolicy::ReplayEmpty
        );
        assert_eq!(config.cache.version, "app-cache-v7");
        assert_eq!(config.cache.max_entries, 40);
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn unknown_policy_value_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[replay]
binary_body_policy = "retry_forever"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse config TOML"), "err: {err:#}");
    }
}
