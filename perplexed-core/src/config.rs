use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Separator the producing service writes after every JSON record.
pub const DEFAULT_SEPARATOR: &str = "[/PERPLEXED-SEPARATOR]";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5000/stream_search";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointCfg {
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for EndpointCfg {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

fn default_url() -> String {
    DEFAULT_ENDPOINT.to_string()
}

/// What to do with bytes left after the last separator when the stream ends.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrailingPolicy {
    /// Drop the remainder (logged at warn level).
    #[default]
    Discard,
    /// Parse the remainder as one last record.
    Flush,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub trailing: TrailingPolicy,
    /// Bound of the driver's event queue.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            trailing: TrailingPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}
fn default_channel_capacity() -> usize {
    64
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 120000ms). Covers the whole streamed body.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::SearchError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::SearchError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::SearchError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::SearchError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::SearchError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::SearchError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::error::CoreResult<()> {
        if self.stream.separator.is_empty() {
            return Err(crate::error::SearchError::Validation(
                "stream.separator must not be empty".into(),
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(crate::error::SearchError::Validation(
                "stream.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
